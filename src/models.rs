use crate::geo::{GeoPoint, Positioned};
use serde::{Deserialize, Serialize};

/// Stored location of an extra. `location` is the encrypted point, only
/// `geo_index` is kept in clear.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Location<I> {
    pub extra_id: String,
    pub geo_index: I,
    pub location: String,
    pub key_version: i32,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct LocationCommand<I> {
    pub extra_id: String,
    pub geo_index: I,
    pub location: String,
    pub key_version: i32,
}

/// A stored location after decryption, only alive for the duration of a search.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub extra_id: String,
    pub point: GeoPoint,
}

impl Positioned for Candidate {
    fn position(&self) -> GeoPoint {
        self.point
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct NearbyExtra {
    pub extra_id: String,
    pub display_latitude: f64,
    pub display_longitude: f64,
    pub distance_km: f64,
}

/// Bounds of the random displacement applied to displayed coordinates.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DisplayRange {
    pub min_km: f64,
    pub max_km: f64,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub(crate) struct ReencryptReport {
    pub scanned: u64,
    pub rekeyed: u64,
    pub skipped: u64,
    pub failed: u64,
}
