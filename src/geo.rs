use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, TAU};

pub(crate) const EARTH_RADIUS_KM: f64 = 6371.0;

/// Length of one degree of latitude (and of longitude at the equator).
pub(crate) const KM_PER_DEGREE: f64 = 2.0 * PI * EARTH_RADIUS_KM / 360.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub(crate) struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }
}

pub(crate) trait Positioned {
    fn position(&self) -> GeoPoint;
}

impl Positioned for GeoPoint {
    fn position(&self) -> GeoPoint {
        *self
    }
}

/// A candidate together with its distance to the search center, computed on the
/// true coordinates.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Ranked<T> {
    pub item: T,
    pub distance_km: f64,
}

/// Great-circle distance in kilometers (Haversine).
///
/// Inputs are not range checked: NaN or out-of-range degrees yield a NaN or
/// meaningless result rather than an error.
pub(crate) fn distance_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let delta_lat = (b.latitude - a.latitude).to_radians();
    let delta_lon = (b.longitude - a.longitude).to_radians();

    let h = (delta_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Moves `point` by a uniformly random bearing and a uniformly random distance
/// in `[min_km, max_km]`, using a planar approximation. Used for display only.
///
/// # Panics
///
/// Panics if either bound is not finite.
pub(crate) fn randomize<R: Rng + ?Sized>(point: GeoPoint, min_km: f64, max_km: f64, rng: &mut R) -> GeoPoint {
    let (low, high) = if min_km <= max_km { (min_km, max_km) } else { (max_km, min_km) };
    let bearing = rng.gen_range(0.0..TAU);
    let dist = rng.gen_range(low..=high);

    let lat_scale = point.latitude.to_radians().cos().abs().max(1e-6);
    let latitude = point.latitude + dist * bearing.cos() / KM_PER_DEGREE;
    let longitude = point.longitude + dist * bearing.sin() / (KM_PER_DEGREE * lat_scale);

    GeoPoint {
        latitude: latitude.clamp(-90.0, 90.0),
        longitude: wrap_longitude(longitude),
    }
}

fn wrap_longitude(lon: f64) -> f64 {
    if (-180.0..=180.0).contains(&lon) {
        return lon;
    }
    (lon + 180.0).rem_euclid(360.0) - 180.0
}

/// Keeps the candidates whose true distance to `center` is at most `max_km`,
/// in input order.
pub(crate) fn within_radius<T, C>(candidates: C, center: GeoPoint, max_km: f64) -> Vec<Ranked<T>>
where
    T: Positioned,
    C: IntoIterator<Item = T>,
{
    candidates
        .into_iter()
        .filter_map(|item| {
            let distance_km = distance_km(item.position(), center);
            (distance_km <= max_km).then(|| Ranked { item, distance_km })
        })
        .collect()
}

/// Stable: candidates at equal distance keep their relative order.
pub(crate) fn sort_by_distance<T>(ranked: &mut [Ranked<T>]) {
    ranked.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
}

/// Radius visible in a map viewport: center to north-east corner.
pub(crate) fn viewport_radius_km(center: GeoPoint, north_east: GeoPoint) -> f64 {
    distance_km(center, north_east)
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const PARIS: GeoPoint = GeoPoint { latitude: 48.8566, longitude: 2.3522 };
    const LYON: GeoPoint = GeoPoint { latitude: 45.7640, longitude: 4.8357 };

    #[test]
    fn test_paris_lyon() {
        let d = distance_km(PARIS, LYON);
        assert!((d - 392.0).abs() < 1.0, "got {}", d);
    }

    #[test]
    fn test_identical_points() {
        assert_eq!(distance_km(PARIS, PARIS), 0.0);
    }

    #[test]
    fn test_antipodal_points() {
        let d = distance_km(GeoPoint::new(0.0, 0.0), GeoPoint::new(0.0, 180.0));
        assert!((d - PI * EARTH_RADIUS_KM).abs() < 1e-6);
    }

    #[test]
    fn test_nan_propagates() {
        assert!(distance_km(GeoPoint::new(f64::NAN, 0.0), PARIS).is_nan());
    }

    #[test]
    fn test_is_valid() {
        assert!(PARIS.is_valid());
        assert!(GeoPoint::new(-90.0, 180.0).is_valid());
        assert!(!GeoPoint::new(90.5, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, -180.1).is_valid());
        assert!(!GeoPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_randomize_fixed_distance() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let p = randomize(PARIS, 2.0, 2.0, &mut rng);
            assert!((distance_km(PARIS, p) - 2.0).abs() < 0.02);
        }
    }

    #[test]
    fn test_randomize_swapped_bounds() {
        let mut rng = StdRng::seed_from_u64(11);
        let p = randomize(LYON, 3.0, 1.0, &mut rng);
        let d = distance_km(LYON, p);
        assert!(d >= 0.99 && d <= 3.03, "got {}", d);
    }

    #[test]
    fn test_randomize_wraps_antimeridian() {
        let mut rng = StdRng::seed_from_u64(3);
        let p = randomize(GeoPoint::new(0.0, 179.999), 5.0, 5.0, &mut rng);
        assert!(p.is_valid());
    }

    #[test]
    fn test_within_radius_inclusive() {
        let d = distance_km(PARIS, LYON);
        let got = within_radius(vec![LYON], PARIS, d);
        assert_eq!(got.len(), 1);
        assert!(within_radius(vec![LYON], PARIS, d - 1e-6).is_empty());
    }

    #[test]
    fn test_within_radius_brute_force() {
        let mut rng = StdRng::seed_from_u64(42);
        let points: Vec<GeoPoint> = (0..100).map(|_| randomize(PARIS, 0.0, 1000.0, &mut rng)).collect();
        let got: Vec<GeoPoint> = within_radius(points.clone(), PARIS, 10.0).into_iter().map(|r| r.item).collect();
        let expected: Vec<GeoPoint> = points.into_iter().filter(|p| distance_km(*p, PARIS) <= 10.0).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_sort_by_distance() {
        let mut ranked = within_radius(vec![LYON, PARIS], PARIS, 1000.0);
        sort_by_distance(&mut ranked);
        assert_eq!(ranked[0].item, PARIS);
        assert_eq!(ranked[1].item, LYON);
    }

    #[test]
    fn test_sort_by_distance_is_stable() {
        let mut ranked = vec![
            Ranked { item: "a", distance_km: 1.0 },
            Ranked { item: "b", distance_km: 1.0 },
            Ranked { item: "c", distance_km: 0.5 },
        ];
        sort_by_distance(&mut ranked);
        let order: Vec<&str> = ranked.iter().map(|r| r.item).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_viewport_radius() {
        let ne = GeoPoint::new(PARIS.latitude + 1.0, PARIS.longitude);
        let r = viewport_radius_km(PARIS, ne);
        assert!((r - KM_PER_DEGREE).abs() < 1e-6);
    }

    fn point() -> impl Strategy<Value = GeoPoint> {
        (-90.0f64..=90.0, -180.0f64..=180.0).prop_map(|(lat, lon)| GeoPoint::new(lat, lon))
    }

    proptest! {
        #[test]
        fn prop_distance_to_self_is_zero(p in point()) {
            prop_assert_eq!(distance_km(p, p), 0.0);
        }

        #[test]
        fn prop_distance_is_symmetric(a in point(), b in point()) {
            prop_assert!((distance_km(a, b) - distance_km(b, a)).abs() < 1e-9);
        }

        #[test]
        fn prop_triangle_inequality(a in point(), b in point(), c in point()) {
            prop_assert!(distance_km(a, b) <= distance_km(a, c) + distance_km(c, b) + 1e-6);
        }

        #[test]
        fn prop_randomized_distance_in_range(
            lat in -80.0f64..80.0,
            lon in -180.0f64..180.0,
            min_km in 0.0f64..5.0,
            extra_km in 0.0f64..5.0,
            seed in any::<u64>(),
        ) {
            let origin = GeoPoint::new(lat, lon);
            let max_km = min_km + extra_km;
            let mut rng = StdRng::seed_from_u64(seed);
            let moved = randomize(origin, min_km, max_km, &mut rng);
            let d = distance_km(origin, moved);
            prop_assert!(d >= min_km * 0.99 - 1e-9, "{} < {}", d, min_km);
            prop_assert!(d <= max_km * 1.01 + 1e-9, "{} > {}", d, max_km);
        }

        #[test]
        fn prop_within_radius_matches_brute_force(
            center in point(),
            points in prop::collection::vec(point(), 0..50),
            radius in 0.0f64..5000.0,
        ) {
            let got: Vec<GeoPoint> = within_radius(points.clone(), center, radius).into_iter().map(|r| r.item).collect();
            let expected: Vec<GeoPoint> = points.into_iter().filter(|p| distance_km(*p, center) <= radius).collect();
            prop_assert_eq!(got, expected);
        }
    }
}
