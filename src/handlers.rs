use crate::config::SearchSettings;
use crate::core::{self, Indexer, Mutex, Persister};
use crate::crypto::Keyring;
use crate::error::Error;
use crate::geo::{self, GeoPoint};
use crate::models::NearbyExtra;
use actix_header::actix_header;
use actix_web::web::{self, Data, Header, Json, Query};
use actix_web::HttpResponse;
use serde::{Deserialize, Serialize};

const MAX_PAGE_SIZE: i64 = 100;
const DEFAULT_PAGE_SIZE: i64 = 20;

/// Id of the calling extra, set by the auth proxy in front of the service.
#[actix_header("UID")]
pub struct UID(String);

impl From<String> for UID {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<UID> for String {
    fn from(u: UID) -> Self {
        u.0
    }
}

pub(crate) fn configure<I, M, P, K>(cfg: &mut web::ServiceConfig)
where
    I: Indexer<K> + 'static,
    M: Mutex<String> + 'static,
    P: Persister<K> + 'static,
    K: 'static,
{
    cfg.route("/extras/location", web::put().to(update_location::<I, M, P, K>))
        .route("/extras/location", web::delete().to(remove_location::<M, P, K>))
        .route("/extras/nearby", web::get().to(nearby_extras::<I, P, K>));
}

fn require_uid(uid: String) -> Result<String, Error> {
    let uid = uid.trim().to_owned();
    if uid.is_empty() {
        return Err(Error::BadRequest("empty UID header".to_owned()));
    }
    Ok(uid)
}

#[derive(Serialize, Deserialize)]
pub(crate) struct AddLocation {
    latitude: f64,
    longitude: f64,
}

pub(crate) async fn update_location<I, M, P, K>(
    Header(UID(uid)): Header<UID>,
    Json(loc): Json<AddLocation>,
    indexer: Data<I>,
    mutex: Data<M>,
    persister: Data<P>,
    keyring: Data<Keyring>,
) -> Result<HttpResponse, Error>
where
    I: Indexer<K> + 'static,
    M: Mutex<String> + 'static,
    P: Persister<K> + 'static,
    K: 'static,
{
    let uid = require_uid(uid)?;
    let point = GeoPoint::new(loc.latitude, loc.longitude);
    if !point.is_valid() {
        return Err(Error::BadRequest(format!("invalid coordinates: {}, {}", loc.latitude, loc.longitude)));
    }
    core::update_location(mutex.get_ref(), indexer.get_ref(), persister.get_ref(), keyring.get_ref(), &uid, point).await?;
    Ok(HttpResponse::NoContent().finish())
}

pub(crate) async fn remove_location<M, P, K>(Header(UID(uid)): Header<UID>, mutex: Data<M>, persister: Data<P>) -> Result<HttpResponse, Error>
where
    M: Mutex<String> + 'static,
    P: Persister<K> + 'static,
    K: 'static,
{
    let uid = require_uid(uid)?;
    if !core::remove_location(mutex.get_ref(), persister.get_ref(), &uid).await? {
        return Err(Error::NotFound);
    }
    Ok(HttpResponse::NoContent().finish())
}

#[derive(Deserialize)]
pub(crate) struct NearbyQuery {
    latitude: f64,
    longitude: f64,
    radius_km: Option<f64>,
    ne_latitude: Option<f64>,
    ne_longitude: Option<f64>,
    page: Option<i64>,
    size: Option<i64>,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct NearbyExtrasResponse {
    list: Vec<NearbyExtra>,
    total: u64,
    radius_km: f64,
}

impl NearbyQuery {
    fn center(&self) -> Result<GeoPoint, Error> {
        let center = GeoPoint::new(self.latitude, self.longitude);
        if !center.is_valid() {
            return Err(Error::BadRequest(format!("invalid center: {}, {}", self.latitude, self.longitude)));
        }
        Ok(center)
    }

    /// Viewport corner wins over an explicit radius, the configured default
    /// applies when neither is given.
    fn radius_km(&self, center: GeoPoint, settings: &SearchSettings) -> Result<f64, Error> {
        let radius = match (self.ne_latitude, self.ne_longitude) {
            (Some(lat), Some(lon)) => {
                let corner = GeoPoint::new(lat, lon);
                if !corner.is_valid() {
                    return Err(Error::BadRequest(format!("invalid viewport corner: {}, {}", lat, lon)));
                }
                geo::viewport_radius_km(center, corner)
            }
            (None, None) => self.radius_km.unwrap_or(settings.default_radius_km),
            _ => return Err(Error::BadRequest("ne_latitude and ne_longitude go together".to_owned())),
        };
        if !radius.is_finite() || radius < 0.0 {
            return Err(Error::BadRequest(format!("invalid radius: {}", radius)));
        }
        Ok(radius.min(settings.max_radius_km))
    }

    fn paging(&self) -> Result<(i64, i64), Error> {
        let page = self.page.unwrap_or(1);
        let size = self.size.unwrap_or(DEFAULT_PAGE_SIZE);
        if page < 1 {
            return Err(Error::BadRequest(format!("invalid page: {}", page)));
        }
        if !(1..=MAX_PAGE_SIZE).contains(&size) {
            return Err(Error::BadRequest(format!("size must be between 1 and {}", MAX_PAGE_SIZE)));
        }
        Ok((page, size))
    }
}

pub(crate) async fn nearby_extras<I, P, K>(
    Query(query): Query<NearbyQuery>,
    indexer: Data<I>,
    persister: Data<P>,
    keyring: Data<Keyring>,
    settings: Data<SearchSettings>,
) -> Result<Json<NearbyExtrasResponse>, Error>
where
    I: Indexer<K> + 'static,
    P: Persister<K> + 'static,
    K: 'static,
{
    let center = query.center()?;
    let radius_km = query.radius_km(center, settings.get_ref())?;
    let (page, size) = query.paging()?;
    let mut rng = rand::thread_rng();
    let (mut list, total) = core::nearby_extras(
        indexer.get_ref(),
        persister.get_ref(),
        keyring.get_ref(),
        center,
        radius_km,
        page,
        size,
        settings.display,
        &mut rng,
    )
    .await?;
    for extra in &mut list {
        extra.distance_km = (extra.distance_km * 10.0).round() / 10.0;
    }
    Ok(Json(NearbyExtrasResponse { list, total, radius_km }))
}
