use crate::crypto::Keyring;
use crate::geo::{self, GeoPoint};
use crate::models::{Candidate, DisplayRange, Location, LocationCommand, NearbyExtra, ReencryptReport};
use anyhow::Error;
use log::{debug, info, warn};
use rand::Rng;
use std::future::Future;
use std::pin::Pin;

const REENCRYPT_JOB_KEY: &str = "job:reencrypt";

pub(crate) fn extra_lock_key(extra_id: &str) -> String {
    format!("extra:{}", extra_id)
}

pub(crate) trait Mutex<K> {
    fn multiple_acquire<'a>(&'a self, keys: &'a [K]) -> Pin<Box<dyn Future<Output = Result<(), Error>> + 'a>>
    where
        K: 'a;
    fn multiple_release<'a>(&'a self, keys: &'a [K]) -> Pin<Box<dyn Future<Output = Result<(), Error>> + 'a>>
    where
        K: 'a;
    fn single_acquire<'a>(&'a self, key: &'a K) -> Pin<Box<dyn Future<Output = Result<(), Error>> + 'a>>
    where
        K: 'a;
    fn single_release<'a>(&'a self, key: &'a K) -> Pin<Box<dyn Future<Output = Result<(), Error>> + 'a>>
    where
        K: 'a;
}

pub(crate) trait Indexer<I> {
    fn index(&self, latitude: f64, longitude: f64) -> I;
    /// Every cell that may hold a point within `distance` km of a point in `index`.
    fn neighbors(&self, index: I, distance: f64) -> Vec<I>;
}

pub(crate) trait Persister<I> {
    fn upsert<'a>(&'a self, loc: LocationCommand<I>) -> Pin<Box<dyn Future<Output = Result<(), Error>> + 'a>>
    where
        I: 'a;
    fn remove<'a>(&'a self, extra_id: &'a str) -> Pin<Box<dyn Future<Output = Result<bool, Error>> + 'a>>;
    fn query<'a>(&'a self, indices: Vec<I>) -> Pin<Box<dyn Future<Output = Result<Vec<Location<I>>, Error>> + 'a>>
    where
        I: 'a;
    /// Locations ordered by extra id, starting after `after`.
    fn scan<'a>(&'a self, after: Option<String>, limit: i64) -> Pin<Box<dyn Future<Output = Result<Vec<Location<I>>, Error>> + 'a>>
    where
        I: 'a;
    /// Replaces the ciphertext only if the stored key version is still `expected_version`.
    fn rekey<'a>(
        &'a self,
        extra_id: &'a str,
        expected_version: i32,
        location: String,
        key_version: i32,
    ) -> Pin<Box<dyn Future<Output = Result<bool, Error>> + 'a>>;
}

pub(crate) async fn update_location<M, I, P, K>(
    mutex: &M,
    indexer: &I,
    persister: &P,
    keyring: &Keyring,
    extra_id: &str,
    point: GeoPoint,
) -> Result<(), Error>
where
    M: Mutex<String>,
    I: Indexer<K>,
    P: Persister<K>,
{
    let (location, key_version) = keyring.encrypt_point(point)?;
    let cmd = LocationCommand {
        extra_id: extra_id.to_owned(),
        geo_index: indexer.index(point.latitude, point.longitude),
        location,
        key_version,
    };
    let lock = extra_lock_key(extra_id);
    mutex.single_acquire(&lock).await?;
    let res = persister.upsert(cmd).await;
    mutex.single_release(&lock).await?;
    res
}

pub(crate) async fn remove_location<M, P, K>(mutex: &M, persister: &P, extra_id: &str) -> Result<bool, Error>
where
    M: Mutex<String>,
    P: Persister<K>,
{
    let lock = extra_lock_key(extra_id);
    mutex.single_acquire(&lock).await?;
    let res = persister.remove(extra_id).await;
    mutex.single_release(&lock).await?;
    res
}

/// Extras within `radius_km` of `center`, nearest first, one page at a time.
///
/// Filtering and distances use the decrypted true coordinates. Only the
/// returned page gets displaced coordinates.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn nearby_extras<I, P, K, R>(
    indexer: &I,
    persister: &P,
    keyring: &Keyring,
    center: GeoPoint,
    radius_km: f64,
    page: i64,
    size: i64,
    display: DisplayRange,
    rng: &mut R,
) -> Result<(Vec<NearbyExtra>, u64), Error>
where
    I: Indexer<K>,
    P: Persister<K>,
    R: Rng + ?Sized,
{
    let idx = indexer.index(center.latitude, center.longitude);
    let indices = indexer.neighbors(idx, radius_km);
    let locs = persister.query(indices).await?;
    debug!("{} candidate locations around {:?}", locs.len(), center);

    let mut candidates: Vec<Candidate> = locs
        .into_iter()
        .filter_map(|loc| match keyring.decrypt_point(&loc.location, loc.key_version) {
            Ok(point) => Some(Candidate {
                extra_id: loc.extra_id,
                point,
            }),
            Err(e) => {
                warn!("skipping location of extra {}: {}", loc.extra_id, e);
                None
            }
        })
        .collect();
    // equal distances keep id order through the stable sort below
    candidates.sort_by(|a, b| a.extra_id.cmp(&b.extra_id));

    let mut ranked = geo::within_radius(candidates, center, radius_km);
    geo::sort_by_distance(&mut ranked);
    let total = ranked.len() as u64;

    let skip = (page.max(1) - 1).saturating_mul(size.max(0)) as usize;
    let list = ranked
        .into_iter()
        .skip(skip)
        .take(size.max(0) as usize)
        .map(|r| {
            let shown = geo::randomize(r.item.point, display.min_km, display.max_km, rng);
            NearbyExtra {
                extra_id: r.item.extra_id,
                display_latitude: shown.latitude,
                display_longitude: shown.longitude,
                distance_km: r.distance_km,
            }
        })
        .collect();
    Ok((list, total))
}

/// Moves every location encrypted under an old key version to the current one.
pub(crate) async fn reencrypt_locations<M, P, K>(mutex: &M, persister: &P, keyring: &Keyring, batch_size: i64) -> Result<ReencryptReport, Error>
where
    M: Mutex<String>,
    P: Persister<K>,
{
    let job = REENCRYPT_JOB_KEY.to_owned();
    mutex.single_acquire(&job).await?;
    let res = reencrypt_batches(mutex, persister, keyring, batch_size.max(1)).await;
    mutex.single_release(&job).await?;
    let report = res?;
    info!(
        "re-encryption done: scanned {}, rekeyed {}, skipped {}, failed {}",
        report.scanned, report.rekeyed, report.skipped, report.failed
    );
    Ok(report)
}

async fn reencrypt_batches<M, P, K>(mutex: &M, persister: &P, keyring: &Keyring, batch_size: i64) -> Result<ReencryptReport, Error>
where
    M: Mutex<String>,
    P: Persister<K>,
{
    let mut report = ReencryptReport::default();
    let mut after: Option<String> = None;
    loop {
        let batch = persister.scan(after.clone(), batch_size).await?;
        let last = match batch.last() {
            Some(loc) => loc.extra_id.clone(),
            None => break,
        };
        let full = batch.len() as i64 >= batch_size;
        report.scanned += batch.len() as u64;

        let mut stale: Vec<Location<K>> = Vec::new();
        for loc in batch {
            if keyring.is_current(loc.key_version) {
                report.skipped += 1;
            } else {
                stale.push(loc);
            }
        }
        stale.sort_by(|a, b| a.extra_id.cmp(&b.extra_id));
        let locks: Vec<String> = stale.iter().map(|loc| extra_lock_key(&loc.extra_id)).collect();

        mutex.multiple_acquire(&locks).await?;
        let res = rekey_batch(persister, keyring, &stale, &mut report).await;
        mutex.multiple_release(&locks).await?;
        res?;

        if !full {
            break;
        }
        after = Some(last);
    }
    Ok(report)
}

async fn rekey_batch<P, K>(persister: &P, keyring: &Keyring, stale: &[Location<K>], report: &mut ReencryptReport) -> Result<(), Error>
where
    P: Persister<K>,
{
    for loc in stale {
        let point = match keyring.decrypt_point(&loc.location, loc.key_version) {
            Ok(point) => point,
            Err(e) => {
                warn!("cannot re-encrypt location of extra {}: {}", loc.extra_id, e);
                report.failed += 1;
                continue;
            }
        };
        let (location, key_version) = keyring.encrypt_point(point)?;
        if persister.rekey(&loc.extra_id, loc.key_version, location, key_version).await? {
            report.rekeyed += 1;
        } else {
            debug!("location of extra {} changed during re-encryption", loc.extra_id);
            report.skipped += 1;
        }
    }
    Ok(())
}
