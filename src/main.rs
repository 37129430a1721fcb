mod config;
mod core;
mod crypto;
mod error;
mod geo;
mod handlers;
mod indexers;
mod models;
mod mutexes;
mod persisters;

use crate::config::Config;
use crate::crypto::Keyring;
use actix_web::middleware::Logger;
use actix_web::web::Data;
use indexers::GridIndexer;
use log::{error, info};
use mutexes::RedisMutex;
use persisters::MongoPersister;
use std::time::Duration;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::load()?;
    let keyring = config.keyring()?;
    info!("encrypting locations with key version {}", keyring.current_version());
    let settings = config.search;
    let indexer = GridIndexer::new(config.grid_cell_degrees)?;
    let mutex = RedisMutex::new(redis::Client::open(config.redis_uri.as_str())?, config.mutex_expire_secs, config.mutex_timeout_secs);
    let persister = MongoPersister::new(
        mongodb::Client::with_options(mongodb::options::ClientOptions::parse(&config.mongo_uri).await?)?.database(&config.mongo_database),
    );
    persister.ensure_indexes().await?;

    if config.reencrypt_interval_secs > 0 {
        spawn_reencryption(
            mutex.clone(),
            persister.clone(),
            keyring.clone(),
            config.reencrypt_batch_size,
            Duration::from_secs(config.reencrypt_interval_secs),
        );
    }

    info!("listening on {}", config.bind_addr);
    actix_web::HttpServer::new(move || {
        actix_web::App::new()
            .wrap(Logger::default())
            .configure(handlers::configure::<GridIndexer, RedisMutex, MongoPersister, i64>)
            .app_data(Data::new(mutex.clone()))
            .app_data(Data::new(indexer.clone()))
            .app_data(Data::new(persister.clone()))
            .app_data(Data::new(keyring.clone()))
            .app_data(Data::new(settings))
    })
    .bind(&config.bind_addr)?
    .run()
    .await?;
    Ok(())
}

fn spawn_reencryption(mutex: RedisMutex, persister: MongoPersister, keyring: Keyring, batch_size: i64, every: Duration) {
    actix_web::rt::spawn(async move {
        let mut ticker = actix_web::rt::time::interval(every);
        loop {
            ticker.tick().await;
            if let Err(e) = crate::core::reencrypt_locations(&mutex, &persister, &keyring, batch_size).await {
                error!("re-encryption run failed: {:#}", e);
            }
        }
    });
}
