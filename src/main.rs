use anyhow::{anyhow, Error, Result};
use chrono::FixedOffset;
use rand::prelude::*;
use ring::{digest, hmac};
use std::{env, io, net::SocketAddr, path::Path};
use tokio::fs;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use warp::Filter;

use controllers::SurveyController;
use models::{Backend, Config};
use store::{FileKeyValue, MemoryKeyValue, Store};

mod analytics;
mod builder;
mod controllers;
mod error;
mod export;
mod filters;
#[cfg(test)]
mod fixtures;
mod kiosk;
mod models;
mod preferences;
mod routes;
mod store;

async fn load_config(path: &Path) -> Result<Config> {
    match fs::read_to_string(path).await {
        Ok(config) => Ok(toml::de::from_str(&config)?),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            info!("No config at {}, using defaults", path.display());
            Ok(Config::default())
        }
        Err(err) => Err(err.into()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_err| EnvFilter::new("info")),
        )
        .init();

    let bind_addr = env::var("BIND").unwrap_or_else(|_err| "127.0.0.1:3030".into());
    let bind_addr: SocketAddr = bind_addr.parse()?;

    let cors_origin = env::var("CORS_ORIGIN").unwrap_or_else(|_err| "http://localhost:1313".into());

    let secret_key = env::var("SECRET_KEY")
        .map_err(Error::new)
        .and_then(|env| {
            let mut secret_key = [0u8; digest::SHA256_OUTPUT_LEN];
            hex::decode_to_slice(env, &mut secret_key)?;
            Ok(secret_key)
        })
        .or_else(|_err| -> Result<_> {
            let mut secret_key = [0u8; digest::SHA256_OUTPUT_LEN];
            rand::rngs::OsRng.fill(&mut secret_key);

            warn!("No secret key was specified, generated a new secret key.");
            warn!("Rerun with SECRET_KEY={}", hex::encode(secret_key));

            Ok(secret_key)
        })?;

    let secret_key = hmac::Key::new(hmac::HMAC_SHA256, secret_key.as_ref());

    let config_path = env::var("KIOSK_CONFIG").unwrap_or_else(|_err| "kiosk.toml".into());
    let config = load_config(Path::new(&config_path)).await?;

    let offset = FixedOffset::east_opt(config.utc_offset_minutes * 60)
        .ok_or_else(|| anyhow!("utc_offset_minutes out of range: {}", config.utc_offset_minutes))?;

    let store = match config.storage {
        Backend::File => {
            info!("Storing surveys in {}", config.data_dir.display());
            Store::new(FileKeyValue::open(&config.data_dir, config.quota_bytes)?)
        }
        Backend::Memory => {
            warn!("Storing surveys in memory, they are lost on restart");
            Store::new(MemoryKeyValue::with_quota(config.quota_bytes))
        }
    };

    let controller = SurveyController::new(secret_key, store, offset);

    let seeded = controller.seed(&config.seed)?;
    if seeded > 0 {
        info!("Imported {} seed surveys", seeded);
    }

    let cors = warp::cors()
        .allow_origin(cors_origin.as_str())
        .allow_methods(vec!["GET", "POST", "PUT", "DELETE"])
        .allow_headers(vec!["Authorization", "Content-Type"]);

    let server = routes::routes(controller)
        .with(warp::trace::request())
        .with(cors);

    info!("Listening on {}", bind_addr);
    warp::serve(server).run(bind_addr).await;

    Ok(())
}
