use std::{error::Error, sync::Arc};

use anyhow::Context;
use log::info;
use tokio::net::TcpListener;

use crate::{
    config::{load_config, AppConfig, StorageDriver},
    domain::{
        port::{ClusterStorage, ImageStorage},
        DeployService,
    },
    infra::{docker::DockerConnector, memory::MemoryStore, sqlite::SqliteStore, web::router},
};

mod config;
mod domain;
mod error;
mod infra;

type Stores = (
    Arc<dyn ImageStorage + Send + Sync>,
    Arc<dyn ClusterStorage + Send + Sync>,
);

async fn open_stores(config: &AppConfig) -> anyhow::Result<Stores> {
    Ok(match config.database.driver {
        StorageDriver::Sqlite => {
            let store = Arc::new(
                SqliteStore::connect(&config.database.url, &config.docker.collection)
                    .await
                    .context("Can't open image database")?,
            );
            (store.clone(), store)
        }
        StorageDriver::Memory => {
            let store = Arc::new(MemoryStore::default());
            (store.clone(), store)
        }
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("Start tsuru deployer");

    let config = load_config()?;
    info!(
        "Loaded config: host {}, registry {:?}, {:?} store",
        config.host, config.docker.registry, config.database.driver
    );
    let (images, managers) = open_stores(&config).await?;

    let service = DeployService::new(&config, images, managers, Arc::new(DockerConnector))
        .context("Can't initialize deploy service")?;

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("Can't listen on {}", config.listen))?;
    info!("Listening on {}", config.listen);
    axum::serve(listener, router(service)).await?;
    Ok(())
}
