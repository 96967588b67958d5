use std::{collections::BTreeMap, future::Future, sync::Arc};

use log::{error, info};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    config::AppConfig,
    error::{Error, Result},
};

use archive::{Archive, ArchiveFetcher, ArchiveRequest};
use build::{Builder, Registry};
use cluster::Cluster;
use deploy::Deployer;
use event::{Buffer, DeployEvent, EventRegistry};
use image::{AppImages, ImageService};
use model::App;
use port::{ClusterConnector, ClusterHandle, ClusterStorage, ImageStorage};
use service::ProcessState;

pub mod archive;
pub mod build;
pub mod cluster;
pub mod deploy;
pub mod event;
pub mod image;
pub mod migrate;
pub mod model;
pub mod pipeline;
pub mod port;
pub mod service;
#[cfg(test)]
pub mod testing;

/// Result of a finished deploy or unit operation.
#[derive(Debug, Serialize)]
pub struct Outcome {
    pub event: Uuid,
    pub image: Option<String>,
    /// Set when the app must rebuild from its platform on next deploy.
    #[serde(rename = "updatePlatform")]
    pub update_platform: bool,
    pub transcript: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ImageListing {
    pub images: Vec<String>,
    pub valid: Vec<String>,
    pub builder: Vec<String>,
}

/// Wires archive acquisition, build, image preparation and process
/// deployment behind one entry point per operation.
pub struct DeployService {
    storage: Arc<dyn ImageStorage + Send + Sync>,
    images: Arc<ImageService>,
    cluster: Cluster,
    fetcher: ArchiveFetcher,
    builder: Builder,
    deployer: Deployer,
    events: EventRegistry,
}

impl DeployService {
    pub fn new(
        config: &AppConfig,
        storage: Arc<dyn ImageStorage + Send + Sync>,
        cluster_storage: Arc<dyn ClusterStorage + Send + Sync>,
        connector: Arc<dyn ClusterConnector + Send + Sync>,
    ) -> Result<Self> {
        let images = Arc::new(ImageService::new(storage.clone(), config.docker.clone()));
        let registry = Arc::new(Registry::new(config.docker.clone()));
        Ok(Self {
            storage,
            cluster: Cluster::new(connector, cluster_storage, config.cluster.clone()),
            fetcher: ArchiveFetcher::new()?,
            builder: Builder::new(
                images.clone(),
                registry,
                config.docker.clone(),
                &config.host,
            ),
            deployer: Deployer::new(images.clone(), &config.docker, &config.host),
            images,
            events: EventRegistry::default(),
        })
    }

    /// Requests cancellation of an in-flight deploy. False when unknown.
    pub fn cancel(&self, id: &Uuid) -> bool {
        match self.events.get(id) {
            Some(event) => {
                info!("Cancel requested for deploy {} of {}", id, event.app);
                event.cancel()
            }
            None => false,
        }
    }

    async fn tracked<F, Fut>(
        &self,
        app: &App,
        id: Option<Uuid>,
        operation: F,
    ) -> Result<Outcome>
    where
        F: FnOnce(ClusterHandle, Arc<DeployEvent>) -> Fut,
        Fut: Future<Output = Result<Option<String>>>,
    {
        let event = self.events.start(&app.name, id)?;
        let result = match self.cluster.choose_manager().await {
            Ok(client) => operation(client, event.clone()).await,
            Err(err) => Err(err),
        };
        self.events.finish(&event.id);
        match result {
            Ok(image) => Ok(Outcome {
                event: event.id,
                image,
                update_platform: false,
                transcript: event.transcript(),
            }),
            Err(err) if err.is_canceled() => {
                info!("Deploy {} of {} canceled", event.id, app.name);
                Err(err)
            }
            Err(err) => {
                error!("Deploy {} of {} failed: {}", event.id, app.name, err);
                Err(err)
            }
        }
    }

    /// Builds the app from an archive source and deploys the resulting image.
    /// Passing `event` lets the caller cancel the deploy by that id while it runs.
    pub async fn deploy(
        &self,
        app: &App,
        request: ArchiveRequest,
        event: Option<Uuid>,
    ) -> Result<Outcome> {
        let source = request.source()?;
        self.tracked(app, event, |client, event| {
            async move {
                let builder_image = match self
                    .fetcher
                    .acquire(source, app, &self.images, &client, &*event)
                    .await?
                {
                    Archive::Tar(archive) => {
                        self.builder
                            .build(app, client.clone(), archive, event.clone())
                            .await?
                    }
                    Archive::BuilderImage(image) => image,
                };
                let image = self
                    .builder
                    .prepare_image(app, &client, &builder_image, &event, false)
                    .await?;
                self.deployer.deploy(app, client, event, &image).await?;
                Ok::<_, Error>(Some(image))
            }
        })
        .await
    }

    /// Deploys an image built outside the platform.
    pub async fn deploy_image(
        &self,
        app: &App,
        image: &str,
        event: Option<Uuid>,
    ) -> Result<Outcome> {
        let mut outcome = self
            .tracked(app, event, |client, event| {
                async move {
                    let new_image = self
                        .builder
                        .import_image(app, &client, image, &event)
                        .await?;
                    self.deployer.deploy(app, client, event, &new_image).await?;
                    Ok::<_, Error>(Some(new_image))
                }
            })
            .await?;
        outcome.update_platform = true;
        Ok(outcome)
    }

    pub async fn add_units(&self, app: &App, units: u32, process: &str) -> Result<Outcome> {
        self.change_units(app, i64::from(units), process).await
    }

    pub async fn remove_units(&self, app: &App, units: u32, process: &str) -> Result<Outcome> {
        self.change_units(app, -i64::from(units), process).await
    }

    async fn change_units(&self, app: &App, units: i64, process: &str) -> Result<Outcome> {
        self.tracked(app, None, |client, event| {
            async move {
                self.deployer
                    .change_units(app, client, event, units, process)
                    .await?;
                Ok::<_, Error>(None)
            }
        })
        .await
    }

    pub async fn start(&self, app: &App, process: &str) -> Result<Outcome> {
        self.change_state(app, process, ProcessState::start()).await
    }

    pub async fn stop(&self, app: &App, process: &str) -> Result<Outcome> {
        self.change_state(app, process, ProcessState::stop()).await
    }

    pub async fn restart(&self, app: &App, process: &str) -> Result<Outcome> {
        self.change_state(app, process, ProcessState::restart()).await
    }

    async fn change_state(&self, app: &App, process: &str, state: ProcessState) -> Result<Outcome> {
        self.tracked(app, None, |client, event| {
            async move {
                self.deployer
                    .change_state(app, client, event, process, state)
                    .await?;
                Ok::<_, Error>(None)
            }
        })
        .await
    }

    /// Runs a one-off command against the current image, returns its output.
    pub async fn run(&self, app: &App, cmds: &[String]) -> Result<String> {
        let client = self.cluster.choose_manager().await?;
        let out = Buffer::default();
        self.deployer.run_isolated(app, &client, cmds, &out).await?;
        Ok(out.contents())
    }

    pub async fn list_images(&self, app: &str) -> Result<ImageListing> {
        Ok(ImageListing {
            images: self.images.list_app_images(app).await?,
            valid: self.images.list_valid_app_images(app).await?,
            builder: self.images.list_app_builder_images(app).await?,
        })
    }

    pub async fn delete_images(&self, app: &str) -> Result<()> {
        self.images.delete_all_app_image_names(app).await
    }

    pub async fn platform_images(&self, platform: &str) -> Result<Vec<String>> {
        self.images.platform_list_images(platform).await
    }

    /// Every app with its deploy and builder histories.
    pub async fn all_images(&self) -> Result<BTreeMap<String, AppImages>> {
        self.images.list_all_app_images().await
    }

    pub async fn processes(&self, app: &str) -> Result<Vec<String>> {
        self.images.all_app_processes(app).await
    }

    /// Flags the `vN` image of `app` so it is never picked as current, or
    /// clears the flag.
    pub async fn rollback_image(
        &self,
        app: &str,
        version: &str,
        reason: &str,
        disabled: bool,
    ) -> Result<String> {
        let image = self.images.get_app_image_by_suffix(app, version).await?;
        self.images
            .update_app_image_rollback(&image, reason, disabled)
            .await?;
        info!("Image {} of {} disabled: {}", image, app, disabled);
        Ok(image)
    }

    /// Mints the next platform image name and records it as current.
    pub async fn add_platform_image(&self, platform: &str) -> Result<String> {
        let image = self.images.platform_new_image(platform).await?;
        self.images.platform_append_image(platform, &image).await?;
        Ok(image)
    }

    pub async fn delete_platform_images(&self, platform: &str) -> Result<()> {
        self.images.platform_delete_images(platform).await
    }

    pub async fn migrate_exposed_ports(&self) -> Result<usize> {
        let migrated = migrate::migrate_exposed_ports(self.storage.as_ref()).await?;
        info!("{} image records migrated to exposed ports list", migrated);
        Ok(migrated)
    }
}
