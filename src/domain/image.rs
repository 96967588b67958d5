use std::{
    collections::BTreeMap,
    sync::{Arc, LazyLock},
};

use anyhow::anyhow;
use log::{debug, warn};
use regex::Regex;
use serde::Serialize;

use crate::{
    config::DockerConfig,
    error::{Error, Result},
};

use super::{
    model::{CustomData, ImageMetadata, WEB_PROCESS_NAME},
    port::{HistoryKind, ImageStorage},
};

static PROCFILE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9_-]+):\s*(.+)$").expect("procfile line pattern is valid")
});

/// Parses a Procfile into process name -> single command. Lines that don't
/// match `name: command` are skipped.
pub fn processes_from_procfile(procfile: &str) -> BTreeMap<String, Vec<String>> {
    procfile
        .split('\n')
        .filter_map(|line| PROCFILE_LINE.captures(line))
        .filter_map(|captures| {
            let command = captures[2].trim_end();
            (!command.is_empty()).then(|| (captures[1].to_string(), vec![command.to_string()]))
        })
        .collect()
}

/// Splits `repo[:tag]`, keeping registry ports in the repository part.
pub fn split_image_name(image: &str) -> (String, String) {
    let last_slash = image.rfind('/').map(|idx| idx + 1).unwrap_or(0);
    match image[last_slash..].rfind(':') {
        Some(idx) => {
            let split = last_slash + idx;
            (image[..split].to_string(), image[split + 1..].to_string())
        }
        None => (image.to_string(), "latest".to_string()),
    }
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct AppImages {
    #[serde(rename = "deployImages")]
    pub deploy_images: Vec<String>,
    #[serde(rename = "builderImages")]
    pub builder_images: Vec<String>,
}

pub struct ImageService {
    storage: Arc<dyn ImageStorage + Send + Sync>,
    config: DockerConfig,
}

impl ImageService {
    pub fn new(storage: Arc<dyn ImageStorage + Send + Sync>, config: DockerConfig) -> Self {
        Self { storage, config }
    }

    pub fn history_size(&self) -> usize {
        self.config.history_size()
    }

    fn registry_prefix(&self) -> String {
        let registry = self.config.registry.trim_end_matches('/');
        if registry.is_empty() {
            self.config.repository_namespace.clone()
        } else {
            format!("{}/{}", registry, self.config.repository_namespace)
        }
    }

    pub fn app_base_image_name(&self, app: &str) -> String {
        format!("{}/app-{}", self.registry_prefix(), app)
    }

    fn app_image_pattern(&self, app: &str) -> Result<Regex> {
        Regex::new(&format!(
            r"^{}:v\d+$",
            regex::escape(&self.app_base_image_name(app))
        ))
        .map_err(|e| Error::Other(anyhow!(e)))
    }

    pub async fn new_app_image_name(&self, app: &str) -> Result<String> {
        let count = self.storage.increment_count(HistoryKind::App, app).await?;
        Ok(format!("{}:v{}", self.app_base_image_name(app), count))
    }

    pub async fn new_build_image_name(&self, app: &str) -> Result<String> {
        let count = self
            .storage
            .increment_count(HistoryKind::Builder, app)
            .await?;
        Ok(format!("{}:v{}-builder", self.app_base_image_name(app), count))
    }

    /// Most recent deployed image that is not disabled.
    pub async fn current_image_name(&self, app: &str) -> Result<String> {
        let history = self.storage.find_history(HistoryKind::App, app).await?;
        let history = match history {
            Some(history) if !history.images.is_empty() => history,
            Some(history) if history.count > 0 => return Ok(self.app_base_image_name(app)),
            _ => return Err(Error::NoImages(app.to_string())),
        };
        for image in history.images.iter().rev() {
            let disabled = self
                .storage
                .find_metadata(image)
                .await?
                .map(|metadata| metadata.disabled)
                .unwrap_or(false);
            if !disabled {
                return Ok(image.clone());
            }
            debug!("Skipping disabled image {} for app {}", image, app);
        }
        Err(Error::NoImages(app.to_string()))
    }

    pub async fn append_app_image_name(&self, app: &str, image: &str) -> Result<()> {
        Ok(self
            .storage
            .append_image(HistoryKind::App, app, image)
            .await?)
    }

    pub async fn list_app_images(&self, app: &str) -> Result<Vec<String>> {
        Ok(self
            .storage
            .find_history(HistoryKind::App, app)
            .await?
            .map(|history| history.images)
            .unwrap_or_default())
    }

    pub async fn list_valid_app_images(&self, app: &str) -> Result<Vec<String>> {
        let images = self.list_app_images(app).await?;
        Ok(tail(images, self.history_size()))
    }

    /// Removes from the history, and forgets the metadata of, images beyond the window.
    pub async fn trim_app_images(&self, app: &str) -> Result<Vec<String>> {
        let images = self.list_app_images(app).await?;
        if images.len() <= self.history_size() {
            return Ok(vec![]);
        }
        let evicted = images[..images.len() - self.history_size()].to_vec();
        self.pull_app_image_names(app, &evicted).await?;
        Ok(evicted)
    }

    pub async fn pull_app_image_names(&self, app: &str, images: &[String]) -> Result<()> {
        self.storage
            .pull_images(HistoryKind::App, app, images)
            .await?;
        let pattern = self.app_image_pattern(app)?;
        let owned: Vec<String> = images
            .iter()
            .filter(|image| pattern.is_match(image))
            .cloned()
            .collect();
        if !owned.is_empty() {
            self.storage.delete_metadata(&owned).await?;
        }
        Ok(())
    }

    pub async fn delete_all_app_image_names(&self, app: &str) -> Result<()> {
        self.storage.delete_history(HistoryKind::App, app).await?;
        self.storage
            .delete_history(HistoryKind::Builder, app)
            .await?;
        let pattern = self.app_image_pattern(app)?;
        let removed = self.storage.delete_metadata_matching(&pattern).await?;
        debug!("Removed {} image metadata records of app {}", removed, app);
        Ok(())
    }

    pub async fn current_builder_image_name(&self, app: &str) -> Result<String> {
        let last = self
            .storage
            .find_history(HistoryKind::Builder, app)
            .await?
            .and_then(|history| history.images.last().cloned());
        match last {
            Some(image) => Ok(image),
            None => self.current_image_name(app).await,
        }
    }

    pub async fn append_app_builder_image_name(&self, app: &str, image: &str) -> Result<()> {
        Ok(self
            .storage
            .append_image(HistoryKind::Builder, app, image)
            .await?)
    }

    pub async fn list_app_builder_images(&self, app: &str) -> Result<Vec<String>> {
        Ok(self
            .storage
            .find_history(HistoryKind::Builder, app)
            .await?
            .map(|history| history.images)
            .unwrap_or_default())
    }

    /// Drops builder images beyond the history window and returns them.
    pub async fn trim_app_builder_images(&self, app: &str) -> Result<Vec<String>> {
        let images = self.list_app_builder_images(app).await?;
        if images.len() <= self.history_size() {
            return Ok(vec![]);
        }
        let evicted = images[..images.len() - self.history_size()].to_vec();
        self.storage
            .pull_images(HistoryKind::Builder, app, &evicted)
            .await?;
        Ok(evicted)
    }

    pub async fn list_all_app_images(&self) -> Result<BTreeMap<String, AppImages>> {
        let mut all: BTreeMap<String, AppImages> = BTreeMap::new();
        for history in self.storage.list_histories(HistoryKind::App).await? {
            all.entry(history.name).or_default().deploy_images = history.images;
        }
        for history in self.storage.list_histories(HistoryKind::Builder).await? {
            all.entry(history.name).or_default().builder_images = history.images;
        }
        Ok(all)
    }

    pub async fn save_image_custom_data(&self, image: &str, mut data: CustomData) -> Result<()> {
        let processes = if let Some(processes) = data.processes.take() {
            let ignored = data.procfile.as_deref();
            if ignored.is_some_and(|procfile| processes_from_procfile(procfile).is_empty()) {
                warn!(
                    "Ignoring invalid procfile of image {}, processes are declared explicitly",
                    image
                );
            }
            processes
                .into_iter()
                .map(|(name, cmd)| (name, cmd.to_vec()))
                .collect()
        } else if let Some(procfile) = data.procfile.as_deref() {
            let processes = processes_from_procfile(procfile);
            if processes.is_empty() {
                return Err(Error::InvalidProcfile);
            }
            processes
        } else {
            BTreeMap::new()
        };
        data.procfile = None;
        let metadata = ImageMetadata {
            name: image.to_string(),
            exposed_ports: data.exposed_ports.clone().unwrap_or_default(),
            processes,
            custom_data: data,
            ..Default::default()
        };
        self.save_image_metadata(&metadata).await
    }

    pub async fn save_image_metadata(&self, metadata: &ImageMetadata) -> Result<()> {
        Ok(self.storage.save_metadata(metadata).await?)
    }

    /// Missing records read as empty ones so very old images keep working.
    pub async fn get_image_custom_data(&self, image: &str) -> Result<ImageMetadata> {
        Ok(self
            .storage
            .find_metadata(image)
            .await?
            .unwrap_or_else(|| ImageMetadata::named(image)))
    }

    pub async fn get_image_web_process_name(&self, image: &str) -> Result<String> {
        let metadata = self.get_image_custom_data(image).await?;
        let mut names = metadata.processes.keys();
        Ok(match metadata.processes.len() {
            0 => String::new(),
            1 => names.next().cloned().unwrap_or_default(),
            _ => WEB_PROCESS_NAME.to_string(),
        })
    }

    pub async fn all_app_processes(&self, app: &str) -> Result<Vec<String>> {
        let image = self.current_image_name(app).await?;
        let metadata = self.get_image_custom_data(&image).await?;
        Ok(metadata.processes.into_keys().collect())
    }

    /// Resolves `vN` against the valid history of `app`.
    pub async fn get_app_image_by_suffix(&self, app: &str, suffix: &str) -> Result<String> {
        let wanted = format!(":{suffix}");
        self.list_valid_app_images(app)
            .await?
            .into_iter()
            .rev()
            .find(|image| image.ends_with(&wanted))
            .ok_or_else(|| Error::InvalidVersion(suffix.to_string()))
    }

    pub async fn update_app_image_rollback(
        &self,
        image: &str,
        reason: &str,
        disabled: bool,
    ) -> Result<()> {
        let mut metadata = self
            .storage
            .find_metadata(image)
            .await?
            .ok_or_else(|| Error::ImageNotFound(image.to_string()))?;
        metadata.disabled = disabled;
        metadata.reason = (!reason.is_empty()).then(|| reason.to_string());
        self.save_image_metadata(&metadata).await
    }

    fn platform_base_image_name(&self, platform: &str) -> String {
        format!("{}/{}", self.registry_prefix(), platform)
    }

    pub async fn platform_new_image(&self, platform: &str) -> Result<String> {
        let count = self
            .storage
            .increment_count(HistoryKind::Platform, platform)
            .await?;
        Ok(format!(
            "{}:v{}",
            self.platform_base_image_name(platform),
            count
        ))
    }

    pub async fn platform_current_image(&self, platform: &str) -> Result<String> {
        Ok(self
            .platform_list_images(platform)
            .await?
            .pop()
            .unwrap_or_else(|| format!("{}:latest", self.platform_base_image_name(platform))))
    }

    pub async fn platform_append_image(&self, platform: &str, image: &str) -> Result<()> {
        Ok(self
            .storage
            .append_image(HistoryKind::Platform, platform, image)
            .await?)
    }

    pub async fn platform_list_images(&self, platform: &str) -> Result<Vec<String>> {
        Ok(self
            .storage
            .find_history(HistoryKind::Platform, platform)
            .await?
            .map(|history| history.images)
            .unwrap_or_default())
    }

    pub async fn platform_delete_images(&self, platform: &str) -> Result<()> {
        Ok(self
            .storage
            .delete_history(HistoryKind::Platform, platform)
            .await?)
    }
}

fn tail(mut images: Vec<String>, size: usize) -> Vec<String> {
    if images.len() > size {
        images.drain(..images.len() - size);
    }
    images
}
