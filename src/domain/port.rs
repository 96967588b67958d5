use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;

use crate::{
    config::{RegistryAuth, TlsConfig},
    error::{ClusterError, StoreError},
};

use super::{
    event::OutputWriter,
    model::{
        ContainerInfo, ContainerSpec, ImageHistory, ImageInfo, ImageMetadata, ManagerRecord, Node,
        Service, ServiceSpec, Task,
    },
};

/// Collections holding versioned image lists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HistoryKind {
    App,
    Builder,
    Platform,
}

impl HistoryKind {
    pub fn collection_suffix(&self) -> &'static str {
        match self {
            HistoryKind::App => "app_image",
            HistoryKind::Builder => "builder_app_image",
            HistoryKind::Platform => "platform_image",
        }
    }
}

#[async_trait]
pub trait ImageStorage {
    /// Upserts the history record and returns the incremented counter.
    async fn increment_count(&self, kind: HistoryKind, name: &str) -> Result<u64, StoreError>;

    async fn find_history(
        &self,
        kind: HistoryKind,
        name: &str,
    ) -> Result<Option<ImageHistory>, StoreError>;

    /// Removes any prior occurrence of `image` and pushes it last, atomically.
    async fn append_image(&self, kind: HistoryKind, name: &str, image: &str)
        -> Result<(), StoreError>;

    async fn pull_images(
        &self,
        kind: HistoryKind,
        name: &str,
        images: &[String],
    ) -> Result<(), StoreError>;

    async fn delete_history(&self, kind: HistoryKind, name: &str) -> Result<(), StoreError>;

    async fn list_histories(&self, kind: HistoryKind) -> Result<Vec<ImageHistory>, StoreError>;

    async fn save_metadata(&self, metadata: &ImageMetadata) -> Result<(), StoreError>;

    async fn find_metadata(&self, name: &str) -> Result<Option<ImageMetadata>, StoreError>;

    async fn delete_metadata(&self, names: &[String]) -> Result<(), StoreError>;

    async fn delete_metadata_matching(&self, pattern: &Regex) -> Result<u64, StoreError>;

    async fn list_metadata(&self) -> Result<Vec<ImageMetadata>, StoreError>;
}

#[async_trait]
pub trait ClusterStorage {
    async fn load_managers(&self) -> Result<Option<ManagerRecord>, StoreError>;

    async fn save_managers(&self, record: &ManagerRecord) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ClusterClient {
    fn address(&self) -> &str;

    async fn ping(&self) -> Result<(), ClusterError>;

    async fn create_service(&self, spec: &ServiceSpec) -> Result<Service, ClusterError>;

    async fn update_service(
        &self,
        id: &str,
        version: u64,
        spec: &ServiceSpec,
    ) -> Result<(), ClusterError>;

    async fn inspect_service(&self, id: &str) -> Result<Service, ClusterError>;

    async fn remove_service(&self, id: &str) -> Result<(), ClusterError>;

    async fn list_tasks(
        &self,
        filters: HashMap<String, Vec<String>>,
    ) -> Result<Vec<Task>, ClusterError>;

    async fn inspect_node(&self, id: &str) -> Result<Node, ClusterError>;

    async fn list_managers(&self) -> Result<Vec<Node>, ClusterError>;

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, ClusterError>;

    async fn start_container(&self, id: &str) -> Result<(), ClusterError>;

    /// Streams the container output into `out` until the container exits.
    async fn attach_container(
        &self,
        id: &str,
        out: &(dyn OutputWriter + Send + Sync),
    ) -> Result<(), ClusterError>;

    async fn wait_container(&self, id: &str) -> Result<i64, ClusterError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, ClusterError>;

    async fn commit_container(&self, id: &str, repository: &str, tag: &str)
        -> Result<String, ClusterError>;

    async fn remove_container(&self, id: &str) -> Result<(), ClusterError>;

    /// Fails with [`ClusterError::Inactivity`] when no progress arrives for `inactivity`.
    async fn pull_image(
        &self,
        image: &str,
        out: &(dyn OutputWriter + Send + Sync),
        inactivity: Duration,
    ) -> Result<(), ClusterError>;

    async fn push_image(
        &self,
        repository: &str,
        tag: &str,
        auth: Option<&RegistryAuth>,
        out: &(dyn OutputWriter + Send + Sync),
    ) -> Result<(), ClusterError>;

    async fn tag_image(&self, source: &str, repository: &str, tag: &str)
        -> Result<(), ClusterError>;

    async fn inspect_image(&self, image: &str) -> Result<ImageInfo, ClusterError>;

    async fn remove_image(&self, image: &str) -> Result<(), ClusterError>;

    async fn download_from_container(&self, id: &str, path: &str) -> Result<Bytes, ClusterError>;

    async fn upload_to_container(
        &self,
        id: &str,
        path: &str,
        archive: Bytes,
    ) -> Result<(), ClusterError>;
}

pub type ClusterHandle = Arc<dyn ClusterClient + Send + Sync>;

#[async_trait]
pub trait ClusterConnector {
    /// Builds a client bound to one manager, failing fast on dead endpoints.
    /// A client serves a single operation and is dropped with it, so no
    /// connection outlives the operation that dialed it.
    async fn connect(
        &self,
        address: &str,
        tls: Option<&TlsConfig>,
        dial_timeout: Duration,
    ) -> Result<ClusterHandle, ClusterError>;
}
