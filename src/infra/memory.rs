use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::Mutex;

use crate::{
    domain::{
        model::{ImageHistory, ImageMetadata, ManagerRecord},
        port::{ClusterStorage, HistoryKind, ImageStorage},
    },
    error::StoreError,
};

#[derive(Default)]
struct State {
    histories: HashMap<HistoryKind, BTreeMap<String, ImageHistory>>,
    metadata: BTreeMap<String, ImageMetadata>,
    managers: Option<ManagerRecord>,
}

impl State {
    fn histories(&mut self, kind: HistoryKind) -> &mut BTreeMap<String, ImageHistory> {
        self.histories.entry(kind).or_default()
    }
}

/// Process local store. Every operation holds one lock, so appends and
/// increments are atomic.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

#[async_trait]
impl ImageStorage for MemoryStore {
    async fn increment_count(&self, kind: HistoryKind, name: &str) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let history = state
            .histories(kind)
            .entry(name.to_string())
            .or_insert_with(|| ImageHistory {
                name: name.to_string(),
                ..Default::default()
            });
        history.count += 1;
        Ok(history.count)
    }

    async fn find_history(
        &self,
        kind: HistoryKind,
        name: &str,
    ) -> Result<Option<ImageHistory>, StoreError> {
        Ok(self.state.lock().await.histories(kind).get(name).cloned())
    }

    async fn append_image(
        &self,
        kind: HistoryKind,
        name: &str,
        image: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let history = state
            .histories(kind)
            .entry(name.to_string())
            .or_insert_with(|| ImageHistory {
                name: name.to_string(),
                ..Default::default()
            });
        history.images.retain(|existing| existing != image);
        history.images.push(image.to_string());
        Ok(())
    }

    async fn pull_images(
        &self,
        kind: HistoryKind,
        name: &str,
        images: &[String],
    ) -> Result<(), StoreError> {
        if let Some(history) = self.state.lock().await.histories(kind).get_mut(name) {
            history.images.retain(|existing| !images.contains(existing));
        }
        Ok(())
    }

    async fn delete_history(&self, kind: HistoryKind, name: &str) -> Result<(), StoreError> {
        self.state.lock().await.histories(kind).remove(name);
        Ok(())
    }

    async fn list_histories(&self, kind: HistoryKind) -> Result<Vec<ImageHistory>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .histories(kind)
            .values()
            .cloned()
            .collect())
    }

    async fn save_metadata(&self, metadata: &ImageMetadata) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .metadata
            .insert(metadata.name.clone(), metadata.clone());
        Ok(())
    }

    async fn find_metadata(&self, name: &str) -> Result<Option<ImageMetadata>, StoreError> {
        Ok(self.state.lock().await.metadata.get(name).cloned())
    }

    async fn delete_metadata(&self, names: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for name in names {
            state.metadata.remove(name);
        }
        Ok(())
    }

    async fn delete_metadata_matching(&self, pattern: &Regex) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.metadata.len();
        state.metadata.retain(|name, _| !pattern.is_match(name));
        Ok((before - state.metadata.len()) as u64)
    }

    async fn list_metadata(&self) -> Result<Vec<ImageMetadata>, StoreError> {
        Ok(self.state.lock().await.metadata.values().cloned().collect())
    }
}

#[async_trait]
impl ClusterStorage for MemoryStore {
    async fn load_managers(&self) -> Result<Option<ManagerRecord>, StoreError> {
        Ok(self.state.lock().await.managers.clone())
    }

    async fn save_managers(&self, record: &ManagerRecord) -> Result<(), StoreError> {
        self.state.lock().await.managers = Some(record.clone());
        Ok(())
    }
}
