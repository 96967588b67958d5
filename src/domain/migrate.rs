use log::info;

use crate::error::Result;

use super::{model::ImageMetadata, port::ImageStorage};

/// Copies the legacy single `exposedport` into `exposedports` when the
/// latter is empty. Returns how many records were rewritten.
pub async fn migrate_exposed_ports(storage: &(dyn ImageStorage + Send + Sync)) -> Result<usize> {
    let mut migrated = 0;
    for mut metadata in storage.list_metadata().await? {
        if !upgrade_exposed_ports(&mut metadata) {
            continue;
        }
        storage.save_metadata(&metadata).await?;
        info!("Migrated exposed port of image {}", metadata.name);
        migrated += 1;
    }
    Ok(migrated)
}

fn upgrade_exposed_ports(metadata: &mut ImageMetadata) -> bool {
    if !metadata.exposed_ports.is_empty() {
        return false;
    }
    match metadata.legacy_exposed_port.as_deref() {
        Some(port) if !port.is_empty() => {
            metadata.exposed_ports = vec![port.to_string()];
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::infra::memory::MemoryStore;

    #[tokio::test]
    async fn legacy_exposed_port_becomes_list() {
        let store = MemoryStore::default();
        let records = [
            json!({"_id": "1", "exposedport": "8000/tcp"}),
            json!({"_id": "2", "exposedport": "8001/tcp", "exposedports": ["8002/tcp", "8003/tcp"]}),
            json!({"_id": "3", "exposedport": "", "exposedports": ["8004/tcp"]}),
            json!({"_id": "4"}),
        ];
        let mut before = Vec::new();
        for record in records {
            let metadata: ImageMetadata = serde_json::from_value(record).unwrap();
            store.save_metadata(&metadata).await.unwrap();
            before.push(metadata);
        }

        assert_eq!(migrate_exposed_ports(&store).await.unwrap(), 1);

        let first = store.find_metadata("1").await.unwrap().unwrap();
        assert_eq!(first.exposed_ports, vec!["8000/tcp"]);
        assert_eq!(first.legacy_exposed_port.as_deref(), Some("8000/tcp"));
        for unchanged in &before[1..] {
            assert_eq!(
                &store.find_metadata(&unchanged.name).await.unwrap().unwrap(),
                unchanged
            );
        }
    }

    #[tokio::test]
    async fn migration_is_idempotent() {
        let store = MemoryStore::default();
        let metadata: ImageMetadata =
            serde_json::from_value(json!({"_id": "1", "exposedport": "8000/tcp"})).unwrap();
        store.save_metadata(&metadata).await.unwrap();
        assert_eq!(migrate_exposed_ports(&store).await.unwrap(), 1);
        assert_eq!(migrate_exposed_ports(&store).await.unwrap(), 0);
    }
}
