use async_trait::async_trait;
use log::info;
use regex::Regex;
use sqlx::{
    sqlite::{SqlitePool, SqlitePoolOptions},
    Row,
};

use crate::{
    domain::{
        model::{ImageHistory, ImageMetadata, ManagerRecord},
        port::{ClusterStorage, HistoryKind, ImageStorage},
    },
    error::StoreError,
};

const MANAGERS_ID: &str = "swarm-managers";

/// SQLite-backed image and cluster store. Every collection is a table named
/// `<prefix>_<collection>`.
pub struct SqliteStore {
    pool: SqlitePool,
    prefix: String,
}

impl SqliteStore {
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        Self::with_pool(pool, prefix).await
    }

    pub async fn with_pool(pool: SqlitePool, prefix: &str) -> Result<Self, StoreError> {
        let prefix: String = prefix
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        let store = Self { pool, prefix };
        store.create_tables().await?;
        info!("Image store ready with collection prefix {}", store.prefix);
        Ok(store)
    }

    async fn create_tables(&self) -> Result<(), StoreError> {
        for kind in [HistoryKind::App, HistoryKind::Builder, HistoryKind::Platform] {
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    name TEXT PRIMARY KEY,
                    count INTEGER NOT NULL DEFAULT 0,
                    images TEXT NOT NULL DEFAULT '[]'
                )
                "#,
                self.history_table(kind)
            ))
            .execute(&self.pool)
            .await?;
        }
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (name TEXT PRIMARY KEY, data TEXT NOT NULL)",
            self.metadata_table()
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (id TEXT PRIMARY KEY, data TEXT NOT NULL)",
            self.cluster_table()
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn history_table(&self, kind: HistoryKind) -> String {
        format!("{}_{}", self.prefix, kind.collection_suffix())
    }

    fn metadata_table(&self) -> String {
        format!("{}_image_custom_data", self.prefix)
    }

    fn cluster_table(&self) -> String {
        format!("{}_cluster", self.prefix)
    }

    fn history_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ImageHistory, StoreError> {
        let name: String = row.get("name");
        let images: String = row.get("images");
        let images = serde_json::from_str(&images).map_err(|source| StoreError::Decode {
            key: name.clone(),
            source,
        })?;
        Ok(ImageHistory {
            name,
            count: row.get::<i64, _>("count") as u64,
            images,
        })
    }
}

fn encode<T: serde::Serialize>(key: &str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|source| StoreError::Encode {
        key: key.to_string(),
        source,
    })
}

fn decode<T: serde::de::DeserializeOwned>(key: &str, raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|source| StoreError::Decode {
        key: key.to_string(),
        source,
    })
}

#[async_trait]
impl ImageStorage for SqliteStore {
    async fn increment_count(&self, kind: HistoryKind, name: &str) -> Result<u64, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO {} (name, count, images) VALUES (?, 1, '[]')
            ON CONFLICT(name) DO UPDATE SET count = count + 1
            RETURNING count
            "#,
            self.history_table(kind)
        ))
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("count") as u64)
    }

    async fn find_history(
        &self,
        kind: HistoryKind,
        name: &str,
    ) -> Result<Option<ImageHistory>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT name, count, images FROM {} WHERE name = ?",
            self.history_table(kind)
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::history_from_row).transpose()
    }

    // Single statement, so readers see either the old or the new list.
    async fn append_image(
        &self,
        kind: HistoryKind,
        name: &str,
        image: &str,
    ) -> Result<(), StoreError> {
        let table = self.history_table(kind);
        sqlx::query(&format!(
            r#"
            INSERT INTO {table} (name, count, images) VALUES (?1, 0, json_array(?2))
            ON CONFLICT(name) DO UPDATE SET images = json_insert(
                (SELECT json_group_array(value) FROM json_each({table}.images) WHERE value != ?2),
                '$[#]',
                ?2
            )
            "#
        ))
        .bind(name)
        .bind(image)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pull_images(
        &self,
        kind: HistoryKind,
        name: &str,
        images: &[String],
    ) -> Result<(), StoreError> {
        let table = self.history_table(kind);
        sqlx::query(&format!(
            r#"
            UPDATE {table} SET images = (
                SELECT json_group_array(value) FROM json_each({table}.images)
                WHERE value NOT IN (SELECT value FROM json_each(?1))
            )
            WHERE name = ?2
            "#
        ))
        .bind(encode(name, &images)?)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_history(&self, kind: HistoryKind, name: &str) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE name = ?",
            self.history_table(kind)
        ))
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_histories(&self, kind: HistoryKind) -> Result<Vec<ImageHistory>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT name, count, images FROM {} ORDER BY name",
            self.history_table(kind)
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::history_from_row).collect()
    }

    async fn save_metadata(&self, metadata: &ImageMetadata) -> Result<(), StoreError> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (name, data) VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE SET data = excluded.data
            "#,
            self.metadata_table()
        ))
        .bind(&metadata.name)
        .bind(encode(&metadata.name, metadata)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_metadata(&self, name: &str) -> Result<Option<ImageMetadata>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT data FROM {} WHERE name = ?",
            self.metadata_table()
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| decode(name, r.get::<&str, _>("data")))
            .transpose()
    }

    async fn delete_metadata(&self, names: &[String]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for name in names {
            sqlx::query(&format!(
                "DELETE FROM {} WHERE name = ?",
                self.metadata_table()
            ))
            .bind(name)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_metadata_matching(&self, pattern: &Regex) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let names: Vec<String> = sqlx::query(&format!("SELECT name FROM {}", self.metadata_table()))
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .map(|r| r.get::<String, _>("name"))
            .filter(|name| pattern.is_match(name))
            .collect();
        for name in &names {
            sqlx::query(&format!(
                "DELETE FROM {} WHERE name = ?",
                self.metadata_table()
            ))
            .bind(name)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(names.len() as u64)
    }

    async fn list_metadata(&self) -> Result<Vec<ImageMetadata>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT name, data FROM {} ORDER BY name",
            self.metadata_table()
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| decode(r.get::<&str, _>("name"), r.get::<&str, _>("data")))
            .collect()
    }
}

#[async_trait]
impl ClusterStorage for SqliteStore {
    async fn load_managers(&self) -> Result<Option<ManagerRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT data FROM {} WHERE id = ?",
            self.cluster_table()
        ))
        .bind(MANAGERS_ID)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| decode(MANAGERS_ID, r.get::<&str, _>("data")))
            .transpose()
    }

    async fn save_managers(&self, record: &ManagerRecord) -> Result<(), StoreError> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (id, data) VALUES (?, ?)
            ON CONFLICT(id) DO UPDATE SET data = excluded.data
            "#,
            self.cluster_table()
        ))
        .bind(MANAGERS_ID)
        .bind(encode(MANAGERS_ID, record)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
