//! SQLite-backed [`FileStore`] and vector snapshots.
//!
//! The `files` table is the authoritative record of what has been
//! ingested. The in-memory vector index is persisted to the `vectors`
//! table as a whole-index snapshot, together with the model that produced
//! it, and loaded back at startup.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use recall_harness_core::embedding::{blob_to_vec, vec_to_blob};
use recall_harness_core::files::FileStore;
use recall_harness_core::models::{FileRecord, ModelInfo, RecordMetadata, VectorRecord};

/// SQLite implementation of the [`FileStore`] trait.
pub struct SqliteFileStore {
    pool: SqlitePool,
}

impl SqliteFileStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Replace the stored snapshot with `records` in one transaction.
    pub async fn save_snapshot(
        &self,
        records: &[Arc<VectorRecord>],
        model: Option<&ModelInfo>,
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM vectors").execute(&mut *tx).await?;

        for (seq, record) in records.iter().enumerate() {
            let metadata_json = serde_json::to_string(&record.metadata)?;
            sqlx::query(
                r#"
                INSERT INTO vectors (id, file_id, seq, content, metadata_json, embedding)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.id)
            .bind(&record.metadata.file_id)
            .bind(seq as i64)
            .bind(&record.content)
            .bind(&metadata_json)
            .bind(vec_to_blob(&record.embedding))
            .execute(&mut *tx)
            .await?;
        }

        if let Some(model) = model {
            for (key, value) in [
                ("model_name", model.name.clone()),
                ("model_dimensions", model.dimensions.to_string()),
            ] {
                sqlx::query(
                    r#"
                    INSERT INTO index_meta (key, value) VALUES (?, ?)
                    ON CONFLICT(key) DO UPDATE SET value = excluded.value
                    "#,
                )
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(records.len())
    }

    /// Records of the last snapshot, in their original insertion order.
    pub async fn load_snapshot(&self) -> Result<Vec<VectorRecord>> {
        let rows = sqlx::query(
            "SELECT id, content, metadata_json, embedding FROM vectors ORDER BY seq ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<VectorRecord> {
                let id: String = row.get("id");
                let metadata_json: String = row.get("metadata_json");
                let blob: Vec<u8> = row.get("embedding");
                let metadata: RecordMetadata = serde_json::from_str(&metadata_json)
                    .with_context(|| format!("corrupt metadata for vector {}", id))?;
                Ok(VectorRecord {
                    id,
                    embedding: blob_to_vec(&blob),
                    content: row.get("content"),
                    metadata,
                })
            })
            .collect()
    }

    /// Model recorded with the last snapshot, if any.
    pub async fn stored_model(&self) -> Result<Option<ModelInfo>> {
        let rows = sqlx::query("SELECT key, value FROM index_meta")
            .fetch_all(&self.pool)
            .await?;
        let lookup = |key: &str| {
            rows.iter()
                .find(|r| r.get::<String, _>("key") == key)
                .map(|r| r.get::<String, _>("value"))
        };
        match (lookup("model_name"), lookup("model_dimensions")) {
            (Some(name), Some(dims)) => Ok(Some(ModelInfo {
                name,
                dimensions: usize::from_str(&dims).context("corrupt model_dimensions")?,
            })),
            _ => Ok(None),
        }
    }

    pub async fn vector_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vectors")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("invalid timestamp: {}", s))?
        .with_timezone(&Utc))
}

fn row_to_file(row: &SqliteRow) -> Result<FileRecord> {
    let size: i64 = row.get("size");
    Ok(FileRecord {
        id: row.get("id"),
        path: row.get("path"),
        name: row.get("name"),
        size: size.max(0) as u64,
        hash: row.get("hash"),
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        modified_at: parse_ts(&row.get::<String, _>("modified_at"))?,
    })
}

#[async_trait]
impl FileStore for SqliteFileStore {
    async fn list_files(&self) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query("SELECT * FROM files ORDER BY path ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_file).collect()
    }

    async fn get_file_by_id(&self, id: &str) -> Result<Option<FileRecord>> {
        let row = sqlx::query("SELECT * FROM files WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_file).transpose()
    }

    async fn get_file_by_path(&self, path: &str) -> Result<Option<FileRecord>> {
        let row = sqlx::query("SELECT * FROM files WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_file).transpose()
    }

    async fn upsert_file(&self, file: &FileRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Keep paths unique when a path is re-registered under a new id.
        sqlx::query("DELETE FROM files WHERE path = ? AND id != ?")
            .bind(&file.path)
            .bind(&file.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO files (id, path, name, size, hash, created_at, modified_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                path = excluded.path,
                name = excluded.name,
                size = excluded.size,
                hash = excluded.hash,
                modified_at = excluded.modified_at
            "#,
        )
        .bind(&file.id)
        .bind(&file.path)
        .bind(&file.name)
        .bind(file.size as i64)
        .bind(&file.hash)
        .bind(format_ts(&file.created_at))
        .bind(format_ts(&file.modified_at))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn remove_file(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
