//! Cleanup Subgraph's persistence contract (4.10, §6): idempotent
//! INSERT-if-absent on `scan_id`.

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::error::PersistenceError;

#[derive(Debug, Clone)]
pub struct PersistedRow {
    pub project_id: String,
    pub status: String,
    pub phase: String,
    pub persisted_count: u64,
    pub findings_json: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone)]
pub struct ScanResultStore {
    pool: SqlitePool,
}

impl ScanResultStore {
    pub async fn connect(db_path: &str) -> Result<Self, PersistenceError> {
        let url = format!("sqlite://{db_path}?mode=rwc");
        let pool = SqlitePoolOptions::new().max_connections(5).connect(&url).await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS scan_results (
                scan_id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                status TEXT NOT NULL,
                phase TEXT NOT NULL,
                persisted_count INTEGER NOT NULL,
                findings_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    /// Writes the row if `scan_id` is new; otherwise leaves the existing row
    /// untouched and returns its `persisted_count` (4.10's idempotence law).
    pub async fn persist_if_absent(&self, scan_id: &str, row: PersistedRow) -> Result<u64, PersistenceError> {
        if let Some(existing) = self.find(scan_id).await? {
            return Ok(existing.persisted_count);
        }

        sqlx::query(
            "INSERT INTO scan_results
                (scan_id, project_id, status, phase, persisted_count, findings_json, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(scan_id)
        .bind(&row.project_id)
        .bind(&row.status)
        .bind(&row.phase)
        .bind(row.persisted_count as i64)
        .bind(&row.findings_json)
        .bind(&row.created_at)
        .bind(&row.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(row.persisted_count)
    }

    pub async fn find(&self, scan_id: &str) -> Result<Option<PersistedRow>, PersistenceError> {
        let row = sqlx::query(
            "SELECT project_id, status, phase, persisted_count, findings_json, created_at, updated_at
             FROM scan_results WHERE scan_id = ?",
        )
        .bind(scan_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| PersistedRow {
            project_id: r.get("project_id"),
            status: r.get("status"),
            phase: r.get("phase"),
            persisted_count: r.get::<i64, _>("persisted_count") as u64,
            findings_json: r.get("findings_json"),
            created_at: r.get("created_at"),
            updated_at: r.get("updated_at"),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_store() -> (ScanResultStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.sqlite3");
        let store = ScanResultStore::connect(path.to_str().unwrap()).await.unwrap();
        (store, dir)
    }

    fn sample_row() -> PersistedRow {
        PersistedRow {
            project_id: "proj-1".to_string(),
            status: "completed".to_string(),
            phase: "completed".to_string(),
            persisted_count: 3,
            findings_json: "[]".to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[tokio::test]
    async fn persisting_twice_is_idempotent() {
        let (store, _dir) = temp_store().await;
        let first = store.persist_if_absent("scan-1", sample_row()).await.unwrap();
        let mut second_attempt = sample_row();
        second_attempt.persisted_count = 99;
        let second = store.persist_if_absent("scan-1", second_attempt).await.unwrap();
        assert_eq!(first, 3);
        assert_eq!(second, 3);
    }

    #[tokio::test]
    async fn find_returns_none_for_unknown_scan() {
        let (store, _dir) = temp_store().await;
        assert!(store.find("nope").await.unwrap().is_none());
    }
}
