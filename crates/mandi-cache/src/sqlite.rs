//! SQLite-backed persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mandi_core::{
    AccessUpdate, CacheBackend, CacheContent, CacheEntry, CacheError, CacheKey, Priority, QueryId,
    RegisteredQuery, Result,
};
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, instrument, warn};

/// Durable backend storing entries and offline queries in a SQLite file.
///
/// Payloads are stored as their JSON encoding; accounting metadata lives in
/// dedicated columns so rows can be inspected without decoding the payload.
#[derive(Debug)]
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Opens (or creates) the database at `path`.
    ///
    /// # Errors
    /// Returns [`CacheError::Storage`] if the database cannot be opened or the
    /// schema cannot be created.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(CacheError::storage)?;
        let backend = Self {
            conn: Mutex::new(conn),
        };
        backend.initialize_schema()?;
        Ok(backend)
    }

    /// Opens a private in-memory database; contents vanish on drop.
    ///
    /// # Errors
    /// Returns [`CacheError::Storage`] if schema creation fails.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(CacheError::storage)?;
        let backend = Self {
            conn: Mutex::new(conn),
        };
        backend.initialize_schema()?;
        Ok(backend)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(CacheError::storage)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                data_type TEXT NOT NULL,
                priority TEXT NOT NULL,
                content_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                expires_at TEXT,
                size_bytes INTEGER NOT NULL,
                content_hash TEXT NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 0,
                last_accessed TEXT
            )",
            [],
        )
        .map_err(CacheError::storage)?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_cache_entries_type_priority
             ON cache_entries(data_type, priority)",
            [],
        )
        .map_err(CacheError::storage)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS offline_queries (
                id TEXT PRIMARY KEY,
                data_type TEXT NOT NULL,
                status TEXT NOT NULL,
                registered_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                query_json TEXT NOT NULL
            )",
            [],
        )
        .map_err(CacheError::storage)?;

        debug!("SQLite cache schema initialized");
        Ok(())
    }
}

/// Columns of one `cache_entries` row, before decoding.
struct EntryRow {
    key: String,
    priority: String,
    content_json: String,
    created_at: String,
    updated_at: String,
    expires_at: Option<String>,
    size_bytes: i64,
    content_hash: String,
    access_count: i64,
    last_accessed: Option<String>,
}

impl EntryRow {
    fn decode(self) -> Result<CacheEntry> {
        let key = CacheKey::parse(&self.key)?;
        let content: CacheContent = serde_json::from_str(&self.content_json)?;
        let priority = Priority::parse(&self.priority)
            .ok_or_else(|| CacheError::Parse(format!("unknown priority '{}'", self.priority)))?;
        Ok(CacheEntry {
            data_type: key.data_type(),
            key,
            content,
            priority,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            expires_at: self.expires_at.as_deref().map(parse_time).transpose()?,
            size_bytes: u64::try_from(self.size_bytes).unwrap_or_default(),
            content_hash: self.content_hash,
            access_count: u64::try_from(self.access_count).unwrap_or_default(),
            last_accessed: self.last_accessed.as_deref().map(parse_time).transpose()?,
        })
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CacheError::Parse(format!("invalid timestamp '{s}': {e}")))
}

fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl CacheBackend for SqliteBackend {
    #[instrument(skip(self))]
    async fn load_entries(&self) -> Result<Vec<CacheEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT key, priority, content_json, created_at, updated_at, expires_at,
                        size_bytes, content_hash, access_count, last_accessed
                 FROM cache_entries",
            )
            .map_err(CacheError::storage)?;

        let rows = stmt
            .query_map([], |row| {
                Ok(EntryRow {
                    key: row.get(0)?,
                    priority: row.get(1)?,
                    content_json: row.get(2)?,
                    created_at: row.get(3)?,
                    updated_at: row.get(4)?,
                    expires_at: row.get(5)?,
                    size_bytes: row.get(6)?,
                    content_hash: row.get(7)?,
                    access_count: row.get(8)?,
                    last_accessed: row.get(9)?,
                })
            })
            .map_err(CacheError::storage)?;

        let mut entries = Vec::new();
        for row in rows {
            let row = row.map_err(CacheError::storage)?;
            let key = row.key.clone();
            match row.decode() {
                Ok(entry) => entries.push(entry),
                // An undecodable row is skipped rather than failing the whole load
                Err(e) => warn!(key = %key, error = %e, "Skipping undecodable cache row"),
            }
        }

        debug!(count = entries.len(), "Loaded cache entries");
        Ok(entries)
    }

    #[instrument(skip(self, entry), fields(key = %entry.key))]
    async fn upsert_entry(&self, entry: &CacheEntry) -> Result<()> {
        let content_json = serde_json::to_string(&entry.content)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO cache_entries
             (key, data_type, priority, content_json, created_at, updated_at, expires_at,
              size_bytes, content_hash, access_count, last_accessed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                entry.key.to_string(),
                entry.data_type.as_str(),
                entry.priority.as_str(),
                content_json,
                entry.created_at.to_rfc3339(),
                entry.updated_at.to_rfc3339(),
                entry.expires_at.map(|t| t.to_rfc3339()),
                to_sql_int(entry.size_bytes),
                entry.content_hash,
                to_sql_int(entry.access_count),
                entry.last_accessed.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(CacheError::storage)?;
        Ok(())
    }

    #[instrument(skip(self, keys), fields(count = keys.len()))]
    async fn remove_entries(&self, keys: &[CacheKey]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction().map_err(CacheError::storage)?;
        let mut removed = 0;
        for key in keys {
            removed += tx
                .execute("DELETE FROM cache_entries WHERE key = ?1", params![key.to_string()])
                .map_err(CacheError::storage)?;
        }
        tx.commit().map_err(CacheError::storage)?;
        debug!(removed, "Removed cache rows");
        Ok(removed)
    }

    #[instrument(skip(self, updates), fields(count = updates.len()))]
    async fn update_access(&self, updates: &[AccessUpdate]) -> Result<usize> {
        if updates.is_empty() {
            return Ok(0);
        }
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction().map_err(CacheError::storage)?;
        let mut updated = 0;
        for update in updates {
            updated += tx
                .execute(
                    "UPDATE cache_entries SET access_count = ?2, last_accessed = ?3 WHERE key = ?1",
                    params![
                        update.key.to_string(),
                        to_sql_int(update.access_count),
                        update.last_accessed.map(|t| t.to_rfc3339()),
                    ],
                )
                .map_err(CacheError::storage)?;
        }
        tx.commit().map_err(CacheError::storage)?;
        debug!(updated, "Persisted access statistics");
        Ok(updated)
    }

    #[instrument(skip(self))]
    async fn clear_entries(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM cache_entries", [])
            .map_err(CacheError::storage)?;
        debug!("Cleared cache rows");
        Ok(())
    }

    #[instrument(skip(self, query), fields(id = %query.id))]
    async fn save_query(&self, query: &RegisteredQuery) -> Result<()> {
        let query_json = serde_json::to_string(query)?;
        let status = serde_json::to_value(query.status)?
            .as_str()
            .unwrap_or_default()
            .to_string();
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO offline_queries
             (id, data_type, status, registered_at, expires_at, query_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                query.id.as_str(),
                query.query.data_type.as_str(),
                status,
                query.registered_at.to_rfc3339(),
                query.expires_at.to_rfc3339(),
                query_json,
            ],
        )
        .map_err(CacheError::storage)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_queries(&self) -> Result<Vec<RegisteredQuery>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT query_json FROM offline_queries")
            .map_err(CacheError::storage)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(CacheError::storage)?;

        let mut queries = Vec::new();
        for row in rows {
            let json = row.map_err(CacheError::storage)?;
            match serde_json::from_str::<RegisteredQuery>(&json) {
                Ok(query) => queries.push(query),
                Err(e) => warn!(error = %e, "Skipping undecodable offline query"),
            }
        }
        debug!(count = queries.len(), "Loaded offline queries");
        Ok(queries)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn remove_queries(&self, ids: &[QueryId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction().map_err(CacheError::storage)?;
        let mut removed = 0;
        for id in ids {
            removed += tx
                .execute("DELETE FROM offline_queries WHERE id = ?1", params![id.as_str()])
                .map_err(CacheError::storage)?;
        }
        tx.commit().map_err(CacheError::storage)?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mandi_core::{ContentFilter, DataType, MspRate, OfflineQuery, QueryStatus};

    fn msp_entry(commodity: &str) -> CacheEntry {
        let content = CacheContent::MspRate(MspRate {
            commodity: commodity.to_string(),
            season: "rabi".to_string(),
            crop_year: "2024-25".to_string(),
            price_per_quintal: 2275.0,
        });
        let encoded = content.encode().unwrap();
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 0).unwrap();
        CacheEntry {
            key: CacheKey::msp(commodity),
            data_type: DataType::MspRate,
            content_hash: content.content_hash().unwrap(),
            size_bytes: encoded.len() as u64,
            content,
            priority: Priority::Critical,
            created_at: at,
            updated_at: at,
            expires_at: Some(at + chrono::TimeDelta::hours(168)),
            access_count: 3,
            last_accessed: Some(at),
        }
    }

    #[tokio::test]
    async fn test_sqlite_entry_roundtrip() {
        let backend = SqliteBackend::in_memory().unwrap();
        let entry = msp_entry("wheat");
        backend.upsert_entry(&entry).await.unwrap();

        let loaded = backend.load_entries().await.unwrap();
        assert_eq!(loaded, vec![entry]);
    }

    #[tokio::test]
    async fn test_sqlite_upsert_replaces() {
        let backend = SqliteBackend::in_memory().unwrap();
        let mut entry = msp_entry("wheat");
        backend.upsert_entry(&entry).await.unwrap();
        entry.access_count = 9;
        backend.upsert_entry(&entry).await.unwrap();

        let loaded = backend.load_entries().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].access_count, 9);
    }

    #[tokio::test]
    async fn test_sqlite_remove_and_clear() {
        let backend = SqliteBackend::in_memory().unwrap();
        backend.upsert_entry(&msp_entry("wheat")).await.unwrap();
        backend.upsert_entry(&msp_entry("rice")).await.unwrap();

        let removed = backend
            .remove_entries(&[CacheKey::msp("wheat"), CacheKey::msp("jowar")])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(backend.load_entries().await.unwrap().len(), 1);

        backend.clear_entries().await.unwrap();
        assert!(backend.load_entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_update_access() {
        let backend = SqliteBackend::in_memory().unwrap();
        let entry = msp_entry("wheat");
        backend.upsert_entry(&entry).await.unwrap();

        let read_at = Utc.with_ymd_and_hms(2024, 6, 2, 9, 30, 0).unwrap();
        let updated = backend
            .update_access(&[
                AccessUpdate {
                    key: CacheKey::msp("wheat"),
                    access_count: 12,
                    last_accessed: Some(read_at),
                },
                AccessUpdate {
                    key: CacheKey::msp("jowar"),
                    access_count: 1,
                    last_accessed: None,
                },
            ])
            .await
            .unwrap();
        assert_eq!(updated, 1);

        let loaded = backend.load_entries().await.unwrap();
        assert_eq!(loaded[0].access_count, 12);
        assert_eq!(loaded[0].last_accessed, Some(read_at));
        assert_eq!(loaded[0].content, entry.content);
    }

    #[tokio::test]
    async fn test_sqlite_query_persistence() {
        let backend = SqliteBackend::in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let query = RegisteredQuery::register(
            OfflineQuery::new(DataType::Price, ContentFilter::new().with_commodity("onion")),
            now,
        )
        .unwrap();
        backend.save_query(&query).await.unwrap();

        let loaded = backend.load_queries().await.unwrap();
        assert_eq!(loaded, vec![query.clone()]);
        assert_eq!(loaded[0].status, QueryStatus::Pending);

        assert_eq!(backend.remove_queries(&[query.id]).await.unwrap(), 1);
        assert!(backend.load_queries().await.unwrap().is_empty());
    }
}
