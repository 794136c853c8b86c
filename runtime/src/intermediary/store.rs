//! Durable cache namespaces backed by SQLite.
//!
//! Three tables: `namespaces` (creation order matters for cross-namespace
//! lookups), `entries` (one stored response per namespace and key) and
//! `sync_tags` (registered background-sync triggers). Every write replaces
//! any prior row for the same key, so concurrent writers are
//! last-writer-wins.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use indexmap::IndexMap;
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::Mutex;
use upm_embed::{Clock, ANALYTICS_QUEUE_NAMESPACE};

use crate::error::StoreError;
use crate::net::{FetchRequest, FetchResponse};

/// Header carrying the capture time of a cached response.
pub const CACHED_AT_HEADER: &str = "x-upm-cached-at";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS namespaces (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS entries (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    request_headers TEXT NOT NULL DEFAULT '[]',
    request_body BLOB,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    captured_at INTEGER NOT NULL,
    PRIMARY KEY (namespace, key)
);
CREATE TABLE IF NOT EXISTS sync_tags (
    tag TEXT PRIMARY KEY,
    registered_at INTEGER NOT NULL
);
";

/// A response stored in a namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub namespace: String,
    pub key: String,
    pub method: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub captured_at_ms: u64,
}

impl CachedResponse {
    /// The stored response with its capture time echoed as a header.
    pub fn into_response(self) -> FetchResponse {
        FetchResponse {
            status: self.status,
            headers: self.headers,
            body: self.body,
        }
        .with_header(CACHED_AT_HEADER, &self.captured_at_ms.to_string())
    }
}

/// A telemetry request parked in the offline queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedRequest {
    pub key: String,
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub queued_at_ms: u64,
}

impl QueuedRequest {
    /// Wrap `request` under a unique `{url}#{uuid}` key.
    pub fn from_request(request: &FetchRequest) -> Self {
        Self {
            key: format!("{}#{}", request.url, uuid::Uuid::new_v4()),
            method: request.method.clone(),
            url: request.url.clone(),
            headers: request.headers.clone(),
            body: request.body.clone().unwrap_or_default(),
            queued_at_ms: 0,
        }
    }

    pub fn to_request(&self) -> FetchRequest {
        FetchRequest {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: Some(self.body.clone()),
            mode: Default::default(),
            keepalive: false,
        }
    }
}

/// Persistent namespace store.
pub struct CacheStorage {
    db: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl CacheStorage {
    /// Open or create the store at `path`.
    pub fn open(path: &Path, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Connection::open(path)?;
        Self::init(db, clock)
    }

    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, clock)
    }

    fn init(db: Connection, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        db.execute_batch(SCHEMA)?;
        Ok(Self {
            db: Mutex::new(db),
            clock,
        })
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    // ── Namespaces ────────────────────────

    /// Create `name` if missing. Returns true when it was created.
    pub async fn open_namespace(&self, name: &str) -> Result<bool, StoreError> {
        let db = self.db.lock().await;
        let n = db.execute(
            "INSERT OR IGNORE INTO namespaces (name) VALUES (?1)",
            rusqlite::params![name],
        )?;
        Ok(n > 0)
    }

    /// Namespace names in creation order.
    pub async fn names(&self) -> Result<Vec<String>, StoreError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare("SELECT name FROM namespaces ORDER BY id")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    pub async fn has_namespace(&self, name: &str) -> Result<bool, StoreError> {
        let db = self.db.lock().await;
        let found = db
            .query_row(
                "SELECT 1 FROM namespaces WHERE name = ?1",
                rusqlite::params![name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Delete a namespace and all its entries.
    pub async fn delete_namespace(&self, name: &str) -> Result<bool, StoreError> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        tx.execute(
            "DELETE FROM entries WHERE namespace = ?1",
            rusqlite::params![name],
        )?;
        let n = tx.execute(
            "DELETE FROM namespaces WHERE name = ?1",
            rusqlite::params![name],
        )?;
        tx.commit()?;
        Ok(n > 0)
    }

    /// Delete every namespace. Returns how many were deleted.
    pub async fn clear_all(&self) -> Result<usize, StoreError> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        tx.execute("DELETE FROM entries", [])?;
        let n = tx.execute("DELETE FROM namespaces", [])?;
        tx.commit()?;
        Ok(n)
    }

    /// Entry count per namespace, in creation order.
    pub async fn status(&self) -> Result<IndexMap<String, usize>, StoreError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT n.name, COUNT(e.key) FROM namespaces n
             LEFT JOIN entries e ON e.namespace = n.name
             GROUP BY n.id, n.name ORDER BY n.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut status = IndexMap::new();
        for row in rows {
            let (name, count) = row?;
            status.insert(name, count.max(0) as usize);
        }
        Ok(status)
    }

    // ── Entries ───────────────────────────

    /// Store `response` under `key`, stamped with the current time.
    pub async fn put(
        &self,
        namespace: &str,
        key: &str,
        response: &FetchResponse,
    ) -> Result<(), StoreError> {
        let captured_at = self.clock.now_ms();
        let headers: Vec<(String, String)> = response
            .headers
            .iter()
            .filter(|(k, _)| !k.eq_ignore_ascii_case(CACHED_AT_HEADER))
            .cloned()
            .collect();
        let headers = serde_json::to_string(&headers)?;

        let db = self.db.lock().await;
        db.execute(
            "INSERT OR IGNORE INTO namespaces (name) VALUES (?1)",
            rusqlite::params![namespace],
        )?;
        db.execute(
            "INSERT OR REPLACE INTO entries
             (namespace, key, method, url, status, headers, body, captured_at)
             VALUES (?1, ?2, 'GET', ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                namespace,
                key,
                response.status as i64,
                headers,
                response.body.as_ref(),
                captured_at as i64
            ],
        )?;
        Ok(())
    }

    pub async fn get(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<CachedResponse>, StoreError> {
        let db = self.db.lock().await;
        let row = db
            .query_row(
                "SELECT namespace, key, method, status, headers, body, captured_at
                 FROM entries WHERE namespace = ?1 AND key = ?2",
                rusqlite::params![namespace, key],
                read_cached_row,
            )
            .optional()?;
        row.map(decode_cached).transpose()
    }

    /// First entry for `key` across all namespaces, in namespace creation order.
    pub async fn match_any(&self, key: &str) -> Result<Option<CachedResponse>, StoreError> {
        let db = self.db.lock().await;
        let row = db
            .query_row(
                "SELECT e.namespace, e.key, e.method, e.status, e.headers, e.body, e.captured_at
                 FROM entries e JOIN namespaces n ON n.name = e.namespace
                 WHERE e.key = ?1 ORDER BY n.id LIMIT 1",
                rusqlite::params![key],
                read_cached_row,
            )
            .optional()?;
        row.map(decode_cached).transpose()
    }

    pub async fn delete(&self, namespace: &str, key: &str) -> Result<bool, StoreError> {
        let db = self.db.lock().await;
        let n = db.execute(
            "DELETE FROM entries WHERE namespace = ?1 AND key = ?2",
            rusqlite::params![namespace, key],
        )?;
        Ok(n > 0)
    }

    /// Keys of `namespace` in insertion order.
    pub async fn keys(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
        let db = self.db.lock().await;
        let mut stmt =
            db.prepare("SELECT key FROM entries WHERE namespace = ?1 ORDER BY rowid")?;
        let keys = stmt
            .query_map(rusqlite::params![namespace], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    pub async fn count(&self, namespace: &str) -> Result<usize, StoreError> {
        let db = self.db.lock().await;
        let n: i64 = db.query_row(
            "SELECT COUNT(*) FROM entries WHERE namespace = ?1",
            rusqlite::params![namespace],
            |row| row.get(0),
        )?;
        Ok(n.max(0) as usize)
    }

    /// Keys captured strictly before `cutoff_ms`.
    pub async fn entries_older_than(
        &self,
        namespace: &str,
        cutoff_ms: u64,
    ) -> Result<Vec<String>, StoreError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT key FROM entries WHERE namespace = ?1 AND captured_at < ?2 ORDER BY rowid",
        )?;
        let keys = stmt
            .query_map(rusqlite::params![namespace, cutoff_ms as i64], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    /// Delete entries captured before `cutoff_ms`. Returns how many went.
    pub async fn sweep(&self, namespace: &str, cutoff_ms: u64) -> Result<usize, StoreError> {
        let db = self.db.lock().await;
        let n = db.execute(
            "DELETE FROM entries WHERE namespace = ?1 AND captured_at < ?2",
            rusqlite::params![namespace, cutoff_ms as i64],
        )?;
        Ok(n)
    }

    // ── Offline queue ─────────────────────

    /// Park a request in the analytics queue namespace.
    pub async fn enqueue_request(&self, request: &QueuedRequest) -> Result<(), StoreError> {
        let queued_at = self.clock.now_ms();
        let headers = serde_json::to_string(&request.headers)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT OR IGNORE INTO namespaces (name) VALUES (?1)",
            rusqlite::params![ANALYTICS_QUEUE_NAMESPACE],
        )?;
        db.execute(
            "INSERT OR REPLACE INTO entries
             (namespace, key, method, url, request_headers, request_body,
              status, headers, body, captured_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 200, '[]', x'', ?7)",
            rusqlite::params![
                ANALYTICS_QUEUE_NAMESPACE,
                request.key,
                request.method,
                request.url,
                headers,
                request.body.as_ref(),
                queued_at as i64
            ],
        )?;
        Ok(())
    }

    /// Every parked request, oldest first.
    pub async fn pending_requests(&self) -> Result<Vec<QueuedRequest>, StoreError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT key, method, url, request_headers, request_body, captured_at
             FROM entries WHERE namespace = ?1 ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![ANALYTICS_QUEUE_NAMESPACE], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<Vec<u8>>>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(key, method, url, headers, body, queued_at)| -> Result<QueuedRequest, StoreError> {
                Ok(QueuedRequest {
                    key,
                    method,
                    url,
                    headers: serde_json::from_str(&headers)?,
                    body: Bytes::from(body.unwrap_or_default()),
                    queued_at_ms: queued_at.max(0) as u64,
                })
            },
            )
            .collect()
    }

    pub async fn remove_request(&self, key: &str) -> Result<bool, StoreError> {
        self.delete(ANALYTICS_QUEUE_NAMESPACE, key).await
    }

    // ── Sync tags ─────────────────────────

    pub async fn register_sync_tag(&self, tag: &str) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        let db = self.db.lock().await;
        db.execute(
            "INSERT OR REPLACE INTO sync_tags (tag, registered_at) VALUES (?1, ?2)",
            rusqlite::params![tag, now as i64],
        )?;
        Ok(())
    }

    pub async fn sync_tags(&self) -> Result<Vec<String>, StoreError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare("SELECT tag FROM sync_tags ORDER BY registered_at, tag")?;
        let tags = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tags)
    }

    pub async fn unregister_sync_tag(&self, tag: &str) -> Result<bool, StoreError> {
        let db = self.db.lock().await;
        let n = db.execute(
            "DELETE FROM sync_tags WHERE tag = ?1",
            rusqlite::params![tag],
        )?;
        Ok(n > 0)
    }
}

type CachedRow = (String, String, String, i64, String, Vec<u8>, i64);

fn read_cached_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CachedRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode_cached(row: CachedRow) -> Result<CachedResponse, StoreError> {
    let (namespace, key, method, status, headers, body, captured_at) = row;
    Ok(CachedResponse {
        namespace,
        key,
        method,
        status: u16::try_from(status).unwrap_or(200),
        headers: serde_json::from_str(&headers)?,
        body: Bytes::from(body),
        captured_at_ms: captured_at.max(0) as u64,
    })
}
