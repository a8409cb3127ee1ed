use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("invalid key {0:?}")]
    InvalidKey(String),
    #[error("io failed: {0}")]
    Io(String),
    #[error("sqlite failed: {0}")]
    Sqlite(String),
    #[error("http store request failed: {0}")]
    Transport(String),
    #[error("http store returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

/// Blob storage addressed by key. The state store keeps one document per key.
#[async_trait]
pub trait KvBackend: Send + Sync {
    fn name(&self) -> &str;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), KvError>;
}

#[derive(Clone, Default)]
pub struct MemoryKv {
    blobs: Arc<StdMutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let blobs = self
            .blobs
            .lock()
            .map_err(|_| KvError::Io("memory store mutex is poisoned".to_string()))?;
        Ok(blobs.get(key).cloned())
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), KvError> {
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| KvError::Io("memory store mutex is poisoned".to_string()))?;
        blobs.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}

/// One file per key inside `dir`; writes go through a temp file and rename.
pub struct DirKv {
    dir: PathBuf,
}

impl DirKv {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, KvError> {
        if key.is_empty()
            || key.contains('/')
            || key.contains('\\')
            || key == "."
            || key == ".."
        {
            return Err(KvError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(key))
    }
}

#[async_trait]
impl KvBackend for DirKv {
    fn name(&self) -> &str {
        "directory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KvError::Io(format!("read {}: {e}", path.display()))),
        }
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), KvError> {
        let path = self.path_for(key)?;
        write_atomic(&path, bytes).await
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), KvError> {
    let parent = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| KvError::Io(format!("create {}: {e}", parent.display())))?;

    let temp_name = format!(
        ".{}.tmp-{}-{}",
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("blob"),
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    );
    let temp_path = parent.join(temp_name);
    tokio::fs::write(&temp_path, bytes)
        .await
        .map_err(|e| KvError::Io(format!("write {}: {e}", temp_path.display())))?;
    tokio::fs::rename(&temp_path, path).await.map_err(|e| {
        KvError::Io(format!(
            "rename {} to {}: {e}",
            temp_path.display(),
            path.display()
        ))
    })
}

pub struct SqliteKv {
    conn: Mutex<Connection>,
}

impl SqliteKv {
    pub fn open(path: &str) -> Result<Self, KvError> {
        if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| KvError::Io(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path).map_err(|e| KvError::Sqlite(e.to_string()))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv_blobs (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| KvError::Sqlite(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl KvBackend for SqliteKv {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT value FROM kv_blobs WHERE key = ?1",
            params![key],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()
        .map_err(|e| KvError::Sqlite(e.to_string()))
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), KvError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "
            INSERT INTO kv_blobs(key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value=excluded.value,
                updated_at=excluded.updated_at
            ",
            params![key, bytes, Utc::now().to_rfc3339()],
        )
        .map_err(|e| KvError::Sqlite(e.to_string()))?;
        Ok(())
    }
}

/// Object store speaking plain `GET`/`PUT {base}/{key}`.
pub struct HttpKv {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpKv {
    pub fn new(base_url: &str, token: Option<String>, timeout_ms: u64) -> Result<Self, KvError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms.max(1)))
            .build()
            .map_err(|e| KvError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(&self, method: reqwest::Method, key: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/{key}", self.base_url));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl KvBackend for HttpKv {
    fn name(&self) -> &str {
        "http"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let response = self
            .request(reqwest::Method::GET, key)
            .send()
            .await
            .map_err(|e| KvError::Transport(e.to_string()))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(KvError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| KvError::Transport(e.to_string()))?;
        Ok(Some(bytes.to_vec()))
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), KvError> {
        let response = self
            .request(reqwest::Method::PUT, key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| KvError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(KvError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dir_kv_round_trips_and_reports_missing_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let kv = DirKv::new(dir.path().join("nested"));
        assert_eq!(kv.get("state.json").await.unwrap(), None);
        kv.put("state.json", b"{\"a\":1}").await.unwrap();
        kv.put("state.json", b"{\"a\":2}").await.unwrap();
        assert_eq!(
            kv.get("state.json").await.unwrap().as_deref(),
            Some(&b"{\"a\":2}"[..])
        );
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn dir_kv_rejects_path_like_keys() {
        let kv = DirKv::new(std::env::temp_dir());
        assert!(matches!(
            kv.put("../escape", b"x").await,
            Err(KvError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn sqlite_kv_upserts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.db");
        let kv = SqliteKv::open(path.to_str().unwrap()).unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
        kv.put("k", b"one").await.unwrap();
        kv.put("k", b"two").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some(&b"two"[..]));

        drop(kv);
        let reopened = SqliteKv::open(path.to_str().unwrap()).unwrap();
        assert_eq!(reopened.get("k").await.unwrap().as_deref(), Some(&b"two"[..]));
    }

    #[tokio::test]
    async fn memory_kv_clones_share_blobs() {
        let kv = MemoryKv::new();
        let other = kv.clone();
        kv.put("k", b"v").await.unwrap();
        assert_eq!(other.get("k").await.unwrap().as_deref(), Some(&b"v"[..]));
    }
}
