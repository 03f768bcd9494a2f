use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use moka::sync::Cache;
use moka::Expiry;
use serde::{Deserialize, Serialize};

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// One cached row: a JSON payload plus its absolute expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRecord {
    pub value: String,
    pub expires_at: u64,
    pub created_at: u64,
}

impl CacheRecord {
    pub fn new(value: String, ttl: Duration) -> Self {
        let now = unix_now();
        Self {
            value,
            expires_at: now + ttl.as_secs(),
            created_at: now,
        }
    }

    pub fn is_expired(&self) -> bool {
        unix_now() >= self.expires_at
    }

    /// Time this record has left, used when backfilling L1 from L2 so
    /// the tiers expire together.
    pub fn residual_ttl(&self) -> Duration {
        Duration::from_secs(self.expires_at.saturating_sub(unix_now()))
    }
}

struct RecordExpiry;

impl Expiry<String, CacheRecord> for RecordExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheRecord,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.residual_ttl())
    }
}

/// L1: in-process cache, always present. Per-record TTL via the row's
/// own `expires_at`.
pub struct MemoryCache {
    cache: Cache<String, CacheRecord>,
}

impl MemoryCache {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_capacity)
                .expire_after(RecordExpiry)
                .build(),
        }
    }

    pub fn get(&self, key: &str) -> Option<CacheRecord> {
        let record = self.cache.get(key)?;
        if record.is_expired() {
            self.cache.invalidate(key);
            return None;
        }
        Some(record)
    }

    pub fn put(&self, key: &str, record: CacheRecord) {
        self.cache.insert(key.to_string(), record);
    }

    pub fn invalidate(&self, key: &str) {
        self.cache.invalidate(key);
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FileRow {
    key: String,
    value: String,
    expires_at: u64,
    created_at: u64,
}

/// L2: optional persistent row store, an atomically rewritten JSON file
/// of `{key, value, expires_at, created_at}` rows. Expiry is honored on
/// read and expired rows are dropped on rewrite.
pub struct FileKvStore {
    path: PathBuf,
    rows: tokio::sync::Mutex<HashMap<String, CacheRecord>>,
}

impl FileKvStore {
    pub async fn open(path: PathBuf) -> Self {
        let rows = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<FileRow>>(&bytes) {
                Ok(rows) => rows
                    .into_iter()
                    .map(|row| {
                        (
                            row.key,
                            CacheRecord {
                                value: row.value,
                                expires_at: row.expires_at,
                                created_at: row.created_at,
                            },
                        )
                    })
                    .collect(),
                Err(e) => {
                    warn!("discarding unreadable cache file {}: {}", path.display(), e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        debug!("cache file {} holds {} rows", path.display(), rows.len());
        Self {
            path,
            rows: tokio::sync::Mutex::new(rows),
        }
    }

    pub async fn get(&self, key: &str) -> Option<CacheRecord> {
        let rows = self.rows.lock().await;
        let record = rows.get(key)?;
        if record.is_expired() {
            return None;
        }
        Some(record.clone())
    }

    pub async fn put(&self, key: &str, record: CacheRecord) {
        let snapshot = {
            let mut rows = self.rows.lock().await;
            rows.retain(|_, r| !r.is_expired());
            rows.insert(key.to_string(), record);
            rows.iter()
                .map(|(key, record)| FileRow {
                    key: key.clone(),
                    value: record.value.clone(),
                    expires_at: record.expires_at,
                    created_at: record.created_at,
                })
                .collect::<Vec<_>>()
        };
        self.persist(&snapshot).await;
    }

    pub async fn remove(&self, key: &str) {
        let snapshot = {
            let mut rows = self.rows.lock().await;
            if rows.remove(key).is_none() {
                return;
            }
            rows.iter()
                .map(|(key, record)| FileRow {
                    key: key.clone(),
                    value: record.value.clone(),
                    expires_at: record.expires_at,
                    created_at: record.created_at,
                })
                .collect::<Vec<_>>()
        };
        self.persist(&snapshot).await;
    }

    async fn persist(&self, rows: &[FileRow]) {
        let bytes = match serde_json::to_vec(rows) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("cache serialization failed: {}", e);
                return;
            }
        };
        // Write-then-rename so a crash never leaves a torn file.
        let tmp = self.path.with_extension("tmp");
        if let Err(e) = tokio::fs::write(&tmp, &bytes).await {
            warn!("cache write to {} failed: {}", tmp.display(), e);
            return;
        }
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            warn!("cache rename to {} failed: {}", self.path.display(), e);
        }
    }
}
