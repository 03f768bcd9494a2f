mod cache;
mod provider;

pub use cache::{CacheRecord, FileKvStore, MemoryCache};
pub(crate) use cache::unix_now;
pub use provider::{AuthError, UuidProvider};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::http_client::HttpsClient;

const MERGED_KEY: &str = "uuid:merged";

/// Persistent-tier writes are staggered to at most one per key per this
/// interval.
const L2_WRITE_INTERVAL: Duration = Duration::from_secs(60);

fn provider_key(name: &str) -> String {
    format!("uuid:provider:{}", name)
}

/// Maps normalized UUIDs to the provider that authorized them, behind a
/// tiered cache: L1 memory, optional persistent L2, then the providers
/// themselves.
pub struct AuthStore {
    providers: Vec<UuidProvider>,
    client: HttpsClient,
    l1: MemoryCache,
    l2: Option<FileKvStore>,
    ttl: Duration,
    last_l2_write: Mutex<HashMap<String, Instant>>,
}

impl AuthStore {
    pub fn new(
        providers: Vec<UuidProvider>,
        client: HttpsClient,
        ttl: Duration,
        l2: Option<FileKvStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            providers,
            client,
            l1: MemoryCache::new(1024),
            l2,
            ttl,
            last_l2_write: Mutex::new(HashMap::new()),
        })
    }

    /// The merged UUID → provider-name map, from the fastest tier that
    /// has it.
    pub async fn get_merged(&self) -> HashMap<String, String> {
        if let Some(record) = self.l1.get(MERGED_KEY) {
            if let Ok(map) = serde_json::from_str(&record.value) {
                return map;
            }
        }

        if let Some(ref l2) = self.l2 {
            if let Some(record) = l2.get(MERGED_KEY).await {
                if let Ok(map) = serde_json::from_str::<HashMap<String, String>>(&record.value) {
                    // Backfill L1 with the residual TTL so both tiers
                    // expire together.
                    self.l1.put(MERGED_KEY, record);
                    return map;
                }
            }
        }

        self.fetch_and_store().await
    }

    /// Drop the merged entry in every tier and refetch from providers.
    pub async fn refresh(&self) -> HashMap<String, String> {
        self.l1.invalidate(MERGED_KEY);
        if let Some(ref l2) = self.l2 {
            l2.remove(MERGED_KEY).await;
        }
        self.last_l2_write.lock().remove(MERGED_KEY);
        self.fetch_and_store().await
    }

    pub async fn is_authorized(&self, uuid: &str) -> Option<String> {
        let normalized = uuid.to_ascii_lowercase();
        self.get_merged().await.get(&normalized).cloned()
    }

    /// Snapshot the authorized set into a validator closure for one
    /// tunnel's greeting parse.
    pub async fn validator(&self) -> impl Fn(&str) -> bool + Send + Sync + 'static {
        let uuids: HashSet<String> = self.get_merged().await.into_keys().collect();
        make_validator(uuids)
    }

    async fn fetch_and_store(&self) -> HashMap<String, String> {
        let merged = self.fetch_all().await;
        let record = match serde_json::to_string(&merged) {
            Ok(value) => CacheRecord::new(value, self.ttl),
            Err(e) => {
                warn!("failed to serialize merged uuid map: {}", e);
                return merged;
            }
        };
        self.l1.put(MERGED_KEY, record.clone());
        self.maybe_write_l2(MERGED_KEY, record).await;
        info!("authorized uuid set refreshed: {} entries", merged.len());
        merged
    }

    /// Run every available provider in parallel (settle-all), then fold
    /// in ascending priority order; the first writer of a UUID wins.
    pub async fn fetch_all(&self) -> HashMap<String, String> {
        let available: Vec<&UuidProvider> = self
            .providers
            .iter()
            .filter(|p| p.is_available())
            .collect();

        let fetches = available.iter().map(|provider| {
            let client = self.client.clone();
            async move { (*provider, provider.fetch(&client).await) }
        });
        let mut results: Vec<(&UuidProvider, Vec<String>)> = Vec::with_capacity(available.len());
        for (provider, outcome) in futures::future::join_all(fetches).await {
            match outcome {
                Ok(uuids) => {
                    debug!("provider {} supplied {} uuids", provider.name(), uuids.len());
                    let record = match serde_json::to_string(&uuids) {
                        Ok(value) => Some(CacheRecord::new(value, self.ttl)),
                        Err(_) => None,
                    };
                    if let Some(record) = record {
                        let key = provider_key(provider.name());
                        self.l1.put(&key, record.clone());
                        self.maybe_write_l2(&key, record).await;
                    }
                    results.push((provider, uuids));
                }
                Err(e) => {
                    warn!("provider {} fetch failed: {}", provider.name(), e);
                    // A stale per-provider list beats losing its users
                    // for the whole TTL window.
                    if let Some(uuids) = self.cached_provider_list(provider.name()).await {
                        debug!(
                            "provider {} served {} uuids from cache",
                            provider.name(),
                            uuids.len()
                        );
                        results.push((provider, uuids));
                    }
                }
            }
        }

        results.sort_by_key(|(provider, _)| provider.priority());
        let mut merged = HashMap::new();
        for (provider, uuids) in results {
            for uuid in uuids {
                merged.entry(uuid).or_insert_with(|| provider.name().to_string());
            }
        }
        merged
    }

    async fn cached_provider_list(&self, name: &str) -> Option<Vec<String>> {
        let key = provider_key(name);
        let record = match self.l1.get(&key) {
            Some(record) => record,
            None => self.l2.as_ref()?.get(&key).await?,
        };
        serde_json::from_str(&record.value).ok()
    }

    async fn maybe_write_l2(&self, key: &str, record: CacheRecord) {
        let Some(ref l2) = self.l2 else {
            return;
        };
        {
            let mut last = self.last_l2_write.lock();
            match last.get(key) {
                Some(at) if at.elapsed() < L2_WRITE_INTERVAL => return,
                _ => {
                    last.insert(key.to_string(), Instant::now());
                }
            }
        }
        l2.put(key, record).await;
    }
}

/// `make_validator(uuids)` — membership of the lowercased UUID in the
/// lowercased set.
pub fn make_validator(uuids: HashSet<String>) -> impl Fn(&str) -> bool + Send + Sync + 'static {
    let uuids: HashSet<String> = uuids.into_iter().map(|u| u.to_ascii_lowercase()).collect();
    move |uuid: &str| uuids.contains(&uuid.to_ascii_lowercase())
}
