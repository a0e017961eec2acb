//! Read-through response cache with singleflight
//!
//! Entries are keyed by [`Fingerprint`] and stamped with the invalidation
//! epoch they were computed under. `invalidate_all` bumps the epoch, so a
//! computation that started before a reload can still answer its own callers
//! but is never stored or served afterwards.

mod fingerprint;
mod inflight;

pub use fingerprint::{normalize_query, Fingerprint};

use crate::business::Insight;
use crate::config::CacheConfig;
use crate::error::DomainError;
use crate::retrieval::SourceRef;
use crate::tier::ModelTier;
use chrono::{DateTime, Utc};
use inflight::{wait_for_leader, Claim, InflightRegistry, SharedResult};
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A computed answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub answer: String,
    pub sources: Vec<SourceRef>,
    pub tier: ModelTier,
    #[serde(default)]
    pub insights: Vec<Insight>,
    /// Notes produced while computing the answer
    #[serde(default)]
    pub notes: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(with = "ttl_secs")]
    pub ttl: Duration,
    /// Degraded answers go to the current waiters but are never stored
    #[serde(default)]
    pub degraded: bool,
}

mod ttl_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(ttl: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(ttl.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// How a result was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheOrigin {
    Hit,
    Computed,
    /// Waited on another caller's computation
    Coalesced,
    /// Cache disabled or unavailable; computed directly
    Bypassed,
}

/// Result of [`ResponseCache::get_or_compute`]
#[derive(Debug, Clone)]
pub struct CacheOutcome {
    pub result: Result<Arc<CacheEntry>, DomainError>,
    pub origin: CacheOrigin,
    /// Set when the cache was bypassed because it could not be used
    pub unavailable: Option<DomainError>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub bypassed: u64,
    pub entry_count: u64,
    pub epoch: u64,
    pub hit_rate: f64,
}

#[derive(Clone)]
struct CachedValue {
    epoch: u64,
    entry: Arc<CacheEntry>,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    bypassed: AtomicU64,
}

/// Fingerprint-keyed answer cache
pub struct ResponseCache {
    entries: Option<Cache<Fingerprint, CachedValue>>,
    ttl: Duration,
    epoch: AtomicU64,
    inflight: InflightRegistry,
    counters: Counters,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        let ttl = config.ttl_duration();
        let entries = config.enabled.then(|| {
            Cache::builder()
                .max_capacity(config.max_entries)
                .time_to_live(ttl)
                .build()
        });

        Self {
            entries,
            ttl,
            epoch: AtomicU64::new(0),
            inflight: InflightRegistry::default(),
            counters: Counters::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.entries.is_some()
    }

    /// TTL recorded on new entries
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached entry for `fingerprint` in the current epoch
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<CacheEntry>> {
        let entries = self.entries.as_ref()?;
        let value = entries.get(fingerprint)?;
        if value.epoch == self.epoch.load(Ordering::Acquire) {
            Some(value.entry)
        } else {
            entries.invalidate(fingerprint);
            None
        }
    }

    /// Return the cached entry or compute it exactly once
    ///
    /// Concurrent callers with the same fingerprint wait for the single
    /// computation and receive its result, success or failure. Failures and
    /// degraded entries are shared but not stored.
    pub async fn get_or_compute<F, Fut>(&self, fingerprint: Fingerprint, compute: F) -> CacheOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheEntry, DomainError>>,
    {
        self.get_or_compute_at(self.epoch(), fingerprint, compute).await
    }

    /// Like `get_or_compute`, for inputs snapshotted under `epoch`
    ///
    /// The result is stored only while `epoch` is still current, so an
    /// answer built from data replaced mid-flight never outlives the reload.
    /// Callers sharing a stale epoch still coalesce with each other.
    pub async fn get_or_compute_at<F, Fut>(
        &self,
        epoch: u64,
        fingerprint: Fingerprint,
        compute: F,
    ) -> CacheOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheEntry, DomainError>>,
    {
        let Some(entries) = &self.entries else {
            return self
                .bypass(compute, DomainError::CacheUnavailable("cache disabled".to_string()))
                .await;
        };

        let guard = loop {
            if let Some(entry) = self.get(&fingerprint) {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(fingerprint = %fingerprint, "Cache hit");
                return CacheOutcome {
                    result: Ok(entry),
                    origin: CacheOrigin::Hit,
                    unavailable: None,
                };
            }

            match self.inflight.claim(epoch, fingerprint) {
                Ok(Claim::Leader(guard)) => break guard,
                Ok(Claim::Follower(rx)) => {
                    tracing::debug!(fingerprint = %fingerprint, "Waiting on in-flight computation");
                    if let Some(result) = wait_for_leader(rx).await {
                        self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                        return CacheOutcome {
                            result,
                            origin: CacheOrigin::Coalesced,
                            unavailable: None,
                        };
                    }
                    tracing::debug!(fingerprint = %fingerprint, "Leader went away, retrying claim");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Bypassing response cache");
                    return self.bypass(compute, err).await;
                }
            }
        };

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(fingerprint = %fingerprint, epoch, "Cache miss, computing");

        let result: SharedResult = compute().await.map(Arc::new);

        if let Ok(entry) = &result {
            if !entry.degraded && self.epoch.load(Ordering::Acquire) == epoch {
                entries.insert(
                    fingerprint,
                    CachedValue {
                        epoch,
                        entry: Arc::clone(entry),
                    },
                );
            }
        }

        guard.publish(result.clone());
        CacheOutcome {
            result,
            origin: CacheOrigin::Computed,
            unavailable: None,
        }
    }

    async fn bypass<F, Fut>(&self, compute: F, reason: DomainError) -> CacheOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheEntry, DomainError>>,
    {
        self.counters.bypassed.fetch_add(1, Ordering::Relaxed);
        CacheOutcome {
            result: compute().await.map(Arc::new),
            origin: CacheOrigin::Bypassed,
            unavailable: Some(reason),
        }
    }

    /// Drop every entry and start a new epoch
    pub fn invalidate_all(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(entries) = &self.entries {
            entries.invalidate_all();
        }
        tracing::info!(epoch, "Response cache invalidated");
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let coalesced = self.counters.coalesced.load(Ordering::Relaxed);
        let lookups = hits + misses + coalesced;

        let entry_count = self
            .entries
            .as_ref()
            .map(|entries| {
                entries.run_pending_tasks();
                entries.entry_count()
            })
            .unwrap_or(0);

        CacheStats {
            enabled: self.is_enabled(),
            hits,
            misses,
            coalesced,
            bypassed: self.counters.bypassed.load(Ordering::Relaxed),
            entry_count,
            epoch: self.epoch(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }

    /// Number of computations currently in flight
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }
}
