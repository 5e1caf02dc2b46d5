// SPDX-License-Identifier: MIT OR Apache-2.0
//! Step result cache keyed by `(tenant, skill_id, version, input_fingerprint)`,
//! with per-key single-flight deduplication (spec.md §4.F).
//!
//! Completed entries live in `entries`, a plain `RwLock`-guarded map.
//! In-flight bookkeeping lives separately in `inflight`, a `Mutex`-guarded
//! map that holds only wakeup handles — never a handler's result — so a
//! waiter blocked on a producer can never observe partial output through
//! the lock it's waiting on.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};
use uuid::Uuid;

/// Identifies a cached step result. Entries are versioned by skill version:
/// a new skill version never reads an old entry, since the version is part
/// of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepCacheKey {
    /// Owning tenant; keys are always tenant-prefixed so lookups can never
    /// cross tenants through this type's public surface.
    pub tenant_id: String,
    /// Skill being invoked.
    pub skill_id: String,
    /// Exact skill version.
    pub version: semver::Version,
    /// Deterministic fingerprint of the resolved step input.
    pub input_fingerprint: String,
}

impl StepCacheKey {
    fn as_map_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.tenant_id, self.skill_id, self.version, self.input_fingerprint
        )
    }
}

/// A previously computed step result.
#[derive(Debug, Clone)]
pub struct StepCacheEntry {
    /// Output payload the handler produced.
    pub output_data: serde_json::Value,
    /// Ids of artifacts the handler produced.
    pub output_artifact_ids: Vec<Uuid>,
    /// When this entry was inserted.
    pub cached_at: DateTime<Utc>,
    /// Optional per-skill TTL; `None` means unbounded.
    pub ttl: Option<ChronoDuration>,
}

impl StepCacheEntry {
    /// `true` if this entry is still within its TTL (or has none).
    #[must_use]
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.ttl {
            None => true,
            Some(ttl) => now - self.cached_at < ttl,
        }
    }
}

/// In-memory step cache with single-flight production.
#[derive(Default)]
pub struct StepCache {
    entries: RwLock<HashMap<String, Arc<StepCacheEntry>>>,
    inflight: Mutex<HashMap<String, Arc<Notify>>>,
}

impl StepCache {
    /// An empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a cache entry, applying an external validity check (e.g. "do
    /// all referenced artifact ids still resolve in the artifact store?").
    /// An entry failing either the TTL check or `is_valid` is treated as
    /// absent, per spec.md §4.F.
    pub async fn lookup_valid<V>(&self, key: &StepCacheKey, is_valid: V) -> Option<Arc<StepCacheEntry>>
    where
        V: FnOnce(&StepCacheEntry) -> bool,
    {
        let entry = self.entries.read().await.get(&key.as_map_key()).cloned()?;
        if entry.is_fresh(Utc::now()) && is_valid(&entry) {
            Some(entry)
        } else {
            None
        }
    }

    /// Look up a cache entry without any external validity check.
    pub async fn lookup(&self, key: &StepCacheKey) -> Option<Arc<StepCacheEntry>> {
        self.lookup_valid(key, |_| true).await
    }

    /// Insert or replace a cache entry.
    pub async fn insert(&self, key: &StepCacheKey, entry: StepCacheEntry) -> Arc<StepCacheEntry> {
        let entry = Arc::new(entry);
        self.entries.write().await.insert(key.as_map_key(), entry.clone());
        entry
    }

    /// Remove an entry, e.g. after the artifact store reports one of its
    /// artifact ids as purged.
    pub async fn invalidate(&self, key: &StepCacheKey) {
        self.entries.write().await.remove(&key.as_map_key());
    }

    /// Run `produce` to populate `key`, ensuring at most one producer runs
    /// concurrently for a given key across the whole process. Concurrent
    /// callers for the same key await the same in-flight producer and all
    /// receive its result.
    ///
    /// If `produce` fails, the in-flight slot is cleared and every waiter
    /// re-enters the loop; the next one becomes the new producer rather than
    /// all of them failing together.
    pub async fn single_flight<F, Fut, E>(&self, key: &StepCacheKey, mut produce: F) -> Result<Arc<StepCacheEntry>, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<StepCacheEntry, E>>,
    {
        let map_key = key.as_map_key();
        loop {
            if let Some(entry) = self.lookup(key).await {
                return Ok(entry);
            }

            let mut inflight = self.inflight.lock().await;

            // A producer inserts its result into `entries` before it removes
            // its inflight slot (see below), so if we raced past the lookup
            // above while a producer was finishing, the entry may already be
            // here. Re-checking under the inflight lock avoids a second
            // caller becoming a second producer for the same key.
            if let Some(entry) = self.entries.read().await.get(&map_key).cloned() {
                return Ok(entry);
            }

            match inflight.get(&map_key) {
                Some(notify) => {
                    let notify = notify.clone();
                    let notified = notify.notified();
                    tokio::pin!(notified);
                    // Register while still holding the lock: a producer can
                    // only remove this slot and call `notify_waiters` by
                    // taking the same lock we hold, so our registration is
                    // guaranteed to happen before that notification fires.
                    notified.as_mut().enable();
                    drop(inflight);
                    notified.await;
                }
                None => {
                    // We registered the in-flight slot; we are the producer.
                    inflight.insert(map_key.clone(), Arc::new(Notify::new()));
                    drop(inflight);

                    let result = produce().await;
                    return match result {
                        Ok(entry) => {
                            let entry = self.insert(key, entry).await;
                            if let Some(notify) = self.inflight.lock().await.remove(&map_key) {
                                notify.notify_waiters();
                            }
                            Ok(entry)
                        }
                        Err(err) => {
                            if let Some(notify) = self.inflight.lock().await.remove(&map_key) {
                                notify.notify_waiters();
                            }
                            Err(err)
                        }
                    };
                }
            }
        }
    }
}

impl std::fmt::Debug for StepCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepCache").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn key(tenant: &str, fp: &str) -> StepCacheKey {
        StepCacheKey {
            tenant_id: tenant.to_string(),
            skill_id: "generate_intro_image".to_string(),
            version: semver::Version::new(1, 0, 0),
            input_fingerprint: fp.to_string(),
        }
    }

    fn entry(data: serde_json::Value) -> StepCacheEntry {
        StepCacheEntry {
            output_data: data,
            output_artifact_ids: vec![],
            cached_at: Utc::now(),
            ttl: None,
        }
    }

    #[tokio::test]
    async fn lookup_on_empty_cache_returns_none() {
        let cache = StepCache::new();
        assert!(cache.lookup(&key("acme", "fp1")).await.is_none());
    }

    #[tokio::test]
    async fn insert_then_lookup_round_trips() {
        let cache = StepCache::new();
        let k = key("acme", "fp1");
        cache.insert(&k, entry(serde_json::json!({"ok": true}))).await;
        let found = cache.lookup(&k).await.unwrap();
        assert_eq!(found.output_data, serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn distinct_tenants_do_not_share_entries() {
        let cache = StepCache::new();
        cache
            .insert(&key("acme", "fp1"), entry(serde_json::json!("acme-data")))
            .await;
        assert!(cache.lookup(&key("globex", "fp1")).await.is_none());
    }

    #[tokio::test]
    async fn expired_ttl_entry_is_treated_as_absent() {
        let cache = StepCache::new();
        let k = key("acme", "fp1");
        let stale = StepCacheEntry {
            output_data: serde_json::json!({}),
            output_artifact_ids: vec![],
            cached_at: Utc::now() - ChronoDuration::seconds(120),
            ttl: Some(ChronoDuration::seconds(60)),
        };
        cache.insert(&k, stale).await;
        assert!(cache.lookup(&k).await.is_none());
    }

    #[tokio::test]
    async fn invalidate_removes_entry() {
        let cache = StepCache::new();
        let k = key("acme", "fp1");
        cache.insert(&k, entry(serde_json::json!({}))).await;
        cache.invalidate(&k).await;
        assert!(cache.lookup(&k).await.is_none());
    }

    #[tokio::test]
    async fn lookup_valid_rejects_entries_failing_external_check() {
        let cache = StepCache::new();
        let k = key("acme", "fp1");
        cache.insert(&k, entry(serde_json::json!({}))).await;
        let found = cache.lookup_valid(&k, |_| false).await;
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn single_flight_calls_producer_exactly_once_for_n_concurrent_callers() {
        let cache = Arc::new(StepCache::new());
        let k = key("acme", "fp1");
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let k = k.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .single_flight::<_, _, sf_error::SfError>(&k, || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(StepCacheEntry {
                                output_data: serde_json::json!({"v": 1}),
                                output_artifact_ids: vec![],
                                cached_at: Utc::now(),
                                ttl: None,
                            })
                        }
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for r in &results {
            assert_eq!(r.output_data, serde_json::json!({"v": 1}));
        }
    }

    #[tokio::test]
    async fn single_flight_clears_slot_on_producer_failure_so_next_caller_retries() {
        let cache = StepCache::new();
        let k = key("acme", "fp1");
        let attempt = AtomicU32::new(0);

        let first = cache
            .single_flight(&k, || {
                attempt.fetch_add(1, Ordering::SeqCst);
                async { Err::<StepCacheEntry, _>(sf_error::SfError::new(sf_error::ErrorCode::GenerationFailed, "boom")) }
            })
            .await;
        assert!(first.is_err());

        let second = cache
            .single_flight(&k, || {
                attempt.fetch_add(1, Ordering::SeqCst);
                async {
                    Ok(StepCacheEntry {
                        output_data: serde_json::json!({"recovered": true}),
                        output_artifact_ids: vec![],
                        cached_at: Utc::now(),
                        ttl: None,
                    })
                }
            })
            .await
            .unwrap();

        assert_eq!(attempt.load(Ordering::SeqCst), 2);
        assert_eq!(second.output_data, serde_json::json!({"recovered": true}));
    }
}
