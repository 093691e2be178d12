use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use super::store::CacheStore;
use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

/// Process-local store used by tests and single-instance runs. Expiry
/// follows tokio's clock so paused-time tests can advance it.
#[derive(Default)]
pub struct InMemoryCacheStore {
    entries: DashMap<String, StoredValue>,
    unavailable: AtomicBool,
    forced_cas_conflicts: AtomicU32,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with `CacheUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The next `count` compare-and-set calls report a conflict.
    pub fn force_cas_conflicts(&self, count: u32) {
        self.forced_cas_conflicts.store(count, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> PipelineResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(PipelineError::CacheUnavailable("in-memory store marked unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    fn live(&self, key: &str) -> Option<StoredValue> {
        let now = Instant::now();
        let stored = self.entries.get(key)?.clone();
        if stored.is_live(now) {
            Some(stored)
        } else {
            self.entries.remove_if(key, |_, v| !v.is_live(now));
            None
        }
    }
}

fn deadline(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|ttl| Instant::now() + ttl)
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> PipelineResult<Option<String>> {
        self.check()?;
        Ok(self.live(key).map(|v| v.value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> PipelineResult<()> {
        self.check()?;
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: deadline(ttl),
            },
        );
        Ok(())
    }

    async fn set_preserving_ttl(
        &self,
        key: &str,
        value: &str,
        default_ttl: Option<Duration>,
    ) -> PipelineResult<()> {
        self.check()?;
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if occupied.get().is_live(now) => {
                occupied.get_mut().value = value.to_string();
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(StoredValue {
                    value: value.to_string(),
                    expires_at: deadline(default_ttl),
                });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue {
                    value: value.to_string(),
                    expires_at: deadline(default_ttl),
                });
            }
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> PipelineResult<Option<Duration>> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .live(key)
            .and_then(|v| v.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn delete(&self, key: &str) -> PipelineResult<bool> {
        self.check()?;
        let now = Instant::now();
        Ok(self.entries.remove(key).map(|(_, v)| v.is_live(now)).unwrap_or(false))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> PipelineResult<bool> {
        self.check()?;
        if self
            .forced_cas_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(false);
        }

        let now = Instant::now();
        let replacement = StoredValue {
            value: value.to_string(),
            expires_at: deadline(ttl),
        };
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                let current_value = current.is_live(now).then_some(current.value.as_str());
                if current_value != expected {
                    return Ok(false);
                }
                occupied.insert(replacement);
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                vacant.insert(replacement);
            }
        }
        Ok(true)
    }

    async fn try_acquire_lease(&self, key: &str, owner: &str, ttl: Duration) -> PipelineResult<bool> {
        self.check()?;
        let now = Instant::now();
        let lease = StoredValue {
            value: owner.to_string(),
            expires_at: Some(now + ttl),
        };
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Ok(false);
                }
                occupied.insert(lease);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(lease);
            }
        }
        Ok(true)
    }

    async fn renew_lease(&self, key: &str, owner: &str, ttl: Duration) -> PipelineResult<bool> {
        self.check()?;
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut lease) if lease.is_live(now) && lease.value == owner => {
                lease.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, key: &str, owner: &str) -> PipelineResult<bool> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .entries
            .remove_if(key, |_, v| v.is_live(now) && v.value == owner)
            .is_some())
    }
}
