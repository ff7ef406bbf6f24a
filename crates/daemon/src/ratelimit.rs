// SPDX-License-Identifier: MIT

//! Userspace side of the rate-limit table (spec.md §4.G). `set`/`unset`/
//! `check` are intentionally oblivious to orchestration — the orchestrator
//! commits a rule and registers `unset` as a cleanup so every exit path
//! releases it (spec.md §4.G "Interaction with the table").
//!
//! Same adapter-pattern split as `scope::ServiceManager`: a trait, an `aya`
//! production backend, and an in-memory test backend.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use thiserror::Error;

use traffic_limitd_ebpf_common::RateLimit;

#[derive(Debug, Error)]
pub enum RateLimitTableError {
    #[error("rate-limit table is full")]
    Full,
    #[error("BPF map operation failed: {0}")]
    Map(String),
}

#[async_trait]
pub trait RateLimitTable: Send + Sync + 'static {
    /// Insert or update the entry for `cg_id` (spec.md §4.G `set`). A second
    /// `set` on the same key replaces the value (spec.md §8 idempotence).
    async fn set(&self, cg_id: u64, rate: RateLimit) -> Result<(), RateLimitTableError>;

    /// Remove the entry for `cg_id`, if present. Not an error when absent
    /// (spec.md §8 "`unset(cg)` on an absent key is not an error").
    async fn unset(&self, cg_id: u64) -> Result<(), RateLimitTableError>;

    /// Look up whether `cg_id` currently has an entry.
    async fn check(&self, cg_id: u64) -> Option<RateLimit>;
}

/// Production backend: an `aya::maps::HashMap` over the kernel's
/// `rate_limit_map`, sized to `MAX_TASKS` at load time (spec.md §4.I:
/// "load classifier program and size its maps per MAX_NR_TASKS, rounded up
/// by 12.5%").
pub struct AyaRateLimitTable {
    map: Mutex<aya::maps::HashMap<aya::maps::MapData, u64, RateLimit>>,
    capacity: u32,
    len_hint: Mutex<usize>,
}

impl AyaRateLimitTable {
    pub fn new(map: aya::maps::HashMap<aya::maps::MapData, u64, RateLimit>, capacity: u32) -> Self {
        Self { map: Mutex::new(map), capacity, len_hint: Mutex::new(0) }
    }
}

#[async_trait]
impl RateLimitTable for AyaRateLimitTable {
    async fn set(&self, cg_id: u64, rate: RateLimit) -> Result<(), RateLimitTableError> {
        let mut map = self.map.lock();
        let existed = map.get(&cg_id, 0).is_ok();
        if !existed {
            let mut len = self.len_hint.lock();
            if *len as u32 >= self.capacity {
                return Err(RateLimitTableError::Full);
            }
            *len += 1;
        }
        map.insert(cg_id, rate, 0).map_err(|e| RateLimitTableError::Map(e.to_string()))
    }

    async fn unset(&self, cg_id: u64) -> Result<(), RateLimitTableError> {
        let mut map = self.map.lock();
        if map.remove(&cg_id).is_ok() {
            let mut len = self.len_hint.lock();
            *len = len.saturating_sub(1);
        }
        Ok(())
    }

    async fn check(&self, cg_id: u64) -> Option<RateLimit> {
        self.map.lock().get(&cg_id, 0).ok()
    }
}

/// Test backend: a plain `HashMap` behind a `parking_lot::Mutex`, enforcing
/// the same capacity cap as the real BPF map so admission-related tests
/// (spec.md §8 scenario 3) exercise the identical `Full` error path.
#[derive(Clone)]
pub struct InMemoryRateLimitTable {
    inner: std::sync::Arc<Mutex<HashMap<u64, RateLimit>>>,
    capacity: usize,
}

impl InMemoryRateLimitTable {
    pub fn new(capacity: usize) -> Self {
        Self { inner: std::sync::Arc::new(Mutex::new(HashMap::new())), capacity }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RateLimitTable for InMemoryRateLimitTable {
    async fn set(&self, cg_id: u64, rate: RateLimit) -> Result<(), RateLimitTableError> {
        let mut map = self.inner.lock();
        if !map.contains_key(&cg_id) && map.len() >= self.capacity {
            return Err(RateLimitTableError::Full);
        }
        map.insert(cg_id, rate);
        Ok(())
    }

    async fn unset(&self, cg_id: u64) -> Result<(), RateLimitTableError> {
        self.inner.lock().remove(&cg_id);
        Ok(())
    }

    async fn check(&self, cg_id: u64) -> Option<RateLimit> {
        self.inner.lock().get(&cg_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_set_again_replaces_value() {
        let table = InMemoryRateLimitTable::new(4);
        table.set(1, RateLimit { byte_rate: 1000, packet_rate: 0 }).await.unwrap();
        table.set(1, RateLimit { byte_rate: 2000, packet_rate: 5 }).await.unwrap();
        assert_eq!(table.check(1).await, Some(RateLimit { byte_rate: 2000, packet_rate: 5 }));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn unset_on_absent_key_is_not_an_error() {
        let table = InMemoryRateLimitTable::new(4);
        table.unset(999).await.unwrap();
    }

    #[tokio::test]
    async fn set_respects_capacity_cap() {
        let table = InMemoryRateLimitTable::new(2);
        table.set(1, RateLimit::default()).await.unwrap();
        table.set(2, RateLimit::default()).await.unwrap();
        assert!(matches!(table.set(3, RateLimit::default()).await, Err(RateLimitTableError::Full)));
        // Updating an existing key never counts against capacity.
        table.set(1, RateLimit { byte_rate: 1, packet_rate: 1 }).await.unwrap();
    }

    #[tokio::test]
    async fn check_returns_none_for_absent_key() {
        let table = InMemoryRateLimitTable::new(4);
        assert_eq!(table.check(42).await, None);
    }
}
