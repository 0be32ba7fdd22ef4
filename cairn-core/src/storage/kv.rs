use crate::{CairnError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex};

/// A stored value together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    pub cas: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Committed(u64),
    Conflict,
}

/// Ordered key/value namespace with a conditional-write primitive.
///
/// `put_if` with `expected = None` only succeeds when the key is absent; with
/// `Some(cas)` only when the stored version still equals `cas`.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Versioned>>;

    async fn get_many(&self, keys: &[String]) -> Result<BTreeMap<String, Versioned>>;

    async fn put_if(&self, key: &str, expected: Option<u64>, value: Vec<u8>) -> Result<CasOutcome>;

    /// Keys strictly greater than `after`, in ascending order.
    async fn scan(&self, after: Option<&str>, limit: usize) -> Result<Vec<(String, Versioned)>>;
}

pub type DynKvStore = Arc<dyn KvStore>;

/// Conflicts tolerated on one key before `update_with_retry` gives up.
pub const MAX_CAS_ATTEMPTS: u32 = 1024;

/// Read-modify-write loop over `put_if`. `apply` sees the current raw value
/// (or `None`) and returns the replacement; it is re-run after every conflict,
/// up to `MAX_CAS_ATTEMPTS` times.
pub async fn update_with_retry<F>(kv: &dyn KvStore, key: &str, mut apply: F) -> Result<Vec<u8>>
where
    F: FnMut(Option<&[u8]>) -> Result<Vec<u8>> + Send,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let current = kv.get(key).await?;
        let expected = current.as_ref().map(|entry| entry.cas);
        let next = apply(current.as_ref().map(|entry| entry.value.as_slice()))?;

        match kv.put_if(key, expected, next.clone()).await? {
            CasOutcome::Committed(_) => return Ok(next),
            CasOutcome::Conflict if attempts >= MAX_CAS_ATTEMPTS => {
                tracing::warn!("giving up on key={} after {} cas conflicts", key, attempts);
                return Err(CairnError::CasConflict(key.to_string()));
            }
            CasOutcome::Conflict => {
                tracing::debug!("cas conflict on key={} attempt={}", key, attempts);
                tokio::task::yield_now().await;
            }
        }
    }
}

#[derive(Default)]
struct MemoryState {
    entries: BTreeMap<String, Versioned>,
    next_cas: u64,
}

/// In-process backend, used by tests and the `memory` metadata backend.
#[derive(Default)]
pub struct MemoryKv {
    state: Mutex<MemoryState>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| crate::CairnError::Internal("memory kv lock poisoned".to_string()))
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        Ok(self.lock()?.entries.get(key).cloned())
    }

    async fn get_many(&self, keys: &[String]) -> Result<BTreeMap<String, Versioned>> {
        let state = self.lock()?;
        Ok(keys
            .iter()
            .filter_map(|key| state.entries.get(key).map(|entry| (key.clone(), entry.clone())))
            .collect())
    }

    async fn put_if(&self, key: &str, expected: Option<u64>, value: Vec<u8>) -> Result<CasOutcome> {
        let mut state = self.lock()?;
        let current = state.entries.get(key).map(|entry| entry.cas);
        if current != expected {
            return Ok(CasOutcome::Conflict);
        }

        state.next_cas += 1;
        let cas = state.next_cas;
        state.entries.insert(key.to_string(), Versioned { value, cas });
        Ok(CasOutcome::Committed(cas))
    }

    async fn scan(&self, after: Option<&str>, limit: usize) -> Result<Vec<(String, Versioned)>> {
        let state = self.lock()?;
        let lower = match after {
            Some(after) => Bound::Excluded(after.to_string()),
            None => Bound::Unbounded,
        };

        Ok(state
            .entries
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect())
    }
}
