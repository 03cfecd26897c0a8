//! Shared counter storage and the optimistic increment protocol.
//!
//! Counters live in a key-value store shared by every request handler. Writes
//! are conditional on a [`CasToken`] observed at read time, so concurrent
//! increments never overwrite each other; the loser re-reads and retries a
//! bounded number of times.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{error, trace};

use super::host::Scope;
use super::identifier::Identifier;
use super::window::Period;

/// Maximum conditional write attempts for a single increment.
pub const MAX_CAS_ATTEMPTS: usize = 10;

/// Errors returned by a counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or failed internally.
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    /// The key was modified since the token was observed.
    #[error("counter was modified concurrently")]
    CasMismatch,
}

/// Version tag used for conditional writes.
///
/// [`CasToken::ABSENT`] is observed for missing keys; a write expecting it
/// only succeeds if the key still does not exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CasToken(u64);

impl CasToken {
    /// Token of a key that does not exist.
    pub const ABSENT: CasToken = CasToken(0);

    /// Wrap a raw store version.
    pub fn new(version: u64) -> Self {
        Self(version)
    }

    /// Whether this token denotes a missing key.
    pub fn is_absent(&self) -> bool {
        self.0 == 0
    }
}

/// Conditional key-value store holding usage counters.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Fetch a counter and its token. Missing keys are `Ok(None)`.
    async fn get(&self, key: &str) -> Result<Option<(u64, CasToken)>, StoreError>;

    /// Write `value` if the key's token still equals `expected`.
    ///
    /// Returns the new token, or [`StoreError::CasMismatch`] when another
    /// writer got there first.
    async fn compare_and_set(
        &self,
        key: &str,
        value: u64,
        expected: CasToken,
    ) -> Result<CasToken, StoreError>;
}

/// In-process counter store.
///
/// Stale windows are never evicted; each new window start produces a new key.
#[derive(Debug)]
pub struct InMemoryCounterStore {
    entries: DashMap<String, (u64, CasToken)>,
    next_version: AtomicU64,
}

impl InMemoryCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_version: AtomicU64::new(1),
        }
    }

    /// Current value of a key, if present.
    pub fn value(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|entry| entry.0)
    }

    /// Number of stored counters.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no counters.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn bump_version(&self) -> CasToken {
        CasToken(self.next_version.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<(u64, CasToken)>, StoreError> {
        Ok(self.entries.get(key).map(|entry| *entry))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        value: u64,
        expected: CasToken,
    ) -> Result<CasToken, StoreError> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().1 != expected {
                    return Err(StoreError::CasMismatch);
                }
                let token = self.bump_version();
                entry.insert((value, token));
                Ok(token)
            }
            Entry::Vacant(entry) => {
                if !expected.is_absent() {
                    return Err(StoreError::CasMismatch);
                }
                let token = self.bump_version();
                entry.insert((value, token));
                Ok(token)
            }
        }
    }
}

/// Key identifying one usage counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// Route scope of the limiter instance
    pub scope: Scope,
    /// Caller bucket
    pub identifier: Identifier,
    /// Quota period
    pub period: Period,
    /// Window start, epoch seconds
    pub window_start: i64,
}

impl CounterKey {
    /// Create a new counter key.
    pub fn new(scope: &Scope, identifier: &Identifier, period: Period, window_start: i64) -> Self {
        Self {
            scope: scope.clone(),
            identifier: identifier.clone(),
            period,
            window_start,
        }
    }

    /// Convert to the string key used in the store.
    ///
    /// Format: `ratelimit|{len}:{route}|{len}:{service}|{len}:{identifier}|{window}|{period}`.
    /// Free-form components are length-prefixed so that no two keys collide
    /// whatever characters they contain.
    pub fn to_store_key(&self) -> String {
        let route = &self.scope.route_id;
        let service = &self.scope.service_id;
        let id = self.identifier.as_str();
        format!(
            "ratelimit|{}:{}|{}:{}|{}:{}|{}|{}",
            route.len(),
            route,
            service.len(),
            service,
            id.len(),
            id,
            self.window_start,
            self.period
        )
    }

    /// Parse a store key produced by [`CounterKey::to_store_key`].
    pub fn parse(key: &str) -> Option<Self> {
        let rest = key.strip_prefix("ratelimit|")?;
        let (route, rest) = take_prefixed(rest)?;
        let (service, rest) = take_prefixed(rest)?;
        let (id, rest) = take_prefixed(rest)?;
        let (window, period) = rest.split_once('|')?;

        Some(Self {
            scope: Scope::new(route, service),
            identifier: Identifier::new(id),
            period: Period::from_name(period)?,
            window_start: window.parse().ok()?,
        })
    }
}

/// Split `{len}:{value}|` off the front of `input`.
fn take_prefixed(input: &str) -> Option<(&str, &str)> {
    let (len, rest) = input.split_once(':')?;
    let len: usize = len.parse().ok()?;
    let value = rest.get(..len)?;
    let rest = rest.get(len..)?.strip_prefix('|')?;
    Some((value, rest))
}

/// Counter value observed by a read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Usage recorded in the window
    pub usage: u64,
    /// Token to condition the next write on
    pub token: CasToken,
    /// Whether the counter existed
    pub found: bool,
}

/// Result of an increment attempt.
#[derive(Debug)]
pub enum IncrementOutcome {
    /// The counter now holds `value`.
    Saved { value: u64, attempts: usize },
    /// Every attempt lost a race; the increment was dropped.
    Exhausted { attempts: usize },
    /// The store failed; the increment was dropped.
    Failed(StoreError),
}

impl IncrementOutcome {
    /// Whether the increment was persisted.
    pub fn is_saved(&self) -> bool {
        matches!(self, IncrementOutcome::Saved { .. })
    }
}

/// Read and increment protocol over a shared [`CounterStore`].
#[derive(Clone)]
pub struct CounterClient {
    store: Arc<dyn CounterStore>,
}

impl CounterClient {
    /// Create a client over a shared store.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// Read the current usage for a counter. Missing counters read as zero.
    pub async fn read(&self, key: &CounterKey) -> Result<CounterSnapshot, StoreError> {
        self.read_raw(&key.to_store_key()).await
    }

    async fn read_raw(&self, store_key: &str) -> Result<CounterSnapshot, StoreError> {
        let snapshot = match self.store.get(store_key).await? {
            Some((usage, token)) => CounterSnapshot {
                usage,
                token,
                found: true,
            },
            None => CounterSnapshot::default(),
        };
        trace!(key = %store_key, usage = snapshot.usage, found = snapshot.found, "Read counter");
        Ok(snapshot)
    }

    /// Add one to a counter, starting from the snapshot observed at read time.
    ///
    /// Conflicts re-read the counter and retry, up to [`MAX_CAS_ATTEMPTS`]
    /// writes in total. Dropped increments are logged and reported, never
    /// propagated.
    pub async fn increment(&self, key: &CounterKey, observed: CounterSnapshot) -> IncrementOutcome {
        let store_key = key.to_store_key();
        let mut current = observed;

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let value = current.usage + 1;
            match self.store.compare_and_set(&store_key, value, current.token).await {
                Ok(_) => {
                    trace!(key = %store_key, value, attempt, "Incremented counter");
                    return IncrementOutcome::Saved {
                        value,
                        attempts: attempt,
                    };
                }
                Err(StoreError::CasMismatch) => {
                    trace!(key = %store_key, attempt, "Counter changed concurrently, retrying");
                    if attempt == MAX_CAS_ATTEMPTS {
                        break;
                    }
                    current = match self.read_raw(&store_key).await {
                        Ok(snapshot) => snapshot,
                        Err(e) => {
                            error!(period = %key.period, error = %e, "Could not increment counter");
                            return IncrementOutcome::Failed(e);
                        }
                    };
                }
                Err(e) => {
                    error!(period = %key.period, error = %e, "Could not increment counter");
                    return IncrementOutcome::Failed(e);
                }
            }
        }

        error!(
            period = %key.period,
            attempts = MAX_CAS_ATTEMPTS,
            "Could not increment counter: too many concurrent updates"
        );
        IncrementOutcome::Exhausted {
            attempts: MAX_CAS_ATTEMPTS,
        }
    }
}
