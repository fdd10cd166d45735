//! Session-scoped access to account balances.
//!
//! Writes made through a [`LedgerSession`] are buffered and stay invisible to
//! everyone else until the session commits, at which point they are handed to
//! the [`AccountStore`] in one atomic batch. A session holds an exclusive lock
//! on every account it touches until it commits or rolls back, so two
//! sessions updating the same account serialize instead of overwriting each
//! other. Lock acquisition is bounded by a timeout, which turns a potential
//! deadlock into a retryable `ResourceUnavailable`.

use crate::domain::account::{Account, Balance};
use crate::domain::ports::{AccountStore, SharedAccountStore, Vote};
use crate::error::{Result, RouteError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, trace};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

type AccountLock = Arc<AsyncMutex<()>>;

struct LedgerInner {
    store: SharedAccountStore,
    locks: Mutex<HashMap<String, AccountLock>>,
    lock_timeout: Duration,
    next_session: AtomicU64,
}

/// The ledger store: committed reads plus session-scoped writes.
///
/// Cheap to clone; clones share storage and the lock table.
#[derive(Clone)]
pub struct Ledger {
    inner: Arc<LedgerInner>,
}

impl Ledger {
    pub fn new(store: impl AccountStore + 'static) -> Self {
        Self::with_lock_timeout(Arc::new(store), DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(store: SharedAccountStore, lock_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(LedgerInner {
                store,
                locks: Mutex::new(HashMap::new()),
                lock_timeout,
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Committed balance of `name`.
    pub async fn read(&self, name: &str) -> Result<Balance> {
        self.inner
            .store
            .get(name)
            .await?
            .map(|account| account.balance)
            .ok_or_else(|| RouteError::AccountNotFound(name.to_string()))
    }

    pub async fn accounts(&self) -> Result<Vec<Account>> {
        self.inner.store.get_all().await
    }

    /// Creates or overwrites an account row (setup).
    pub async fn create_account(&self, name: &str, balance: i64) -> Result<()> {
        let _guard = self.lock_account(name).await?;
        self.inner.store.store(Account::new(name, balance)).await
    }

    /// Creates the row only if it does not exist yet; returns whether it did.
    pub async fn ensure_account(&self, name: &str, balance: i64) -> Result<bool> {
        let _guard = self.lock_account(name).await?;
        if self.inner.store.get(name).await?.is_some() {
            return Ok(false);
        }
        self.inner.store.store(Account::new(name, balance)).await?;
        Ok(true)
    }

    /// Deletes an account row (teardown) and forgets its lock.
    pub async fn drop_account(&self, name: &str) -> Result<()> {
        let guard = self.lock_account(name).await?;
        self.inner.store.remove(name).await?;
        drop(guard);
        self.prune_lock(name);
        Ok(())
    }

    pub fn begin_session(&self) -> LedgerSession {
        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        trace!(session = id, "ledger session opened");
        LedgerSession {
            id,
            ledger: self.clone(),
            guards: HashMap::new(),
            pending: BTreeMap::new(),
        }
    }

    /// Applies one delta in its own session and commits immediately.
    pub async fn apply(&self, name: &str, delta: i64) -> Result<Balance> {
        let mut session = self.begin_session();
        let balance = session.write(name, delta).await?;
        session.commit().await?;
        Ok(balance)
    }

    async fn lock_account(&self, name: &str) -> Result<OwnedMutexGuard<()>> {
        let lock = self
            .inner
            .locks
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone();

        tokio::time::timeout(self.inner.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                RouteError::ResourceUnavailable(format!(
                    "timed out after {:?} waiting for lock on account '{}'",
                    self.inner.lock_timeout, name
                ))
            })
    }

    /// Removes the lock entry unless someone still holds or awaits it.
    fn prune_lock(&self, name: &str) {
        let mut locks = self.inner.locks.lock();
        if locks.get(name).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(name);
            trace!(account = name, "pruned account lock");
        }
    }
}

/// A unit of buffered ledger writes.
///
/// Dropping a session without committing discards its writes and releases
/// its locks, which is exactly a rollback.
pub struct LedgerSession {
    id: u64,
    ledger: Ledger,
    guards: HashMap<String, OwnedMutexGuard<()>>,
    pending: BTreeMap<String, Balance>,
}

impl LedgerSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_dirty(&self) -> bool {
        !self.pending.is_empty()
    }

    async fn acquire(&mut self, name: &str) -> Result<()> {
        if !self.guards.contains_key(name) {
            let guard = self.ledger.lock_account(name).await?;
            self.guards.insert(name.to_string(), guard);
        }
        Ok(())
    }

    /// Balance as seen by this session, including its own buffered writes.
    ///
    /// Unknown accounts are reported without taking a lock, so lookups of
    /// missing names leave no entry in the lock table.
    pub async fn read(&mut self, name: &str) -> Result<Balance> {
        if let Some(balance) = self.pending.get(name) {
            return Ok(*balance);
        }
        let locked = self.guards.contains_key(name);
        if !locked && self.ledger.inner.store.get(name).await?.is_none() {
            return Err(RouteError::AccountNotFound(name.to_string()));
        }
        self.acquire(name).await?;
        self.ledger.read(name).await
    }

    /// Buffers an additive delta and returns the new session-local balance.
    pub async fn write(&mut self, name: &str, delta: i64) -> Result<Balance> {
        let current = self.read(name).await?;
        let updated = current.apply(delta)?;
        trace!(session = self.id, account = name, delta, "buffered ledger write");
        self.pending.insert(name.to_string(), updated);
        Ok(updated)
    }

    /// Checks that every written account still exists.
    pub async fn prepare(&self) -> Result<Vote> {
        for name in self.pending.keys() {
            if self.ledger.inner.store.get(name).await?.is_none() {
                return Ok(Vote::Abort(format!("account '{}' no longer exists", name)));
            }
        }
        Ok(Vote::ReadyToCommit)
    }

    pub async fn commit(self) -> Result<()> {
        if !self.pending.is_empty() {
            let batch: Vec<Account> = self
                .pending
                .iter()
                .map(|(name, balance)| Account {
                    name: name.clone(),
                    balance: *balance,
                })
                .collect();
            debug!(session = self.id, rows = batch.len(), "committing ledger session");
            self.ledger.inner.store.store_all(batch).await?;
        }
        Ok(())
    }

    pub fn rollback(self) {
        if self.is_dirty() {
            debug!(
                session = self.id,
                rows = self.pending.len(),
                "rolling back ledger session"
            );
        }
    }
}
