use super::account::Account;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Durable storage of committed account rows.
///
/// Only committed state lives here; in-flight session writes are buffered by
/// the ledger and handed over in one `store_all` call.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<Account>>;
    async fn store(&self, account: Account) -> Result<()>;
    /// Persists all rows atomically: either every row becomes visible or none.
    async fn store_all(&self, accounts: Vec<Account>) -> Result<()>;
    async fn remove(&self, name: &str) -> Result<()>;
    async fn get_all(&self) -> Result<Vec<Account>>;
}

pub type AccountStoreBox = Box<dyn AccountStore>;
pub type SharedAccountStore = Arc<dyn AccountStore>;
pub type AccountStoreFactory = Box<dyn Fn() -> AccountStoreBox + Send + Sync>;

/// Outcome of the prepare phase for one participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vote {
    ReadyToCommit,
    Abort(String),
}

/// A resource enlisted in a unit of work.
#[async_trait]
pub trait Participant: Send {
    fn name(&self) -> &str;
    async fn prepare(&mut self) -> Result<Vote>;
    async fn commit(&mut self) -> Result<()>;
    async fn rollback(&mut self) -> Result<()>;
}
