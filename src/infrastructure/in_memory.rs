use crate::domain::account::Account;
use crate::domain::ports::AccountStore;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A thread-safe in-memory store for committed accounts.
///
/// Uses `Arc<RwLock<BTreeMap<String, Account>>>` so that `store_all` can swap
/// several rows under one write guard, which makes a commit atomic to readers.
#[derive(Default, Clone)]
pub struct InMemoryAccountStore {
    accounts: Arc<RwLock<BTreeMap<String, Account>>>,
}

impl InMemoryAccountStore {
    /// Creates a new, empty in-memory account store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn get(&self, name: &str) -> Result<Option<Account>> {
        let accounts = self.accounts.read().await;
        Ok(accounts.get(name).cloned())
    }

    async fn store(&self, account: Account) -> Result<()> {
        let mut accounts = self.accounts.write().await;
        accounts.insert(account.name.clone(), account);
        Ok(())
    }

    async fn store_all(&self, batch: Vec<Account>) -> Result<()> {
        let mut accounts = self.accounts.write().await;
        for account in batch {
            accounts.insert(account.name.clone(), account);
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let mut accounts = self.accounts.write().await;
        accounts.remove(name);
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<Account>> {
        let accounts = self.accounts.read().await;
        Ok(accounts.values().cloned().collect())
    }
}
