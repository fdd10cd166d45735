use crate::domain::account::Account;
use crate::domain::ports::AccountStore;
use crate::error::{Result, RouteError};
use async_trait::async_trait;
use rocksdb::{ColumnFamilyDescriptor, DB, Options, WriteBatch};
use std::path::Path;
use std::sync::Arc;

/// Column Family for storing committed account rows.
pub const CF_ACCOUNTS: &str = "accounts";

/// A persistent account store using RocksDB.
///
/// Rows are keyed by account name and stored as JSON. Multi-row commits go
/// through a single `WriteBatch`, which RocksDB applies atomically.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDbAccountStore {
    db: Arc<DB>,
}

fn missing_cf() -> RouteError {
    RouteError::InternalError(Box::new(std::io::Error::other(
        "Accounts column family not found",
    )))
}

fn codec_error(context: &str, err: serde_json::Error) -> RouteError {
    RouteError::InternalError(Box::new(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("{}: {}", context, err),
    )))
}

impl RocksDbAccountStore {
    /// Opens or creates a RocksDB instance at the specified path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_accounts = ColumnFamilyDescriptor::new(CF_ACCOUNTS, Options::default());
        let db = DB::open_cf_descriptors(&opts, path, vec![cf_accounts])?;

        Ok(Self { db: Arc::new(db) })
    }
}

#[async_trait]
impl AccountStore for RocksDbAccountStore {
    async fn get(&self, name: &str) -> Result<Option<Account>> {
        let cf = self.db.cf_handle(CF_ACCOUNTS).ok_or_else(missing_cf)?;

        match self.db.get_cf(&cf, name.as_bytes())? {
            Some(bytes) => {
                let account = serde_json::from_slice(&bytes)
                    .map_err(|e| codec_error("Deserialization error", e))?;
                Ok(Some(account))
            }
            None => Ok(None),
        }
    }

    async fn store(&self, account: Account) -> Result<()> {
        self.store_all(vec![account]).await
    }

    async fn store_all(&self, accounts: Vec<Account>) -> Result<()> {
        let cf = self.db.cf_handle(CF_ACCOUNTS).ok_or_else(missing_cf)?;

        let mut batch = WriteBatch::default();
        for account in &accounts {
            let value =
                serde_json::to_vec(account).map_err(|e| codec_error("Serialization error", e))?;
            batch.put_cf(&cf, account.name.as_bytes(), value);
        }
        self.db.write(batch)?;

        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let cf = self.db.cf_handle(CF_ACCOUNTS).ok_or_else(missing_cf)?;
        self.db.delete_cf(&cf, name.as_bytes())?;
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<Account>> {
        let cf = self.db.cf_handle(CF_ACCOUNTS).ok_or_else(missing_cf)?;

        let mut accounts = Vec::new();
        for item in self.db.iterator_cf(&cf, rocksdb::IteratorMode::Start) {
            let (_key, value) = item?;
            let account: Account = serde_json::from_slice(&value)
                .map_err(|e| codec_error("Failed to deserialize account", e))?;
            accounts.push(account);
        }

        Ok(accounts)
    }
}
