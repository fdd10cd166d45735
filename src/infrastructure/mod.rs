//! Adapters for the external collaborators: account storage backends and
//! the in-process message channels.

pub mod channel;
pub mod in_memory;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
