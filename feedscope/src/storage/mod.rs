//! Chunked key-value table storage.
//!
//! Two backends implement [`TableStore`]: [`local::LocalTableStore`] keeps a
//! whole table in one JSON document on disk, [`remote::RemoteTableStore`]
//! talks to an Azure-Table-compatible service. Both share the chunk codec in
//! [`codec`] so the on-disk shape and the wire shape stay the same.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::error::Result;

pub mod azure;
pub mod codec;
pub mod filter;
pub mod init;
pub mod local;
pub mod remote;

pub use filter::{Comparison, FieldFilter};

/// Entity that can be persisted in a table.
pub trait StoredEntity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn row_key(&self) -> String;
}

/// Scalar mirrored next to the payload so it can be filtered on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtraValue {
    Text(String),
    Int(i64),
}

pub type ExtraFields = Vec<(String, ExtraValue)>;

/// Derives the extra fields of each entity in a batch write.
pub type ExtraFieldsFn<T> = fn(&T) -> ExtraFields;

/// Storage contract shared by the local and remote backends.
///
/// Reads degrade to absent or empty on corrupt records and only return an
/// error for transport failures. Writes reject oversize entities before
/// anything is persisted.
#[async_trait::async_trait]
pub trait TableStore<T: StoredEntity>: Send + Sync {
    async fn get(&self, key: &str, partition: &str) -> Result<Option<T>>;

    async fn get_all(&self, top: Option<usize>, skip: usize) -> Result<Vec<T>>;

    /// `filter` of `None` means no predicate; `partition` of `None` scans
    /// the whole table.
    async fn query(
        &self,
        filter: Option<&str>,
        partition: Option<&str>,
        top: Option<usize>,
        skip: usize,
    ) -> Result<Vec<T>>;

    async fn write(&self, data: &T, partition: &str, extra: Option<&ExtraFields>) -> Result<()>;

    async fn write_batch(
        &self,
        data: &[T],
        partition: &str,
        extra: Option<ExtraFieldsFn<T>>,
    ) -> Result<()>;

    async fn delete(&self, key: &str, partition: &str) -> Result<()>;

    async fn delete_batch(&self, keys: &[String], partition: &str) -> Result<()>;
}

/// Open `table` on the remote service when a connection string is
/// configured, otherwise on the local disk.
pub fn open_table_store<T: StoredEntity>(
    config: &common::Config,
    table: &str,
) -> Result<Arc<dyn TableStore<T>>> {
    match config.remote_connection_string() {
        Some(connection_string) => {
            let client = azure::AzureTableClient::from_connection_string(&connection_string)?;
            info!("Using remote table storage for '{}'", table);
            Ok(Arc::new(remote::RemoteTableStore::new(Arc::new(client), table)))
        }
        None => {
            let path = config.local_store_dir().join(format!("{}.json", table));
            info!("Using local table storage for '{}' at {}", table, path.display());
            Ok(Arc::new(local::LocalTableStore::new(path)))
        }
    }
}
