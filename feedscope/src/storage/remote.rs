//! Table store backed by a remote table service.

use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::codec::{decode_entity, encode_entity, TableRecord};
use super::init::InitGuard;
use super::{ExtraFields, ExtraFieldsFn, StoredEntity, TableStore};
use crate::error::Result;

/// Entity group transactions are capped at this many operations.
pub const MAX_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub enum TableOperation {
    Upsert(TableRecord),
    Delete { row_key: String },
}

/// Raw access to a remote table service.
#[async_trait::async_trait]
pub trait TableClient: Send + Sync {
    async fn create_table_if_not_exists(&self, table: &str) -> Result<()>;

    async fn get_entity(&self, table: &str, partition: &str, row_key: &str)
        -> Result<Option<TableRecord>>;

    /// Filter strings are passed to the service verbatim.
    async fn query_entities(
        &self,
        table: &str,
        partition: Option<&str>,
        filter: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<TableRecord>>;

    /// Submit up to [`MAX_BATCH_SIZE`] operations on one partition as a
    /// single all-or-nothing transaction.
    async fn submit_transaction(
        &self,
        table: &str,
        partition: &str,
        operations: &[TableOperation],
    ) -> Result<()>;
}

pub struct RemoteTableStore<T> {
    client: Arc<dyn TableClient>,
    table: String,
    ready: InitGuard,
    _entity: PhantomData<fn() -> T>,
}

impl<T: StoredEntity> RemoteTableStore<T> {
    pub fn new(client: Arc<dyn TableClient>, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
            ready: InitGuard::new(),
            _entity: PhantomData,
        }
    }

    async fn ensure_table(&self) -> Result<()> {
        self.ready
            .get_or_init(|| async {
                self.client.create_table_if_not_exists(&self.table).await?;
                info!("Table '{}' ready", self.table);
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn submit_in_batches(&self, partition: &str, operations: Vec<TableOperation>) -> Result<()> {
        for batch in operations.chunks(MAX_BATCH_SIZE) {
            debug!(
                "Submitting {} operations to '{}' partition '{}'",
                batch.len(),
                self.table,
                partition
            );
            self.client
                .submit_transaction(&self.table, partition, batch)
                .await?;
        }
        Ok(())
    }
}

fn decode_records<T: StoredEntity>(records: &[TableRecord]) -> Vec<T> {
    let decoded: Vec<T> = records.iter().filter_map(decode_entity).collect();
    if decoded.len() < records.len() {
        warn!("Skipped {} undecodable records", records.len() - decoded.len());
    }
    decoded
}

#[async_trait::async_trait]
impl<T: StoredEntity> TableStore<T> for RemoteTableStore<T> {
    async fn get(&self, key: &str, partition: &str) -> Result<Option<T>> {
        self.ensure_table().await?;
        let record = self.client.get_entity(&self.table, partition, key).await?;
        Ok(record.as_ref().and_then(decode_entity))
    }

    async fn get_all(&self, top: Option<usize>, skip: usize) -> Result<Vec<T>> {
        self.query(None, None, top, skip).await
    }

    async fn query(
        &self,
        filter: Option<&str>,
        partition: Option<&str>,
        top: Option<usize>,
        skip: usize,
    ) -> Result<Vec<T>> {
        self.ensure_table().await?;
        let limit = top.map(|top| top + skip);
        let records = self
            .client
            .query_entities(&self.table, partition, filter, limit)
            .await?;
        let decoded = decode_records(&records);
        Ok(crate::model::paginate(decoded, top, skip))
    }

    async fn write(&self, data: &T, partition: &str, extra: Option<&ExtraFields>) -> Result<()> {
        let record = encode_entity(data, partition, &data.row_key(), extra)?;
        self.ensure_table().await?;
        self.client
            .submit_transaction(&self.table, partition, &[TableOperation::Upsert(record)])
            .await
    }

    async fn write_batch(
        &self,
        data: &[T],
        partition: &str,
        extra: Option<ExtraFieldsFn<T>>,
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let operations = data
            .iter()
            .map(|entity| {
                let fields = extra.map(|f| f(entity));
                encode_entity(entity, partition, &entity.row_key(), fields.as_ref())
                    .map(TableOperation::Upsert)
            })
            .collect::<Result<Vec<_>>>()?;

        self.ensure_table().await?;
        self.submit_in_batches(partition, operations).await
    }

    async fn delete(&self, key: &str, partition: &str) -> Result<()> {
        self.ensure_table().await?;
        self.client
            .submit_transaction(
                &self.table,
                partition,
                &[TableOperation::Delete {
                    row_key: key.to_string(),
                }],
            )
            .await
    }

    async fn delete_batch(&self, keys: &[String], partition: &str) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.ensure_table().await?;
        let operations = keys
            .iter()
            .map(|key| TableOperation::Delete {
                row_key: key.clone(),
            })
            .collect();
        self.submit_in_batches(partition, operations).await
    }
}

/// In-memory [`TableClient`] used by unit tests across the crate. Understands
/// the same filter subset as the local store.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use crate::error::FeedscopeError;
    use crate::storage::filter::FieldFilter;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct FakeTableClient {
        pub rows: Mutex<BTreeMap<(String, String), TableRecord>>,
        pub creates: AtomicUsize,
        pub transactions: Mutex<Vec<usize>>,
        pub fail_creates: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl TableClient for FakeTableClient {
        async fn create_table_if_not_exists(&self, _table: &str) -> Result<()> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if self.fail_creates.load(Ordering::SeqCst) > 0 {
                self.fail_creates.fetch_sub(1, Ordering::SeqCst);
                return Err(FeedscopeError::Storage("service unavailable".to_string()));
            }
            Ok(())
        }

        async fn get_entity(
            &self,
            _table: &str,
            partition: &str,
            row_key: &str,
        ) -> Result<Option<TableRecord>> {
            let rows = self.rows.lock().await;
            Ok(rows.get(&(partition.to_string(), row_key.to_string())).cloned())
        }

        async fn query_entities(
            &self,
            _table: &str,
            partition: Option<&str>,
            filter: Option<&str>,
            limit: Option<usize>,
        ) -> Result<Vec<TableRecord>> {
            let parsed = match filter {
                Some(raw) => Some(
                    FieldFilter::parse(raw)
                        .ok_or_else(|| FeedscopeError::Storage(format!("bad filter {}", raw)))?,
                ),
                None => None,
            };
            let rows = self.rows.lock().await;
            Ok(rows
                .values()
                .filter(|r| partition.map_or(true, |p| r.partition_key == p))
                .filter(|r| parsed.as_ref().map_or(true, |f| f.matches(r)))
                .take(limit.unwrap_or(usize::MAX))
                .cloned()
                .collect())
        }

        async fn submit_transaction(
            &self,
            _table: &str,
            partition: &str,
            operations: &[TableOperation],
        ) -> Result<()> {
            assert!(operations.len() <= MAX_BATCH_SIZE);
            self.transactions.lock().await.push(operations.len());
            let mut rows = self.rows.lock().await;
            for operation in operations {
                match operation {
                    TableOperation::Upsert(record) => {
                        assert_eq!(record.partition_key, partition);
                        rows.insert(
                            (partition.to_string(), record.row_key.clone()),
                            record.clone(),
                        );
                    }
                    TableOperation::Delete { row_key } => {
                        rows.remove(&(partition.to_string(), row_key.clone()));
                    }
                }
            }
            Ok(())
        }
    }
}
