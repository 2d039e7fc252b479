//! 进程内存储
//!
//! 基于 DashMap 的 entry API 实现原子的条件插入，可注入按订单的故障用于测试。

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{DeliveryStore, InsertOutcome};
use crate::error::StoreError;
use crate::model::StoredRecord;

#[derive(Debug, Default)]
pub struct InMemoryDeliveryStore {
    records: DashMap<String, StoredRecord>,
    /// 写入这些订单时返回注入的错误，直到被清除
    failures: DashMap<String, StoreError>,
}

impl InMemoryDeliveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟存储故障：之后对该订单的写入都返回给定错误
    pub fn fail_order(&self, order_id: impl Into<String>, error: StoreError) {
        self.failures.insert(order_id.into(), error);
    }

    /// 故障恢复
    pub fn clear_failure(&self, order_id: &str) {
        self.failures.remove(order_id);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl DeliveryStore for InMemoryDeliveryStore {
    async fn insert_if_absent(&self, record: &StoredRecord) -> Result<InsertOutcome, StoreError> {
        if let Some(err) = self.failures.get(&record.order_id) {
            return Err(err.value().clone());
        }

        // entry 持有分片写锁，检查与插入之间不会被其他写入插队
        match self.records.entry(record.order_id.clone()) {
            Entry::Occupied(_) => Ok(InsertOutcome::AlreadyExists),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    async fn find(&self, order_id: &str) -> Result<Option<StoredRecord>, StoreError> {
        Ok(self.records.get(order_id).map(|r| r.value().clone()))
    }
}
