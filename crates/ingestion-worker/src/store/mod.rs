//! 配送记录存储
//!
//! 存储只需要提供一个原子的"不存在才插入"原语，并能区分条件检查失败与其他错误。
//! 没有更新和删除路径。
//!
//! ## 实现
//!
//! - [`PgDeliveryStore`]：PostgreSQL，依赖主键约束保证并发下只插入一次
//! - [`InMemoryDeliveryStore`]：进程内实现，用于本地试跑和测试

mod memory;
mod postgres;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::StoredRecord;

pub use memory::InMemoryDeliveryStore;
pub use postgres::PgDeliveryStore;

/// 条件插入的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// 相同 order_id 的记录已存在，存储未发生变化
    AlreadyExists,
}

/// 配送记录存储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// 仅当 order_id 不存在时插入记录
    async fn insert_if_absent(&self, record: &StoredRecord) -> Result<InsertOutcome, StoreError>;

    async fn find(&self, order_id: &str) -> Result<Option<StoredRecord>, StoreError>;
}
