//! PostgreSQL 存储
//!
//! 使用 `ON CONFLICT (order_id) DO NOTHING RETURNING` 实现条件插入：
//! 返回行表示本次插入成功，无返回行表示记录已存在。
//! 主键约束在数据库内完成检查与插入，并发写入同一订单时只有一个会成功。

use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use tracing::debug;

use super::{DeliveryStore, InsertOutcome};
use crate::error::StoreError;
use crate::model::{RecordStatus, StoredRecord};

pub struct PgDeliveryStore {
    pool: PgPool,
}

#[derive(FromRow)]
struct DeliveryRow {
    order_id: String,
    driver_id: String,
    status: String,
    amount: f64,
}

impl TryFrom<DeliveryRow> for StoredRecord {
    type Error = StoreError;

    fn try_from(row: DeliveryRow) -> Result<Self, Self::Error> {
        let status: RecordStatus = row.status.parse().map_err(StoreError::Rejected)?;
        Ok(Self {
            order_id: row.order_id,
            driver_id: row.driver_id,
            status,
            amount: row.amount,
        })
    }
}

impl PgDeliveryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeliveryStore for PgDeliveryStore {
    async fn insert_if_absent(&self, record: &StoredRecord) -> Result<InsertOutcome, StoreError> {
        let inserted = sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO deliveries (order_id, driver_id, status, amount)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (order_id) DO NOTHING
            RETURNING order_id
            "#,
        )
        .bind(&record.order_id)
        .bind(&record.driver_id)
        .bind(record.status.as_str())
        .bind(record.amount)
        .fetch_optional(&self.pool)
        .await?;

        let outcome = match inserted {
            Some(_) => InsertOutcome::Inserted,
            None => InsertOutcome::AlreadyExists,
        };
        debug!(order_id = %record.order_id, ?outcome, "条件插入完成");
        Ok(outcome)
    }

    async fn find(&self, order_id: &str) -> Result<Option<StoredRecord>, StoreError> {
        let row = sqlx::query_as::<_, DeliveryRow>(
            r#"
            SELECT order_id, driver_id, status, amount
            FROM deliveries
            WHERE order_id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StoredRecord::try_from).transpose()
    }
}
