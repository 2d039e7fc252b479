//! 入库工作者
//!
//! 把至少一次投递的消息流转换为至多一次的存储写入：
//! 解码信封 -> 条件插入 -> 按记录分类结果（已插入 / 重复 / 需重投）。
//! 批次内各记录互不影响，单条失败只标记该条记录重投。

use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::envelope::Envelope;
use crate::error::IngestError;
use crate::model::StoredRecord;
use crate::store::{DeliveryStore, InsertOutcome};

/// 单条记录处理成功时的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// 首次写入，记录已持久化
    Inserted,
    /// 记录已存在，本次为空操作
    Duplicate,
}

/// 批次中一条记录的处理结果
#[derive(Debug)]
pub struct RecordResult {
    pub message_id: String,
    pub outcome: Result<RecordOutcome, IngestError>,
}

/// 需要投递层重投的记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailure {
    pub item_identifier: String,
}

/// 批次部分失败响应，只列出需要重投的记录
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub batch_item_failures: Vec<BatchItemFailure>,
}

/// 批次处理报告，结果顺序与输入顺序一致
#[derive(Debug, Default)]
pub struct BatchReport {
    pub results: Vec<RecordResult>,
}

impl BatchReport {
    pub fn inserted(&self) -> usize {
        self.count(RecordOutcome::Inserted)
    }

    pub fn duplicates(&self) -> usize {
        self.count(RecordOutcome::Duplicate)
    }

    pub fn failed(&self) -> usize {
        self.failures().count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &IngestError> {
        self.results.iter().filter_map(|r| r.outcome.as_ref().err())
    }

    pub fn batch_response(&self) -> BatchResponse {
        BatchResponse {
            batch_item_failures: self
                .results
                .iter()
                .filter(|r| r.outcome.is_err())
                .map(|r| BatchItemFailure {
                    item_identifier: r.message_id.clone(),
                })
                .collect(),
        }
    }

    fn count(&self, expected: RecordOutcome) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, Ok(outcome) if outcome == expected))
            .count()
    }
}

/// 入库工作者
///
/// 只持有共享的存储客户端，没有其他可变状态；同一个实例可以被多个调用并发使用。
#[derive(Clone)]
pub struct IngestionWorker {
    store: Arc<dyn DeliveryStore>,
    concurrency: usize,
}

impl IngestionWorker {
    pub fn new(store: Arc<dyn DeliveryStore>) -> Self {
        Self {
            store,
            concurrency: 1,
        }
    }

    /// 批次内同时处理的记录数，0 按 1 处理
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn DeliveryStore> {
        &self.store
    }

    /// 处理单条记录
    ///
    /// 重复记录按成功返回；解码失败和非重复类存储错误作为错误返回，调用方据此重投。
    /// 解码完成前的日志只使用 message_id。
    #[instrument(skip_all, fields(message_id = %envelope.message_id))]
    pub async fn process_record(&self, envelope: &Envelope) -> Result<RecordOutcome, IngestError> {
        let event = envelope.decode().inspect_err(|e| {
            warn!(error = %e, error_code = e.code(), "消息解析失败，等待重投");
        })?;

        info!(
            order_id = %event.order_id,
            driver_id = %event.driver_id,
            amount = event.amount,
            "处理配送订单"
        );

        let record = StoredRecord::processed(&event);
        match self.store.insert_if_absent(&record).await {
            Ok(InsertOutcome::Inserted) => {
                info!(order_id = %record.order_id, "订单已入库");
                Ok(RecordOutcome::Inserted)
            }
            Ok(InsertOutcome::AlreadyExists) => {
                info!(order_id = %record.order_id, "订单已处理过，跳过");
                Ok(RecordOutcome::Duplicate)
            }
            Err(source) => {
                error!(
                    order_id = %record.order_id,
                    error = %source,
                    error_code = source.code(),
                    "订单写入失败，等待重投"
                );
                Err(IngestError::Store {
                    message_id: envelope.message_id.clone(),
                    order_id: record.order_id,
                    source,
                })
            }
        }
    }

    /// 处理一批记录
    ///
    /// 最多 `concurrency` 条记录同时处理，各记录的结果独立报告。
    pub async fn process_batch(&self, envelopes: &[Envelope]) -> BatchReport {
        let results: Vec<RecordResult> = futures::stream::iter(envelopes)
            .map(|envelope| async move {
                RecordResult {
                    message_id: envelope.message_id.clone(),
                    outcome: self.process_record(envelope).await,
                }
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let report = BatchReport { results };
        info!(
            total = envelopes.len(),
            inserted = report.inserted(),
            duplicates = report.duplicates(),
            failed = report.failed(),
            "批次处理完成"
        );
        report
    }
}
