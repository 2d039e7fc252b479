//! 配送事件入库服务
//!
//! 从至少一次投递的队列消费配送完成事件，以 order_id 为幂等键写入存储。
//! 同一订单无论被投递多少次，存储中都只有一条记录；
//! 临时故障导致的失败按记录回报给投递层重投。
//!
//! ## 模块
//!
//! - [`envelope`]：两层信封解码
//! - [`store`]：条件插入存储及其实现
//! - [`worker`]：单条与批量处理，生成部分失败响应
//! - [`consumer`]：Kafka 投递适配，失败消息进入死信队列重投
//! - [`cli`]：命令行入口

pub mod cli;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod model;
pub mod store;
pub mod worker;

pub use envelope::{Envelope, EnvelopeBatch};
pub use error::{IngestError, StoreError};
pub use worker::{BatchReport, BatchResponse, IngestionWorker, RecordOutcome};
