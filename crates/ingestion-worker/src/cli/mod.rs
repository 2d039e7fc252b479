//! CLI 模块
//!
//! - `consume` - 消费 Kafka 配送事件并写入 PostgreSQL
//! - `invoke` - 处理一个批次文件，输出部分失败响应
//! - `migrate` - 执行数据库迁移
//!
//! # 使用示例
//!
//! ```bash
//! ingestion-worker migrate
//! ingestion-worker consume
//! ingestion-worker invoke --file batch.json --in-memory
//! cat batch.json | ingestion-worker invoke --file -
//! ```

pub mod commands;
pub mod runner;

pub use commands::{Cli, Commands};
pub use runner::{CommandRunner, invoke_batch};
