//! CLI 命令定义

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// 配送事件入库服务
#[derive(Parser, Debug)]
#[command(name = "ingestion-worker")]
#[command(version, about = "配送事件幂等入库服务")]
#[command(propagate_version = true)]
pub struct Cli {
    /// 日志级别 (trace, debug, info, warn, error)，覆盖配置文件
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 消费 Kafka 配送事件，直到 Ctrl+C
    ///
    /// 同时运行死信队列消费者，按退避策略重投失败消息。
    Consume,

    /// 处理一个批次并输出部分失败响应
    ///
    /// 批次格式为 `{"Records": [{"messageId": ..., "body": ...}]}`。
    /// 存在失败记录时退出码仍为 0，失败记录列在响应中。
    Invoke {
        /// 批次文件路径，`-` 表示从标准输入读取
        #[arg(short, long)]
        file: PathBuf,

        /// 使用进程内存储，不连接数据库
        #[arg(long)]
        in_memory: bool,
    },

    /// 执行数据库迁移
    Migrate,
}
