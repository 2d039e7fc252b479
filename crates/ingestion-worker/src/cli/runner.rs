//! 命令执行器
//!
//! 把命令行参数转化为存储、工作者和消费者的装配与调用。

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use savannah_shared::config::AppConfig;
use savannah_shared::database::Database;
use savannah_shared::dlq::{DlqConsumer, DlqProducer};
use savannah_shared::kafka::KafkaProducer;
use savannah_shared::retry::RetryPolicy;

use crate::consumer::DeliveryConsumer;
use crate::envelope::EnvelopeBatch;
use crate::store::{DeliveryStore, InMemoryDeliveryStore, PgDeliveryStore};
use crate::worker::{BatchResponse, IngestionWorker};

pub struct CommandRunner {
    config: AppConfig,
}

impl CommandRunner {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    /// 执行 consume 命令
    ///
    /// 配送事件消费者与死信队列消费者共用一个关闭信号，两者都退出后关闭连接池。
    pub async fn run_consume(&self) -> Result<()> {
        let db = Database::connect(&self.config.database)
            .await
            .context("连接数据库失败")?;
        db.health_check().await.context("数据库健康检查失败")?;
        let worker = self.worker(Arc::new(PgDeliveryStore::new(db.pool().clone())));

        let producer = Arc::new(KafkaProducer::new(&self.config.kafka)?);
        let dlq = DlqProducer::new(
            producer.clone(),
            &self.config.kafka.dead_letter_topic,
            &self.config.service_name,
            RetryPolicy::redelivery(&self.config.worker),
        );

        let consumer = DeliveryConsumer::new(&self.config, worker, dlq)?;
        let dlq_consumer = DlqConsumer::new(&self.config, producer)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        });

        info!(
            max_redeliveries = self.config.worker.max_redeliveries,
            "入库服务已启动，按 Ctrl+C 停止"
        );

        let (consumed, ()) = tokio::join!(
            consumer.run(shutdown_rx.clone()),
            dlq_consumer.run(shutdown_rx)
        );

        db.close().await;
        consumed?;

        info!("入库服务已停止");
        Ok(())
    }

    /// 执行 invoke 命令，响应 JSON 写到标准输出
    pub async fn run_invoke(&self, file: &Path, in_memory: bool) -> Result<()> {
        let input = read_input(file).await?;

        let store: Arc<dyn DeliveryStore> = if in_memory {
            info!("使用进程内存储");
            Arc::new(InMemoryDeliveryStore::new())
        } else {
            let db = Database::connect(&self.config.database)
                .await
                .context("连接数据库失败")?;
            Arc::new(PgDeliveryStore::new(db.pool().clone()))
        };

        let response = invoke_batch(&self.worker(store), &input).await?;
        let output = serde_json::to_string_pretty(&response)?;
        println!("{output}");
        Ok(())
    }

    /// 执行 migrate 命令
    pub async fn run_migrate(&self) -> Result<()> {
        let db = Database::connect(&self.config.database)
            .await
            .context("连接数据库失败")?;
        db.run_migrations().await.context("数据库迁移失败")?;
        db.close().await;
        Ok(())
    }

    fn worker(&self, store: Arc<dyn DeliveryStore>) -> IngestionWorker {
        IngestionWorker::new(store).with_concurrency(self.config.worker.effective_concurrency())
    }
}

/// 处理一个 JSON 批次，返回部分失败响应
///
/// 只有输入整体不是 `{"Records": [...]}` 时才返回错误；单条记录的任何失败都只体现在响应里。
pub async fn invoke_batch(worker: &IngestionWorker, input: &str) -> Result<BatchResponse> {
    let batch: EnvelopeBatch = serde_json::from_str(input).context("批次格式错误")?;
    let report = worker.process_batch(&batch.records).await;
    Ok(report.batch_response())
}

async fn read_input(file: &Path) -> Result<String> {
    if file == Path::new("-") {
        let mut input = String::new();
        tokio::io::stdin()
            .read_to_string(&mut input)
            .await
            .context("读取标准输入失败")?;
        return Ok(input);
    }

    tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("读取批次文件失败: {}", file.display()))
}

/// 监听 Ctrl+C 和 SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "安装 Ctrl+C 信号处理器失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "安装 SIGTERM 信号处理器失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("收到 Ctrl+C，开始优雅关闭..."),
        _ = terminate => info!("收到 SIGTERM，开始优雅关闭..."),
    }
}
