//! 配送事件入库服务入口

use clap::Parser;
use ingestion_worker::cli::{Cli, CommandRunner, Commands};
use savannah_shared::{config::AppConfig, observability};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (mut config, load_error) = match AppConfig::load("ingestion-worker") {
        Ok(config) => (config, None),
        Err(e) => (AppConfig::default(), Some(e)),
    };
    if config.service_name.is_empty() {
        config.service_name = "ingestion-worker".to_string();
    }
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }

    observability::init(&config.observability)?;

    // 日志初始化之后才能输出配置加载失败的警告
    if let Some(e) = load_error {
        warn!(error = %e, "加载配置失败，使用默认配置");
    }
    info!(
        service = %config.service_name,
        environment = %config.environment,
        "配置已加载"
    );

    let runner = CommandRunner::new(config);

    match cli.command {
        Commands::Consume => runner.run_consume().await?,
        Commands::Invoke { file, in_memory } => runner.run_invoke(&file, in_memory).await?,
        Commands::Migrate => runner.run_migrate().await?,
    }

    Ok(())
}
