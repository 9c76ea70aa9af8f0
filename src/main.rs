use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use scheduler_config::{AppConfig, LogLevel, OutputFormat};
use scheduler_observability::{init_logging, init_metrics, LogFormat, LoggingConfig};

mod app;
mod shutdown;

use app::Application;
use shutdown::{wait_for_signal, ShutdownManager};

#[derive(Debug, Parser)]
#[command(name = "hpc-scheduler", version, about = "HPC批处理计算调度系统")]
struct Cli {
    /// 配置文件路径，未指定时依次查找默认位置
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<String>,

    /// 日志级别，覆盖配置文件
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<LogLevel>,

    /// 日志格式 (json | pretty)，覆盖配置文件
    #[arg(long, value_name = "FORMAT", global = true)]
    log_format: Option<OutputFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// 持续运行调度循环
    Run,
    /// 执行一轮调度后退出
    Once,
    /// 校验配置和资源清单
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).with_context(|| {
        format!(
            "加载配置文件失败: {}",
            cli.config.as_deref().unwrap_or("<默认路径>")
        )
    })?;
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }
    if let Some(format) = cli.log_format {
        config.observability.log_format = format;
    }

    init_logging(&LoggingConfig {
        level: config.observability.log_level.to_string(),
        format: match config.observability.log_format {
            OutputFormat::Json => LogFormat::Json,
            OutputFormat::Pretty => LogFormat::Pretty,
        },
        include_location: false,
    })?;

    match cli.command {
        Commands::CheckConfig => check_config(config).await,
        Commands::Once => run_once(config).await,
        Commands::Run => run(config).await,
    }
}

async fn check_config(config: AppConfig) -> Result<()> {
    let toml = config.to_toml()?;
    Application::new(config).await?;
    info!("配置和资源清单校验通过");
    println!("{toml}");
    Ok(())
}

async fn run_once(config: AppConfig) -> Result<()> {
    let app = Application::new(config).await?;
    let report = app.run_once().await?;
    info!(
        "单轮调度完成: 提交 {}, 回收 {}, 放置 {}, 完成 {}, 失败 {}, 跳过 {}",
        report.submitted,
        report.collected,
        report.placed,
        report.completed,
        report.failed,
        report.skipped
    );
    Ok(())
}

async fn run(config: AppConfig) -> Result<()> {
    info!("启动HPC调度系统");

    if let Some(address) = &config.observability.metrics_address {
        init_metrics(address).context("启动指标导出器失败")?;
    }

    let app = Arc::new(Application::new(config).await?);
    let shutdown_manager = ShutdownManager::new();

    let app_handle = {
        let shutdown_rx = shutdown_manager.subscribe().await;
        let app = Arc::clone(&app);
        tokio::spawn(async move { app.run(shutdown_rx).await })
    };

    wait_for_signal().await.context("安装信号处理器失败")?;
    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown().await;

    // 当前轮次结束后循环才会退出
    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(Ok(())) => info!("调度循环已优雅关闭"),
        Ok(Err(e)) => error!("调度循环关闭时发生错误: {e}"),
        Err(_) => warn!("调度循环关闭超时，强制退出"),
    }

    info!("HPC调度系统已退出");
    Ok(())
}
