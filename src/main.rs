use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stage_transfer::config;
use stage_transfer::storage::BackendRegistry;
use stage_transfer::transfer::{CommandExecutor, FileTransferAgent, TransferOptions, TransferResponse};

/// Replays a saved transfer response for every command / 重放已保存的传输响应
///
/// Credential and presigned URL renewals re-read the file, so a response
/// refreshed on disk is picked up mid-transfer.
struct StaticExecutor {
    path: PathBuf,
}

impl StaticExecutor {
    fn load(&self) -> Result<TransferResponse> {
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| anyhow!("Failed to read {}: {}", self.path.display(), e))?;
        serde_json::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse {}: {}", self.path.display(), e))
    }
}

#[async_trait]
impl CommandExecutor for StaticExecutor {
    async fn execute(&self, command: &str) -> Result<TransferResponse> {
        tracing::debug!("Executing: {}", command);
        self.load()
    }
}

fn usage() -> String {
    format!(
        "stage-transfer {} (built {})\n\nUsage: stage-transfer <response.json> [command]",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME")
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration / 加载配置
    let app_config = config::init_config()
        .map_err(|e| anyhow!(e))?
        .read()
        .clone();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| app_config.log.filter.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let arg = match std::env::args().nth(1) {
        Some(arg) if arg == "--version" || arg == "-V" => {
            println!("stage-transfer {} (built {})", env!("CARGO_PKG_VERSION"), env!("BUILD_TIME"));
            return Ok(());
        }
        Some(arg) if arg != "--help" && arg != "-h" => arg,
        _ => {
            eprintln!("{}", usage());
            std::process::exit(2);
        }
    };

    let executor = Arc::new(StaticExecutor { path: PathBuf::from(arg) });
    let response = executor.load()?;
    // The original PUT/GET text, re-run on renewals / 原始命令
    let command = std::env::args().nth(2)
        .or_else(|| response.data.as_ref().map(|d| d.command.clone()))
        .unwrap_or_default();

    // Register stage backends / 注册存储后端
    let registry = BackendRegistry::new();
    stage_transfer::register_backends(&registry).await?;

    let options = TransferOptions::from(&app_config.transfer);
    let mut agent = FileTransferAgent::new(registry, executor, command, response, options);
    let outcome = agent.execute().await;

    if let Some(result) = agent.result() {
        println!("{}", result.render());
    }

    if let Err(e) = outcome {
        tracing::error!("Transfer failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}
