//! switchboard-console - 设备编排控制台
//!
//! 负责：
//! - 加载配置并注册设备
//! - 运行控制上下文（listener / OSC / 集群监控）
//! - 退出时保存配置

use anyhow::Result;
use switchboard_engine::{Console, ConsoleConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("switchboard_engine=debug".parse()?))
        .init();

    tracing::info!("🚀 switchboard-console v{}", env!("CARGO_PKG_VERSION"));

    let path = ConsoleConfig::env_path();
    let config = ConsoleConfig::load(&path)?;

    let (console, _handle) = Console::new(config, Some(path))?;
    console.run().await?;

    tracing::info!("👋 switchboard-console exiting");
    Ok(())
}
