//! Flowdesk 服务入口
//!
//! 组合根：加载配置、初始化日志、构造 Runtime 句柄与共享服务、启动 HTTP 服务，收到信号后优雅关闭。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use flowdesk::config::load_config;
use flowdesk::core::{RuntimeCleanup, ShutdownCoordinator, ShutdownManager};
use flowdesk::observability;
use flowdesk::runtime::{create_factory, RuntimeHandle, RuntimeOptions};
use flowdesk::web::{serve, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load configuration")?;
    observability::init(cfg.app.debug);
    cfg.validate().context("Invalid configuration")?;

    let factory = create_factory(&cfg)?;
    let runtime = RuntimeHandle::new(factory, RuntimeOptions::from_config(&cfg));
    tracing::info!(
        provider = %cfg.runtime.provider,
        model = %cfg.runtime.model,
        environment = %cfg.app.environment,
        "Starting flowdesk"
    );

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let mut coordinator = ShutdownCoordinator::new().with_timeout(10);
    coordinator.register(RuntimeCleanup::new(runtime.clone()));

    // 首次请求前预热；失败不致命，下次使用时会重新初始化
    let warmup = runtime.clone();
    tokio::spawn(async move {
        if let Err(e) = warmup.get_runtime().await {
            tracing::warn!(error = %e, "Agent runtime warm-up failed");
        }
    });

    let state = AppState::new(&cfg, runtime, shutdown.token());
    serve(&cfg, state).await.context("HTTP server failed")?;

    coordinator.run_cleanup().await;
    tracing::info!("flowdesk stopped");
    Ok(())
}
