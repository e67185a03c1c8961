//! 主应用程序入口
//!
//! 加载配置，选择发件箱实现，启动中枢协调器与 Axum Web 服务。

use std::sync::Arc;
use std::time::Duration;

use application::{AckProcessor, Clock, Hub, MemoryOutbox, Outbox, SystemClock};
use config::AppConfig;
use infrastructure::{create_pg_pool, spawn_expiry_sweeper, PgOutbox, MIGRATOR};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, JwtService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;

    // 初始化日志，RUST_LOG 优先
    let default_level = if config.is_production() { "info" } else { "debug" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    tracing::info!(config = %config.sanitize(), "配置加载完成");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let retention = config.hub.retention();

    let outbox: Arc<dyn Outbox> = if config.uses_memory_outbox() {
        tracing::warn!("未配置数据库，待投递消息仅保存在内存中");
        Arc::new(MemoryOutbox::new(clock.clone(), retention))
    } else {
        let pool = create_pg_pool(&config.database.url, config.database.max_connections).await?;
        MIGRATOR.run(&pool).await?;
        tracing::info!("数据库迁移完成");
        Arc::new(PgOutbox::new(pool, retention))
    };

    let shutdown = CancellationToken::new();
    let sweeper = spawn_expiry_sweeper(
        outbox.clone(),
        clock.clone(),
        retention,
        config.hub.sweep_interval(),
        shutdown.clone(),
    );

    let (hub, hub_task) = Hub::spawn(outbox.clone(), &config.hub);
    let acks = Arc::new(AckProcessor::new(
        outbox,
        hub.clone(),
        config.hub.outbox_write_timeout(),
    ));
    let jwt_service = Arc::new(JwtService::new(&config.jwt));
    let state = AppState::new(hub.clone(), acks, jwt_service, config.session.clone(), clock);

    let app = router(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("消息中继服务启动在 http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 升级后的 WebSocket 连接不受 axum 优雅关闭跟踪，由协调器逐个关闭
    let grace = config.session.write_timeout() + Duration::from_secs(1);
    match tokio::time::timeout(grace, hub.shutdown()).await {
        Ok(Ok(())) => tracing::info!("所有会话已关闭"),
        Ok(Err(err)) => tracing::warn!(error = %err, "failed to drain sessions"),
        Err(_) => tracing::warn!("会话关闭超时，强制退出"),
    }

    shutdown.cancel();
    let _ = sweeper.await;
    hub_task.abort();
    tracing::info!("服务已停止");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("收到停止信号，开始优雅关闭");
}
