//! 积分结算服务入口
//!
//! 装配顺序：配置 -> 日志 -> 数据库 -> 存储 -> 网关 -> 队列与后台任务 -> HTTP。
//! 所有后台任务共享一个 watch 关停信号，HTTP 优雅退出后统一通知并等待收尾。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use bonus_shared::{config::AppConfig, database::Database, observability, retry::BackoffPolicy};
use settlement_service::{
    api::{self, AppState},
    gateway::HttpAccrualGateway,
    queue::{self, SchedulerDriver},
    reconciler::Reconciler,
    service::BonusService,
    store::{LedgerStore, OrderStore, PgLedgerStore, PgOrderStore},
    worker::SettlementWorker,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load("settlement").unwrap_or_else(|e| {
        eprintln!("配置加载失败，回退到默认配置: {}", e);
        AppConfig::default()
    });

    observability::init(&config.observability)?;

    info!(
        environment = %config.environment,
        addr = %config.server_addr(),
        "结算服务启动"
    );

    // 数据库与存储（connect 内部已做探活，失败即退出）
    let db = Database::connect(&config.database).await?;

    let orders: Arc<dyn OrderStore> = Arc::new(PgOrderStore::new(db.pool().clone()));
    let ledger: Arc<dyn LedgerStore> = Arc::new(PgLedgerStore::new(db.pool().clone()));

    // 积分计算网关
    let gateway = Arc::new(HttpAccrualGateway::new(&config.accrual)?);
    info!(base_url = %config.accrual.base_url, "积分计算网关已配置");

    // 结算队列、重投递调度器、结算工作者、对账扫描
    let (publisher, subscriber) = queue::channel(config.settlement.queue_capacity);
    let (scheduler, driver) = SchedulerDriver::new(publisher.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let backoff = BackoffPolicy {
        kind: config.settlement.backoff,
        base_delay: Duration::from_millis(config.settlement.backoff_base_ms),
        max_delay: Duration::from_millis(config.settlement.backoff_max_ms),
    };

    let worker = SettlementWorker::new(
        orders.clone(),
        gateway,
        scheduler,
        backoff,
        config.settlement.max_republish_count,
    );
    let reconciler = Reconciler::new(orders.clone(), publisher.clone(), &config.settlement);

    let driver_handle = tokio::spawn(driver.run(shutdown_rx.clone()));
    let worker_handle = tokio::spawn(worker.run(subscriber, shutdown_rx.clone()));
    let reconciler_handle = tokio::spawn(reconciler.run(shutdown_rx.clone()));

    // HTTP 服务
    let service = Arc::new(BonusService::new(orders, ledger, publisher));
    let app = api::router(AppState::new(service));

    let listener = TcpListener::bind(config.server_addr()).await?;
    info!(addr = %config.server_addr(), "HTTP 服务监听中");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // HTTP 已退出，通知后台任务收尾并等待
    info!("HTTP 服务已退出，通知后台任务关停");
    if shutdown_tx.send(true).is_err() {
        warn!("后台任务已全部退出");
    }

    let _ = tokio::join!(worker_handle, driver_handle, reconciler_handle);

    db.close().await;
    info!("结算服务已退出");
    Ok(())
}

/// 等待 SIGINT / SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("安装 Ctrl+C 信号处理器失败");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("安装 SIGTERM 信号处理器失败")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("收到 Ctrl+C"),
        _ = terminate => info!("收到 SIGTERM"),
    }
}
