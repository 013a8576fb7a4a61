//! 通知事件引擎服务
//!
//! 装配内存仓储、事件引擎和摘要调度，运行到收到 Ctrl-C 为止。

use std::sync::Arc;

use notification_engine::{
    DigestService, DigestWorker, NotificationEngine, handler_fn,
    facade::DELIVERY_EVENT,
    repository::{
        LoggingDigestMailer, MemoryDigestRepository, MemoryNotificationRepository,
        MemoryPreferenceRepository, StaticRecipientResolver,
    },
};
use notify_shared::{config::AppConfig, observability};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env 不存在时忽略
    let _ = dotenvy::dotenv();

    let config = AppConfig::load("notification-engine")?;
    config.validate()?;
    observability::init(&config.service_name, &config.observability)?;

    info!(
        environment = %config.environment,
        digest_cron = %config.digest.cron,
        "Starting notification-engine..."
    );

    let notifications = Arc::new(MemoryNotificationRepository::new());
    let engine = Arc::new(
        NotificationEngine::builder()
            .with_config(config.engine.clone())
            .with_shared_repository(notifications.clone())
            .with_preference_repository(Arc::new(MemoryPreferenceRepository::new()))
            .with_resolver(Arc::new(StaticRecipientResolver::new()))
            .build(),
    );

    // 默认投递渠道只记录日志，真实渠道通过订阅同一事件接入
    let _delivery = engine.on(
        DELIVERY_EVENT,
        handler_fn("log-delivery", |envelope| async move {
            info!(
                recipient = ?envelope.recipient,
                notification_id = ?envelope.payload_str("id"),
                "通知已投递"
            );
            Ok(())
        }),
    )?;

    let digests = Arc::new(DigestService::new(
        &config.digest,
        &config.engine.critical_events,
        notifications,
        Arc::new(MemoryDigestRepository::new()),
        engine.preferences().clone(),
        Arc::new(LoggingDigestMailer),
    ));
    let (worker, worker_task) = DigestWorker::new(digests, &config.digest.cron)?.spawn();

    tokio::signal::ctrl_c().await?;
    info!("收到停止信号，开始关闭");

    worker.stop();
    let drained = engine.shutdown(true).await;
    worker_task.await?;

    info!(
        processed = drained.processed,
        failed = drained.failed,
        "notification-engine 已停止"
    );
    Ok(())
}
