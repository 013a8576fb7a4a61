//! 通知门面与摘要端到端测试
//!
//! 门面、引擎和摘要服务共享同一组内存仓储，验证通知从创建到
//! 立即投递、合并摘要、按偏好屏蔽的完整流转。

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveTime, Utc};
use notification_engine::digest::DigestService;
use notification_engine::facade::{DELIVERY_EVENT, NotificationServiceFacade};
use notification_engine::models::{
    ActorType, ChannelSetting, DigestRecord, DigestStatus, NewNotification, NotificationCategory,
    NotificationQuery, PreferenceRecord, Priority,
};
use notification_engine::repository::{
    DigestMailer, MemoryDigestRepository, MemoryNotificationRepository, MemoryPreferenceRepository,
    StaticRecipientResolver,
};
use notification_engine::{NotificationEngine, handler_fn};
use notify_shared::config::{DigestConfig, EngineConfig};
use tokio::sync::mpsc;

// ==================== 测试夹具 ====================

#[derive(Default)]
struct CountingMailer {
    sent: AtomicUsize,
}

#[async_trait]
impl DigestMailer for CountingMailer {
    async fn send_digest(&self, _digest: &DigestRecord) -> notification_engine::Result<()> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Fixture {
    facade: NotificationServiceFacade,
    digests: Arc<DigestService>,
    digest_repo: MemoryDigestRepository,
    notifications: MemoryNotificationRepository,
    mailer: Arc<CountingMailer>,
}

fn fixture() -> Fixture {
    let config = EngineConfig::default();
    let notifications = MemoryNotificationRepository::new();
    let digest_repo = MemoryDigestRepository::new();
    let mailer = Arc::new(CountingMailer::default());

    let engine = Arc::new(
        NotificationEngine::builder()
            .with_config(config.clone())
            .with_shared_repository(Arc::new(notifications.clone()))
            .with_preference_repository(Arc::new(MemoryPreferenceRepository::new()))
            .with_resolver(Arc::new(
                StaticRecipientResolver::new()
                    .with_tenant("shop-1", &["owner@shop.com", "staff@shop.com"]),
            ))
            .build(),
    );
    let digests = Arc::new(DigestService::new(
        &DigestConfig::default(),
        &config.critical_events,
        Arc::new(notifications.clone()),
        Arc::new(digest_repo.clone()),
        engine.preferences().clone(),
        mailer.clone(),
    ));

    Fixture {
        facade: NotificationServiceFacade::new(engine, digests.clone()),
        digests,
        digest_repo,
        notifications,
        mailer,
    }
}

fn preference(email: &str) -> PreferenceRecord {
    PreferenceRecord::defaults(email, NaiveTime::from_hms_opt(9, 0, 0).unwrap(), 1)
}

// ==================== 立即投递 ====================

#[tokio::test]
async fn test_critical_notification_is_delivered_immediately() {
    let fx = fixture();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = fx
        .facade
        .engine()
        .on(
            DELIVERY_EVENT,
            handler_fn("capture", move |event| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event);
                    Ok(())
                }
            }),
        )
        .unwrap();

    let outcome = fx
        .facade
        .payment_failed("buyer@example.com", "o-1", "卡余额不足")
        .await
        .unwrap();

    assert_eq!(outcome.records.len(), 1);
    assert_eq!(outcome.sent_immediately, 1);
    assert_eq!(outcome.digested, 0);
    assert!(outcome.records[0].requires_action);

    let delivered = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("delivery event should arrive")
        .unwrap();
    assert_eq!(delivered.recipient.as_deref(), Some("buyer@example.com"));
    assert_eq!(delivered.payload_str("id"), Some(outcome.records[0].id.as_str()));
    assert!(fx.digest_repo.all().is_empty());
}

#[tokio::test]
async fn test_admin_broadcast_is_never_digested() {
    let fx = fixture();

    let outcome = fx.facade.low_stock_alert("p-1", "机械键盘", 2).await.unwrap();

    assert_eq!(outcome.records.len(), 1);
    assert!(outcome.records[0].recipient_email.is_none());
    assert_eq!(outcome.records[0].actor_type, ActorType::Admin);
    assert_eq!(outcome.sent_immediately, 1);
}

// ==================== 摘要 ====================

#[tokio::test]
async fn test_low_priority_notifications_share_one_digest() {
    let fx = fixture();

    let placed = fx.facade.order_placed("buyer@example.com", "o-1", 120.0).await.unwrap();
    let shipped = fx
        .facade
        .order_status_changed("buyer@example.com", "o-1", "shipped")
        .await
        .unwrap();
    let reward = fx
        .facade
        .referral_reward_earned("buyer@example.com", 10.0, "小王")
        .await
        .unwrap();

    assert_eq!(placed.digested + shipped.digested + reward.digested, 3);

    let digests = fx.digest_repo.all();
    assert_eq!(digests.len(), 1);
    assert_eq!(digests[0].status, DigestStatus::Pending);
    assert_eq!(digests[0].notification_ids.len(), 3);
    assert!(digests[0].scheduled_for > Utc::now());

    let report = fx
        .digests
        .process_all_pending_digests_at(Utc::now() + chrono::Duration::days(8))
        .await
        .unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.sent, 1);
    assert_eq!(fx.mailer.sent.load(Ordering::SeqCst), 1);

    let sent = fx.digest_repo.all().remove(0);
    assert_eq!(sent.status, DigestStatus::Sent);
    assert_eq!(sent.grouped_summary[0].category, NotificationCategory::Orders);
    assert_eq!(sent.grouped_summary[0].count, 2);
    assert_eq!(sent.grouped_summary[1].category, NotificationCategory::Referral);
}

#[tokio::test]
async fn test_digest_not_due_is_left_pending() {
    let fx = fixture();
    fx.facade.order_placed("buyer@example.com", "o-1", 1.0).await.unwrap();

    let report = fx
        .digests
        .process_all_pending_digests_at(Utc::now())
        .await
        .unwrap();

    assert_eq!(report.processed, 0);
    assert_eq!(fx.mailer.sent.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_tenant_review_fans_out_and_digests_per_recipient() {
    let fx = fixture();

    let outcome = fx.facade.new_review("shop-1", "p-1", 5, "小李").await.unwrap();

    assert_eq!(outcome.records.len(), 2);
    assert_eq!(outcome.digested, 2);
    assert_eq!(fx.digest_repo.all().len(), 2);
}

// ==================== 偏好 ====================

#[tokio::test]
async fn test_preferences_control_delivery() {
    let fx = fixture();

    // 先触发一次查询，让缓存里留下“无偏好”
    fx.facade.order_placed("fan@example.com", "o-1", 1.0).await.unwrap();

    let mut pref = preference("fan@example.com");
    pref.muted_types.push("payment_confirmed".to_string());
    pref.channel_preferences
        .insert(NotificationCategory::Orders, ChannelSetting::Realtime);
    pref.channel_preferences
        .insert(NotificationCategory::Referral, ChannelSetting::Off);
    fx.facade.upsert_preferences(&pref).await.unwrap();

    let realtime = fx.facade.order_placed("fan@example.com", "o-2", 1.0).await.unwrap();
    let muted = fx
        .facade
        .payment_confirmed("fan@example.com", "o-2", 1.0)
        .await
        .unwrap();
    let off = fx
        .facade
        .referral_reward_earned("fan@example.com", 5.0, "小张")
        .await
        .unwrap();

    assert_eq!(realtime.sent_immediately, 1);
    assert_eq!(muted.suppressed, 1);
    assert_eq!(off.suppressed, 1);
    // 被屏蔽的通知仍然落库，只是不投递
    assert_eq!(fx.notifications.count(), 4);
}

#[tokio::test]
async fn test_delivery_follows_notification_category_not_event_name() {
    let fx = fixture();
    let mut pref = preference("buyer@example.com");
    pref.channel_preferences
        .insert(NotificationCategory::System, ChannelSetting::Off);
    fx.facade.upsert_preferences(&pref).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = fx
        .facade
        .engine()
        .on(
            DELIVERY_EVENT,
            handler_fn("capture", move |event| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event);
                    Ok(())
                }
            }),
        )
        .unwrap();

    let content = NewNotification::new("订单已发货", "订单 o-9 已发货").with_priority(Priority::Urgent);
    let outcome = fx
        .facade
        .notify_user("buyer@example.com", "order_shipped", content)
        .await
        .unwrap();
    assert_eq!(outcome.sent_immediately, 1);

    let delivered = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("order notification should be delivered")
        .unwrap();
    assert_eq!(delivered.payload_str("type"), Some("order_shipped"));
}

// ==================== 已读 ====================

#[tokio::test]
async fn test_mark_as_read() {
    let fx = fixture();
    fx.facade.order_placed("buyer@example.com", "o-1", 1.0).await.unwrap();
    let second = fx.facade.order_placed("buyer@example.com", "o-2", 1.0).await.unwrap();
    fx.facade.order_placed("other@example.com", "o-3", 1.0).await.unwrap();

    let read = fx
        .facade
        .mark_as_read(ActorType::Client, &second.records[0].id)
        .await
        .unwrap();
    assert!(read.is_read);

    let updated = fx
        .facade
        .mark_all_as_read(ActorType::Client, "buyer@example.com", None)
        .await
        .unwrap();
    assert_eq!(updated, 1);

    let unread = fx
        .facade
        .list_notifications(
            ActorType::Client,
            &NotificationQuery {
                recipient_email: Some("buyer@example.com".to_string()),
                unread_only: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(unread.is_empty());
}
