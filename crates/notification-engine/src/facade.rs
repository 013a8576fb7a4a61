//! 通知服务门面
//!
//! 在引擎之上组合摘要决策，并提供常见业务事件的便捷方法。
//! 需要立即投递的通知以 [`DELIVERY_EVENT`] 事件异步发出，
//! 推送和邮件渠道通过订阅该事件接入。

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::digest::{DigestDecision, DigestService};
use crate::engine::{CreateRequest, EmitOptions, NotificationEngine, Recipients};
use crate::error::Result;
use crate::models::{
    ActorType, NewNotification, NotificationQuery, NotificationRecord, PreferenceRecord, Priority,
};

/// 立即投递事件名
pub const DELIVERY_EVENT: &str = "notification.deliver";

/// 一次 notify 调用的结果
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyOutcome {
    pub records: Vec<NotificationRecord>,
    pub sent_immediately: usize,
    pub digested: usize,
    pub suppressed: usize,
}

impl NotifyOutcome {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

pub struct NotificationServiceFacade {
    engine: Arc<NotificationEngine>,
    digests: Arc<DigestService>,
}

impl NotificationServiceFacade {
    pub fn new(engine: Arc<NotificationEngine>, digests: Arc<DigestService>) -> Self {
        Self { engine, digests }
    }

    pub fn engine(&self) -> &Arc<NotificationEngine> {
        &self.engine
    }

    /// 通知单个用户
    #[instrument(skip(self, content))]
    pub async fn notify_user(
        &self,
        user_email: &str,
        notification_type: &str,
        content: NewNotification,
    ) -> Result<NotifyOutcome> {
        let request = CreateRequest::new(ActorType::Client, notification_type, user_email, content);
        self.notify(request).await
    }

    /// 通知全部管理员
    #[instrument(skip(self, content))]
    pub async fn notify_admin(&self, notification_type: &str, content: NewNotification) -> Result<NotifyOutcome> {
        let request = CreateRequest::new(ActorType::Admin, notification_type, Recipients::Broadcast, content);
        self.notify(request).await
    }

    /// 通知租户；未指定接收人时按租户解析
    #[instrument(skip(self, content))]
    pub async fn notify_tenant(
        &self,
        tenant_id: &str,
        recipient: Option<String>,
        notification_type: &str,
        content: NewNotification,
    ) -> Result<NotifyOutcome> {
        let request = CreateRequest::new(ActorType::Tenant, notification_type, recipient, content)
            .with_tenant(tenant_id);
        self.notify(request).await
    }

    async fn notify(&self, request: CreateRequest) -> Result<NotifyOutcome> {
        let records = self.engine.create(request).await?;
        let mut outcome = NotifyOutcome::default();

        for record in &records {
            let decision = self
                .digests
                .process_notification(record)
                .await
                .unwrap_or_else(|e| {
                    warn!(notification_id = %record.id, error = %e, "摘要判断失败，改为立即投递");
                    DigestDecision::SendImmediately
                });

            match decision {
                DigestDecision::SendImmediately => {
                    outcome.sent_immediately += 1;
                    self.dispatch(record);
                }
                DigestDecision::Digested { digest_id } => {
                    outcome.digested += 1;
                    debug!(notification_id = %record.id, digest_id = %digest_id, "通知进入摘要");
                }
                DigestDecision::Suppressed { reason } => {
                    outcome.suppressed += 1;
                    debug!(notification_id = %record.id, reason = %reason, "通知按偏好不投递");
                }
            }
        }

        outcome.records = records;
        Ok(outcome)
    }

    /// 不等待投递结果
    fn dispatch(&self, record: &NotificationRecord) {
        let payload = match serde_json::to_value(record) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(notification_id = %record.id, error = %e, "通知序列化失败，跳过投递");
                return;
            }
        };
        let engine = self.engine.clone();
        let options = EmitOptions::default()
            .with_priority(record.priority)
            .queued();
        let notification_id = record.id.clone();

        tokio::spawn(async move {
            let result = engine.emit(DELIVERY_EVENT, payload, options).await;
            if let Some(error) = result.error {
                warn!(notification_id = %notification_id, error = %error, "通知投递失败");
            }
        });
    }

    // ---------------------------------------------------------------------
    // 业务便捷方法
    // ---------------------------------------------------------------------

    pub async fn order_placed(&self, user_email: &str, order_id: &str, total: f64) -> Result<NotifyOutcome> {
        let content = NewNotification::new("下单成功", format!("订单 {order_id} 已创建，金额 {total:.2}"))
            .with_related_entity("order", order_id)
            .with_link(format!("/orders/{order_id}"));
        self.notify_user(user_email, "order_placed", content).await
    }

    pub async fn order_status_changed(&self, user_email: &str, order_id: &str, status: &str) -> Result<NotifyOutcome> {
        let (notification_type, priority) = match status {
            "cancelled" => ("order_cancelled", Priority::High),
            "shipped" => ("order_shipped", Priority::Normal),
            "delivered" => ("order_delivered", Priority::Normal),
            _ => ("order_status_changed", Priority::Normal),
        };
        let content = NewNotification::new("订单状态更新", format!("订单 {order_id} 状态变更为 {status}"))
            .with_priority(priority)
            .with_related_entity("order", order_id)
            .with_metadata(serde_json::json!({ "status": status }))
            .with_link(format!("/orders/{order_id}"));
        self.notify_user(user_email, notification_type, content).await
    }

    pub async fn payment_confirmed(&self, user_email: &str, order_id: &str, amount: f64) -> Result<NotifyOutcome> {
        let content = NewNotification::new("支付成功", format!("订单 {order_id} 已支付 {amount:.2}"))
            .with_related_entity("order", order_id);
        self.notify_user(user_email, "payment_confirmed", content).await
    }

    pub async fn payment_failed(&self, user_email: &str, order_id: &str, reason: &str) -> Result<NotifyOutcome> {
        let content = NewNotification::new("支付失败", format!("订单 {order_id} 支付失败：{reason}"))
            .with_priority(Priority::Urgent)
            .with_related_entity("order", order_id)
            .with_link(format!("/orders/{order_id}/pay"))
            .requiring_action();
        self.notify_user(user_email, "payment_failed", content).await
    }

    pub async fn referral_reward_earned(
        &self,
        user_email: &str,
        amount: f64,
        referred_name: &str,
    ) -> Result<NotifyOutcome> {
        let content = NewNotification::new("获得邀请奖励", format!("{referred_name} 完成首单，你获得 {amount:.2} 奖励"))
            .with_actor_name(referred_name);
        self.notify_user(user_email, "referral_reward_earned", content).await
    }

    /// 库存告警（管理员广播）
    pub async fn low_stock_alert(&self, product_id: &str, product_name: &str, stock: u32) -> Result<NotifyOutcome> {
        let content = NewNotification::new("库存告警", format!("{product_name} 仅剩 {stock} 件"))
            .with_priority(Priority::High)
            .with_related_entity("product", product_id)
            .with_metadata(serde_json::json!({ "stock": stock }))
            .requiring_action();
        self.notify_admin("low_stock", content).await
    }

    /// 新评价（通知租户）
    pub async fn new_review(
        &self,
        tenant_id: &str,
        product_id: &str,
        rating: u8,
        reviewer: &str,
    ) -> Result<NotifyOutcome> {
        let content = NewNotification::new("收到新评价", format!("{reviewer} 给出了 {rating} 星评价"))
            .with_related_entity("product", product_id)
            .with_actor_name(reviewer)
            .with_metadata(serde_json::json!({ "rating": rating }));
        self.notify_tenant(tenant_id, None, "new_review", content).await
    }

    pub async fn mark_as_read(&self, actor: ActorType, notification_id: &str) -> Result<NotificationRecord> {
        self.engine.repository(actor)?.mark_as_read(notification_id).await
    }

    pub async fn mark_all_as_read(
        &self,
        actor: ActorType,
        recipient_email: &str,
        tenant_id: Option<String>,
    ) -> Result<usize> {
        self.engine
            .repository(actor)?
            .mark_all_as_read(recipient_email, tenant_id)
            .await
    }

    pub async fn list_notifications(
        &self,
        actor: ActorType,
        query: &NotificationQuery,
    ) -> Result<Vec<NotificationRecord>> {
        self.engine.repository(actor)?.list(query).await
    }

    /// 更新偏好并使缓存失效
    pub async fn upsert_preferences(&self, preference: &PreferenceRecord) -> Result<PreferenceRecord> {
        self.engine.preferences().upsert(preference).await
    }
}
