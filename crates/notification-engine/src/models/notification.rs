//! 通知记录定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ActorType, NotificationCategory, Priority};

/// 通知关联的业务实体
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedEntity {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub id: String,
}

impl RelatedEntity {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// 去重和日志中使用的实体键
    pub fn key(&self) -> String {
        format!("{}:{}", self.entity_type, self.id)
    }
}

/// 通知记录
///
/// 每个（接收人, 通知）对应一条记录；`recipient_email` 为空表示广播。
/// 创建后只有已读和处理状态可以变化。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: String,
    pub actor_type: ActorType,
    pub recipient_email: Option<String>,
    pub tenant_id: Option<String>,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub title: String,
    pub message: String,
    pub priority: Priority,
    pub requires_action: bool,
    pub related_entity: Option<RelatedEntity>,
    pub metadata: serde_json::Value,
    /// 触发者展示名（如下单的买家）
    pub actor_name: Option<String>,
    pub link: Option<String>,
    /// 路由信息原样透传，供展示层决定跳转
    pub routing: Option<serde_json::Value>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub action_taken_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl NotificationRecord {
    pub fn new(
        actor_type: ActorType,
        recipient_email: Option<String>,
        notification_type: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            actor_type,
            recipient_email,
            tenant_id: None,
            notification_type: notification_type.into(),
            title: title.into(),
            message: message.into(),
            priority: actor_type.default_priority(),
            requires_action: false,
            related_entity: None,
            metadata: serde_json::Value::Object(Default::default()),
            actor_name: None,
            link: None,
            routing: None,
            is_read: false,
            read_at: None,
            action_taken_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_related_entity(mut self, entity: RelatedEntity) -> Self {
        self.related_entity = Some(entity);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn requiring_action(mut self) -> Self {
        self.requires_action = true;
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient_email.is_none()
    }

    pub fn category(&self) -> NotificationCategory {
        NotificationCategory::from_type(&self.notification_type)
    }
}

/// 待创建通知的内容
///
/// 未指定优先级时按 actor 默认值
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewNotification {
    pub title: String,
    pub message: String,
    pub priority: Option<Priority>,
    pub requires_action: bool,
    pub related_entity: Option<RelatedEntity>,
    pub metadata: Option<serde_json::Value>,
    pub actor_name: Option<String>,
    pub link: Option<String>,
}

impl NewNotification {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_related_entity(mut self, entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        self.related_entity = Some(RelatedEntity::new(entity_type, id));
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_actor_name(mut self, name: impl Into<String>) -> Self {
        self.actor_name = Some(name.into());
        self
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn requiring_action(mut self) -> Self {
        self.requires_action = true;
        self
    }

    /// 为单个接收人生成记录
    pub fn to_record(
        &self,
        actor_type: ActorType,
        recipient_email: Option<String>,
        notification_type: &str,
    ) -> NotificationRecord {
        let mut record = NotificationRecord::new(
            actor_type,
            recipient_email,
            notification_type,
            self.title.clone(),
            self.message.clone(),
        );
        if let Some(priority) = self.priority {
            record.priority = priority;
        }
        record.requires_action = self.requires_action;
        record.related_entity = self.related_entity.clone();
        if let Some(metadata) = &self.metadata {
            record.metadata = metadata.clone();
        }
        record.actor_name = self.actor_name.clone();
        record.link = self.link.clone();
        record
    }
}

/// 通知记录的可变部分
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPatch {
    pub is_read: Option<bool>,
    pub action_taken: Option<bool>,
    pub metadata: Option<serde_json::Value>,
}

impl NotificationPatch {
    pub fn read() -> Self {
        Self {
            is_read: Some(true),
            ..Default::default()
        }
    }

    /// 将补丁应用到记录上
    pub fn apply(&self, record: &mut NotificationRecord, now: DateTime<Utc>) {
        if let Some(is_read) = self.is_read {
            record.is_read = is_read;
            record.read_at = if is_read { Some(now) } else { None };
        }
        if let Some(action_taken) = self.action_taken {
            record.action_taken_at = if action_taken { Some(now) } else { None };
        }
        if let Some(metadata) = &self.metadata {
            record.metadata = metadata.clone();
        }
    }
}

/// 通知列表查询条件
#[derive(Debug, Clone, Default)]
pub struct NotificationQuery {
    /// 接收人；None 时只返回广播记录
    pub recipient_email: Option<String>,
    pub tenant_id: Option<String>,
    /// 是否一并返回广播记录
    pub include_broadcast: bool,
    pub unread_only: bool,
    pub limit: Option<usize>,
}

impl NotificationQuery {
    pub fn for_recipient(email: impl Into<String>) -> Self {
        Self {
            recipient_email: Some(email.into()),
            include_broadcast: true,
            ..Default::default()
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn unread(mut self) -> Self {
        self.unread_only = true;
        self
    }

    pub fn matches(&self, record: &NotificationRecord) -> bool {
        let recipient_ok = match (&record.recipient_email, &self.recipient_email) {
            (Some(r), Some(q)) => r.eq_ignore_ascii_case(q),
            (None, _) => self.include_broadcast || self.recipient_email.is_none(),
            (Some(_), None) => false,
        };
        let tenant_ok = self
            .tenant_id
            .as_ref()
            .is_none_or(|t| record.tenant_id.as_ref() == Some(t));
        recipient_ok && tenant_ok && (!self.unread_only || !record.is_read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_defaults() {
        let record = NotificationRecord::new(
            ActorType::Admin,
            None,
            "low_stock",
            "库存告警",
            "SKU-1 库存不足",
        );

        assert!(record.is_broadcast());
        assert_eq!(record.priority, Priority::High);
        assert!(!record.is_read);
        assert!(record.metadata.is_object());
    }

    #[test]
    fn test_patch_apply() {
        let mut record = NotificationRecord::new(
            ActorType::Client,
            Some("a@example.com".to_string()),
            "order_shipped",
            "t",
            "m",
        );
        let now = Utc::now();

        NotificationPatch::read().apply(&mut record, now);
        assert!(record.is_read);
        assert_eq!(record.read_at, Some(now));

        NotificationPatch {
            action_taken: Some(true),
            ..Default::default()
        }
        .apply(&mut record, now);
        assert_eq!(record.action_taken_at, Some(now));
    }

    #[test]
    fn test_query_matches() {
        let direct = NotificationRecord::new(
            ActorType::Tenant,
            Some("Shop@Example.com".to_string()),
            "new_review",
            "t",
            "m",
        )
        .with_tenant("t-1");
        let broadcast =
            NotificationRecord::new(ActorType::Tenant, None, "policy_update", "t", "m").with_tenant("t-1");

        let query = NotificationQuery::for_recipient("shop@example.com").with_tenant("t-1");
        assert!(query.matches(&direct));
        assert!(query.matches(&broadcast));

        let other_tenant = NotificationQuery::for_recipient("shop@example.com").with_tenant("t-2");
        assert!(!other_tenant.matches(&direct));
    }

    #[test]
    fn test_new_notification_to_record() {
        let content = NewNotification::new("发货通知", "订单已发货")
            .with_related_entity("order", "o-1")
            .with_link("/orders/o-1")
            .requiring_action();

        let record = content.to_record(ActorType::Client, Some("a@example.com".to_string()), "order_shipped");
        assert_eq!(record.priority, Priority::Normal);
        assert!(record.requires_action);
        assert_eq!(record.related_entity.as_ref().map(RelatedEntity::key).as_deref(), Some("order:o-1"));
        assert_eq!(record.link.as_deref(), Some("/orders/o-1"));

        let urgent = content.with_priority(Priority::Urgent).to_record(ActorType::Admin, None, "x");
        assert_eq!(urgent.priority, Priority::Urgent);
    }

    #[test]
    fn test_serde_uses_type_key() {
        let record = NotificationRecord::new(ActorType::Client, None, "order_placed", "t", "m");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "order_placed");
        assert!(json["recipientEmail"].is_null());
    }
}
