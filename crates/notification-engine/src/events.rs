//! 事件名、订阅模式与事件信封
//!
//! 已知业务事件用 [`EventKind`] 枚举表达，编译期即可发现拼写错误；
//! 订阅层仍以字符串为键，以支持 `order.*` 这类通配模式。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::models::{Priority, RelatedEntity};

/// 已知业务事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    OrderCreated,
    OrderStatusChanged,
    OrderShipped,
    OrderDelivered,
    OrderCancelled,
    PaymentConfirmed,
    PaymentFailed,
    PaymentRefunded,
    ReferralRewardEarned,
    ReviewCreated,
    InventoryLowStock,
    UserRegistered,
}

impl EventKind {
    pub const ALL: [EventKind; 12] = [
        Self::OrderCreated,
        Self::OrderStatusChanged,
        Self::OrderShipped,
        Self::OrderDelivered,
        Self::OrderCancelled,
        Self::PaymentConfirmed,
        Self::PaymentFailed,
        Self::PaymentRefunded,
        Self::ReferralRewardEarned,
        Self::ReviewCreated,
        Self::InventoryLowStock,
        Self::UserRegistered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OrderCreated => "order.created",
            Self::OrderStatusChanged => "order.status_changed",
            Self::OrderShipped => "order.shipped",
            Self::OrderDelivered => "order.delivered",
            Self::OrderCancelled => "order.cancelled",
            Self::PaymentConfirmed => "payment.confirmed",
            Self::PaymentFailed => "payment.failed",
            Self::PaymentRefunded => "payment.refunded",
            Self::ReferralRewardEarned => "referral.reward_earned",
            Self::ReviewCreated => "review.created",
            Self::InventoryLowStock => "inventory.low_stock",
            Self::UserRegistered => "user.registered",
        }
    }
}

impl AsRef<str> for EventKind {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| EngineError::InvalidEventPattern {
                pattern: s.to_string(),
                reason: "未知的业务事件".to_string(),
            })
    }
}

/// 订阅模式
///
/// 通配模式在注册时校验并编译，在查找时匹配，
/// 因此后注册的通配订阅对已有的具体事件同样生效。
#[derive(Debug, Clone)]
pub enum EventPattern {
    Exact(String),
    Wildcard { pattern: String, regex: Regex },
}

impl EventPattern {
    /// 解析并校验订阅模式
    ///
    /// 规则：段之间用 `.` 分隔，不能有空段；`*` 只能作为一个完整的段出现且至多一次。
    /// `*` 匹配任意非空后缀（可跨段），单独的 `*` 订阅所有事件。
    pub fn parse(raw: &str) -> Result<Self> {
        let pattern = raw.trim();
        let invalid = |reason: &str| EngineError::InvalidEventPattern {
            pattern: raw.to_string(),
            reason: reason.to_string(),
        };

        if pattern.is_empty() {
            return Err(invalid("事件名不能为空"));
        }
        if pattern.chars().any(char::is_whitespace) {
            return Err(invalid("事件名不能包含空白字符"));
        }

        let segments: Vec<&str> = pattern.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(invalid("事件名不能包含空段"));
        }

        let wildcard_count = segments.iter().filter(|s| s.contains('*')).count();
        match wildcard_count {
            0 => Ok(Self::Exact(pattern.to_string())),
            1 => {
                if segments.iter().any(|s| s.contains('*') && *s != "*") {
                    return Err(invalid("通配符必须独占一个段"));
                }
                let regex_src = segments
                    .iter()
                    .map(|s| if *s == "*" { ".+".to_string() } else { regex::escape(s) })
                    .collect::<Vec<_>>()
                    .join(r"\.");
                let regex = Regex::new(&format!("^{regex_src}$"))
                    .map_err(|e| invalid(&e.to_string()))?;
                Ok(Self::Wildcard {
                    pattern: pattern.to_string(),
                    regex,
                })
            }
            _ => Err(invalid("只允许一个通配段")),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Exact(name) => name,
            Self::Wildcard { pattern, .. } => pattern,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Wildcard { .. })
    }

    pub fn matches(&self, event_name: &str) -> bool {
        match self {
            Self::Exact(name) => name == event_name,
            Self::Wildcard { regex, .. } => regex.is_match(event_name),
        }
    }
}

/// 事件信封
///
/// 处理器收到的只读事件视图
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_name: String,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub emitted_at: DateTime<Utc>,
    /// 接收人；None 表示广播
    pub recipient: Option<String>,
}

impl EventEnvelope {
    pub fn new(event_name: impl Into<String>, payload: serde_json::Value, priority: Priority) -> Self {
        let recipient = recipient_from_payload(&payload);
        Self {
            event_name: event_name.into(),
            payload,
            priority,
            emitted_at: Utc::now(),
            recipient,
        }
    }

    /// 载荷中的关联实体
    pub fn related_entity(&self) -> Option<RelatedEntity> {
        related_entity_from_payload(&self.payload)
    }

    /// 去重使用的实体键
    ///
    /// 优先使用 relatedEntity，其次 entityType/entityId，都没有时退化为载荷全文
    pub fn entity_key(&self) -> String {
        match self.related_entity() {
            Some(entity) => entity.key(),
            None => self.payload.to_string(),
        }
    }

    /// 载荷中的字符串字段
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}

/// 从载荷中解析接收人
pub fn recipient_from_payload(payload: &serde_json::Value) -> Option<String> {
    ["recipientEmail", "userEmail", "email", "recipient"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(|v| v.as_str()))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// 从载荷中解析关联实体
pub fn related_entity_from_payload(payload: &serde_json::Value) -> Option<RelatedEntity> {
    let id_str = |v: &serde_json::Value| match v {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    };

    if let Some(entity) = payload.get("relatedEntity") {
        let entity_type = entity.get("type").and_then(|v| v.as_str());
        let id = entity.get("id").and_then(id_str);
        if let (Some(entity_type), Some(id)) = (entity_type, id) {
            return Some(RelatedEntity::new(entity_type, id));
        }
    }

    let entity_type = payload.get("entityType").and_then(|v| v.as_str())?;
    let id = payload.get("entityId").and_then(id_str)?;
    Some(RelatedEntity::new(entity_type, id))
}
