//! 校验阶段
//!
//! 按事件名查找载荷 schema，校验失败只记录警告，不阻断投递。
//! 没有 schema 的事件直接放行。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use super::{Decision, EventContext, Middleware};
use crate::error::Result;
use crate::events::EventKind;

/// 事件载荷 schema
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventSchema {
    pub required_fields: Vec<String>,
}

impl EventSchema {
    pub fn required(fields: &[&str]) -> Self {
        Self {
            required_fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }
}

/// schema 查询
#[cfg_attr(test, mockall::automock)]
pub trait SchemaRegistry: Send + Sync {
    fn get_schema(&self, event_name: &str) -> Option<EventSchema>;

    /// 返回警告列表；没有 schema 时为空
    fn validate_payload(&self, event_name: &str, payload: &Value) -> Vec<String>;
}

/// 内存 schema 表
#[derive(Debug, Clone, Default)]
pub struct StaticSchemaRegistry {
    schemas: HashMap<String, EventSchema>,
}

impl StaticSchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置业务事件的必填字段
    pub fn with_defaults() -> Self {
        Self::new()
            .with_schema(EventKind::OrderCreated, EventSchema::required(&["orderId", "userEmail"]))
            .with_schema(
                EventKind::OrderStatusChanged,
                EventSchema::required(&["orderId", "userEmail", "status"]),
            )
            .with_schema(EventKind::OrderCancelled, EventSchema::required(&["orderId", "userEmail"]))
            .with_schema(
                EventKind::PaymentConfirmed,
                EventSchema::required(&["orderId", "userEmail", "amount"]),
            )
            .with_schema(EventKind::PaymentFailed, EventSchema::required(&["orderId", "userEmail"]))
            .with_schema(
                EventKind::ReferralRewardEarned,
                EventSchema::required(&["userEmail", "amount"]),
            )
            .with_schema(
                EventKind::InventoryLowStock,
                EventSchema::required(&["productId", "stock"]),
            )
            .with_schema(EventKind::ReviewCreated, EventSchema::required(&["productId", "rating"]))
    }

    pub fn with_schema(mut self, event: impl AsRef<str>, schema: EventSchema) -> Self {
        self.schemas.insert(event.as_ref().to_string(), schema);
        self
    }
}

impl SchemaRegistry for StaticSchemaRegistry {
    fn get_schema(&self, event_name: &str) -> Option<EventSchema> {
        self.schemas.get(event_name).cloned()
    }

    fn validate_payload(&self, event_name: &str, payload: &Value) -> Vec<String> {
        let Some(schema) = self.schemas.get(event_name) else {
            return Vec::new();
        };
        let Some(object) = payload.as_object() else {
            return vec!["载荷不是 JSON 对象".to_string()];
        };

        schema
            .required_fields
            .iter()
            .filter(|field| object.get(field.as_str()).is_none_or(Value::is_null))
            .map(|field| format!("缺少必填字段: {field}"))
            .collect()
    }
}

pub struct ValidationMiddleware {
    schemas: Arc<dyn SchemaRegistry>,
}

impl ValidationMiddleware {
    pub fn new(schemas: Arc<dyn SchemaRegistry>) -> Self {
        Self { schemas }
    }
}

#[async_trait]
impl Middleware for ValidationMiddleware {
    fn name(&self) -> &str {
        "validation"
    }

    async fn before(&self, ctx: &mut EventContext) -> Result<Decision> {
        let warnings = self
            .schemas
            .validate_payload(&ctx.envelope.event_name, &ctx.envelope.payload);
        if !warnings.is_empty() {
            warn!(event = %ctx.event_name(), warnings = ?warnings, "事件载荷校验未通过，继续投递");
            ctx.warnings.extend(warnings);
        }
        Ok(Decision::Continue)
    }
}
