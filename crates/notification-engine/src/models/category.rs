//! 通知分类
//!
//! 固定的分类体系，用于偏好设置（按分类开关）和摘要分组。

use std::fmt;

use serde::{Deserialize, Serialize};

/// 通知分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationCategory {
    Orders,
    Payments,
    Social,
    Gifts,
    Reviews,
    Referral,
    Community,
    System,
}

impl NotificationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orders => "orders",
            Self::Payments => "payments",
            Self::Social => "social",
            Self::Gifts => "gifts",
            Self::Reviews => "reviews",
            Self::Referral => "referral",
            Self::Community => "community",
            Self::System => "system",
        }
    }

    /// 摘要邮件中的分组标题
    pub fn label(&self) -> &'static str {
        match self {
            Self::Orders => "订单动态",
            Self::Payments => "支付与退款",
            Self::Social => "社交互动",
            Self::Gifts => "礼物",
            Self::Reviews => "评价",
            Self::Referral => "邀请奖励",
            Self::Community => "社区",
            Self::System => "系统消息",
        }
    }

    /// 根据通知类型或事件名归类
    ///
    /// 同时接受 `order_shipped` 和 `order.shipped` 两种写法；无法识别的归入 system
    pub fn from_type(notification_type: &str) -> Self {
        let normalized = notification_type.to_ascii_lowercase().replace('.', "_");
        let has = |keys: &[&str]| keys.iter().any(|k| normalized.contains(k));

        // 先判断 referral，避免 "referral_order" 被归到订单
        if has(&["referral", "invite"]) {
            Self::Referral
        } else if has(&["payment", "refund", "payout", "invoice", "wallet"]) {
            Self::Payments
        } else if has(&["order", "shipment", "delivery", "cart"]) {
            Self::Orders
        } else if has(&["gift"]) {
            Self::Gifts
        } else if has(&["review", "rating"]) {
            Self::Reviews
        } else if has(&["follow", "like", "comment", "mention", "message", "social"]) {
            Self::Social
        } else if has(&["community", "group", "forum", "post", "harvest", "event"]) {
            Self::Community
        } else {
            Self::System
        }
    }
}

impl fmt::Display for NotificationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
