//! 用户投递偏好

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use super::NotificationCategory;

/// 摘要频率
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestFrequency {
    Realtime,
    Hourly,
    Daily,
    Weekly,
}

impl DigestFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Realtime => "realtime",
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
        }
    }
}

impl fmt::Display for DigestFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 分类级投递方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelSetting {
    Realtime,
    Digest,
    Off,
}

/// 用户偏好记录
///
/// 没有记录的用户使用 [`PreferenceRecord::defaults`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferenceRecord {
    pub user_email: String,
    pub digest_enabled: bool,
    pub frequency: DigestFrequency,
    /// 发送时间（UTC）
    pub digest_time: NaiveTime,
    /// 0 = 周日
    pub day_of_week: u32,
    pub channel_preferences: HashMap<NotificationCategory, ChannelSetting>,
    /// 完全屏蔽的通知类型或事件名
    pub muted_types: Vec<String>,
    /// 是否接收摘要邮件
    pub email_digest: bool,
    pub updated_at: DateTime<Utc>,
}

impl PreferenceRecord {
    /// 系统默认偏好：每日摘要，关键通知由调用方单独放行
    pub fn defaults(user_email: impl Into<String>, digest_time: NaiveTime, day_of_week: u32) -> Self {
        Self {
            user_email: user_email.into(),
            digest_enabled: true,
            frequency: DigestFrequency::Daily,
            digest_time,
            day_of_week,
            channel_preferences: HashMap::new(),
            muted_types: Vec::new(),
            email_digest: true,
            updated_at: Utc::now(),
        }
    }

    /// 分类的投递方式；未单独设置时跟随全局摘要开关
    pub fn channel_for(&self, category: NotificationCategory) -> ChannelSetting {
        self.channel_preferences
            .get(&category)
            .copied()
            .unwrap_or(if self.digest_enabled {
                ChannelSetting::Digest
            } else {
                ChannelSetting::Realtime
            })
    }

    pub fn is_category_disabled(&self, category: NotificationCategory) -> bool {
        self.channel_preferences.get(&category) == Some(&ChannelSetting::Off)
    }

    /// 同时匹配 `order_shipped` 和 `order.shipped` 写法
    pub fn is_muted(&self, notification_type: &str) -> bool {
        let normalized = notification_type.replace('.', "_");
        self.muted_types
            .iter()
            .any(|m| m == notification_type || m.replace('.', "_") == normalized)
    }

    /// 是否应绕过摘要直接投递
    pub fn wants_realtime(&self, category: NotificationCategory) -> bool {
        !self.digest_enabled
            || self.frequency == DigestFrequency::Realtime
            || self.channel_for(category) == ChannelSetting::Realtime
    }
}
