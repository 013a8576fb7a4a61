//! 摘要记录

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{DigestFrequency, NotificationCategory};

/// failed 摘要的最大发送次数，超过后不再重试
pub const MAX_DIGEST_ATTEMPTS: u32 = 3;

/// 摘要状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestStatus {
    Pending,
    Sent,
    Failed,
}

impl DigestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

/// 摘要中的一个分类分组
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestGroup {
    pub category: NotificationCategory,
    pub count: usize,
    pub sample_titles: Vec<String>,
}

/// 摘要记录
///
/// 同一（用户, 频率）同时最多一条 pending 摘要；发送前 `notification_ids` 只增不减
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestRecord {
    pub id: String,
    pub user_email: String,
    pub frequency: DigestFrequency,
    pub status: DigestStatus,
    pub scheduled_for: DateTime<Utc>,
    pub notification_ids: Vec<String>,
    pub grouped_summary: Vec<DigestGroup>,
    pub error: Option<String>,
    /// 失败次数
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl DigestRecord {
    pub fn pending(
        user_email: impl Into<String>,
        frequency: DigestFrequency,
        scheduled_for: DateTime<Utc>,
        first_notification_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            user_email: user_email.into(),
            frequency,
            status: DigestStatus::Pending,
            scheduled_for,
            notification_ids: vec![first_notification_id.into()],
            grouped_summary: Vec::new(),
            error: None,
            attempts: 0,
            created_at: Utc::now(),
            sent_at: None,
        }
    }

    /// 追加通知 ID，已存在时返回 false
    pub fn push_notification(&mut self, notification_id: &str) -> bool {
        if self.notification_ids.iter().any(|id| id == notification_id) {
            return false;
        }
        self.notification_ids.push(notification_id.to_string());
        true
    }

    /// pending 或尚未用完重试次数的 failed 摘要，且计划时间已到
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let retryable = match self.status {
            DigestStatus::Pending => true,
            DigestStatus::Failed => self.attempts < MAX_DIGEST_ATTEMPTS,
            DigestStatus::Sent => false,
        };
        retryable && self.scheduled_for <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_push_notification_is_unique() {
        let mut digest = DigestRecord::pending("a@example.com", DigestFrequency::Daily, Utc::now(), "n1");
        assert!(digest.push_notification("n2"));
        assert!(!digest.push_notification("n1"));
        assert_eq!(digest.notification_ids, vec!["n1", "n2"]);
    }

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        let mut digest =
            DigestRecord::pending("a@example.com", DigestFrequency::Hourly, now - Duration::minutes(1), "n1");
        assert!(digest.is_due(now));

        digest.status = DigestStatus::Sent;
        assert!(!digest.is_due(now));

        digest.status = DigestStatus::Failed;
        digest.attempts = 1;
        assert!(digest.is_due(now));
        digest.attempts = MAX_DIGEST_ATTEMPTS;
        assert!(!digest.is_due(now));

        let future = DigestRecord::pending("a@example.com", DigestFrequency::Hourly, now + Duration::hours(1), "n1");
        assert!(!future.is_due(now));
    }
}
