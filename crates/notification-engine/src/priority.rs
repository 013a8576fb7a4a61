//! 读侧优先级工具
//!
//! 无状态纯函数：排序、过滤、提醒方式和轮询间隔建议。

use std::time::Duration;

use crate::models::{NotificationRecord, Priority};

/// 任一未读 urgent 及以上时的轮询间隔
pub const URGENT_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// 任一未读 high 时的轮询间隔
pub const HIGH_POLL_INTERVAL: Duration = Duration::from_secs(3);
/// 有未读但都不紧急时的轮询间隔
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// 优先级降序，同优先级新的在前
pub fn sort_by_priority(records: &mut [NotificationRecord]) {
    records.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| b.created_at.cmp(&a.created_at))
    });
}

pub fn filter_by_priority(records: &[NotificationRecord], min: Priority) -> Vec<NotificationRecord> {
    records.iter().filter(|r| r.priority >= min).cloned().collect()
}

/// urgent 及以上
pub fn get_urgent(records: &[NotificationRecord]) -> Vec<NotificationRecord> {
    filter_by_priority(records, Priority::Urgent)
}

/// high 及以上
pub fn get_high_priority(records: &[NotificationRecord]) -> Vec<NotificationRecord> {
    filter_by_priority(records, Priority::High)
}

pub fn should_play_sound(priority: Priority) -> bool {
    matches!(priority, Priority::Urgent | Priority::Critical)
}

pub fn should_show_browser_notification(priority: Priority) -> bool {
    priority >= Priority::High
}

/// 根据未读通知推荐前端轮询间隔，没有未读时返回 `idle`
pub fn get_recommended_polling_interval(records: &[NotificationRecord], idle: Duration) -> Duration {
    let highest_unread = records
        .iter()
        .filter(|r| !r.is_read)
        .map(|r| r.priority)
        .max();

    match highest_unread {
        Some(p) if p >= Priority::Urgent => URGENT_POLL_INTERVAL,
        Some(Priority::High) => HIGH_POLL_INTERVAL,
        Some(_) => DEFAULT_POLL_INTERVAL,
        None => idle,
    }
}
