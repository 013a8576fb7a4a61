//! 摘要发送时间与分组规则
//!
//! 所有函数显式接收 `now`，便于测试。时间均按 UTC 计算。

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Timelike, Utc};

use crate::models::{DigestFrequency, DigestGroup, NotificationCategory, NotificationRecord};

/// 解析 `HH:MM` 格式的发送时间
pub fn parse_digest_time(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").ok()
}

/// 计算下一次发送时间
///
/// - hourly：下一个整点
/// - daily：今天的发送时间，已过则为明天
/// - weekly：下一个指定星期（0 = 周日）的发送时间，今天的时间已过则顺延一周
/// - realtime：立即
pub fn next_send_time(
    frequency: DigestFrequency,
    digest_time: NaiveTime,
    day_of_week: u32,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    match frequency {
        DigestFrequency::Realtime => now,
        DigestFrequency::Hourly => {
            let top_of_hour = now
                .with_minute(0)
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(now);
            top_of_hour + Duration::hours(1)
        }
        DigestFrequency::Daily => {
            let today = at_time(now, digest_time);
            if today > now {
                today
            } else {
                today + Duration::days(1)
            }
        }
        DigestFrequency::Weekly => {
            let current = now.weekday().num_days_from_sunday();
            let days_ahead = (day_of_week % 7 + 7 - current) % 7;
            let candidate = at_time(now, digest_time) + Duration::days(i64::from(days_ahead));
            if candidate > now {
                candidate
            } else {
                candidate + Duration::weeks(1)
            }
        }
    }
}

fn at_time(now: DateTime<Utc>, time: NaiveTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&now.date_naive().and_time(time))
}

/// 按分类分组
///
/// 每组保留前 `sample_limit` 个标题，按数量降序，数量相同按分类顺序
pub fn group_notifications_for_digest(
    records: &[NotificationRecord],
    sample_limit: usize,
) -> Vec<DigestGroup> {
    let mut groups: BTreeMap<NotificationCategory, DigestGroup> = BTreeMap::new();

    for record in records {
        let category = record.category();
        let group = groups.entry(category).or_insert_with(|| DigestGroup {
            category,
            count: 0,
            sample_titles: Vec::new(),
        });
        group.count += 1;
        if group.sample_titles.len() < sample_limit {
            group.sample_titles.push(record.title.clone());
        }
    }

    let mut groups: Vec<DigestGroup> = groups.into_values().collect();
    groups.sort_by(|a, b| b.count.cmp(&a.count));
    groups
}
