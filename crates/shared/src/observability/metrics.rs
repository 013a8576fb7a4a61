//! 指标记录
//!
//! 基于 metrics crate 的门面宏记录指标。是否导出、导出到哪里由宿主进程安装的
//! recorder 决定，本模块只保证指标命名和标签的一致性。

/// 注册指标描述
///
/// 这些描述会出现在导出端的 HELP 注释中
pub fn describe_metrics(service_name: &str) {
    metrics::describe_counter!(
        "notification_events_total",
        "Total number of emitted notification events by outcome"
    );
    metrics::describe_histogram!(
        "notification_event_duration_seconds",
        "Notification event processing duration in seconds"
    );
    metrics::describe_gauge!(
        "notification_queue_depth",
        "Pending items per notification queue tier"
    );
    metrics::describe_counter!(
        "notification_records_total",
        "Total number of persisted notification records"
    );
    metrics::describe_counter!("notification_digests_total", "Total number of digests by status");

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 记录事件处理结果
#[inline]
pub fn record_event(event_name: &str, outcome: &str, duration_secs: f64) {
    metrics::counter!(
        "notification_events_total",
        "event" => event_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "notification_event_duration_seconds",
        "outcome" => outcome.to_string()
    )
    .record(duration_secs);
}

/// 更新队列积压
#[inline]
pub fn set_queue_depth(tier: &str, depth: usize) {
    metrics::gauge!("notification_queue_depth", "tier" => tier.to_string()).set(depth as f64);
}

/// 记录通知落库
#[inline]
pub fn record_notification_created(actor: &str, count: usize) {
    metrics::counter!("notification_records_total", "actor" => actor.to_string())
        .increment(count as u64);
}

/// 记录摘要发送
#[inline]
pub fn record_digest(status: &str) {
    metrics::counter!("notification_digests_total", "status" => status.to_string()).increment(1);
}
