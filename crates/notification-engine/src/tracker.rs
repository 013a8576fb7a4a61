//! 事件追踪
//!
//! 记录每个事件名的 emit 结果和耗时，保留最近的错误样本供运维排查。
//! 同时把结果写入 metrics 门面，是否导出由宿主决定。

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify_shared::observability::metrics;
use parking_lot::Mutex;
use serde::Serialize;

/// emit 结果分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackedOutcome {
    Success,
    Failure,
    Skipped,
    Queued,
    NoHandlers,
}

impl TrackedOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Skipped => "skipped",
            Self::Queued => "queued",
            Self::NoHandlers => "no_handlers",
        }
    }
}

/// 单个事件的统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventStats {
    pub success: u64,
    pub failure: u64,
    pub skipped: u64,
    pub queued: u64,
    pub no_handlers: u64,
    /// 只统计实际经过管道的事件（success / failure / skipped）
    pub avg_latency_ms: f64,
    pub max_latency_ms: u64,
    #[serde(skip)]
    latency_samples: u64,
    #[serde(skip)]
    total_latency_ms: u64,
}

impl EventStats {
    pub fn total(&self) -> u64 {
        self.success + self.failure + self.skipped + self.queued + self.no_handlers
    }

    fn record(&mut self, outcome: TrackedOutcome, latency: Duration) {
        match outcome {
            TrackedOutcome::Success => self.success += 1,
            TrackedOutcome::Failure => self.failure += 1,
            TrackedOutcome::Skipped => self.skipped += 1,
            TrackedOutcome::Queued => self.queued += 1,
            TrackedOutcome::NoHandlers => self.no_handlers += 1,
        }

        if matches!(
            outcome,
            TrackedOutcome::Success | TrackedOutcome::Failure | TrackedOutcome::Skipped
        ) {
            let ms = latency.as_millis() as u64;
            self.latency_samples += 1;
            self.total_latency_ms += ms;
            self.max_latency_ms = self.max_latency_ms.max(ms);
            self.avg_latency_ms = self.total_latency_ms as f64 / self.latency_samples as f64;
        }
    }
}

/// 错误样本
#[derive(Debug, Clone, Serialize)]
pub struct ErrorSample {
    pub event_name: String,
    pub error: String,
    pub occurred_at: DateTime<Utc>,
}

/// 追踪快照
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrackerStats {
    pub events: BTreeMap<String, EventStats>,
    pub recent_errors: Vec<ErrorSample>,
}

impl TrackerStats {
    pub fn total(&self) -> u64 {
        self.events.values().map(EventStats::total).sum()
    }

    pub fn failures(&self) -> u64 {
        self.events.values().map(|s| s.failure).sum()
    }
}

#[derive(Default)]
struct TrackerState {
    events: BTreeMap<String, EventStats>,
    errors: VecDeque<ErrorSample>,
}

/// 事件追踪器，克隆共享同一份状态
#[derive(Clone)]
pub struct EventTracker {
    state: Arc<Mutex<TrackerState>>,
    max_error_samples: usize,
}

impl Default for EventTracker {
    fn default() -> Self {
        Self::new(20)
    }
}

impl EventTracker {
    pub fn new(max_error_samples: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(TrackerState::default())),
            max_error_samples,
        }
    }

    pub fn record(&self, event_name: &str, outcome: TrackedOutcome, latency: Duration) {
        self.state
            .lock()
            .events
            .entry(event_name.to_string())
            .or_default()
            .record(outcome, latency);
        metrics::record_event(event_name, outcome.as_str(), latency.as_secs_f64());
    }

    /// 记录失败并保留错误样本
    pub fn record_failure(&self, event_name: &str, error: &str, latency: Duration) {
        self.record(event_name, TrackedOutcome::Failure, latency);

        if self.max_error_samples == 0 {
            return;
        }
        let mut state = self.state.lock();
        if state.errors.len() >= self.max_error_samples {
            state.errors.pop_front();
        }
        state.errors.push_back(ErrorSample {
            event_name: event_name.to_string(),
            error: error.to_string(),
            occurred_at: Utc::now(),
        });
    }

    pub fn event_stats(&self, event_name: &str) -> Option<EventStats> {
        self.state.lock().events.get(event_name).cloned()
    }

    /// 最近错误，最新的在最后
    pub fn recent_errors(&self) -> Vec<ErrorSample> {
        self.state.lock().errors.iter().cloned().collect()
    }

    pub fn stats(&self) -> TrackerStats {
        let state = self.state.lock();
        TrackerStats {
            events: state.events.clone(),
            recent_errors: state.errors.iter().cloned().collect(),
        }
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.events.clear();
        state.errors.clear();
    }
}
