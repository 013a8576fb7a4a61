//! 分层事件队列
//!
//! 非紧急事件按优先级放入 high / normal / low 三层缓冲，每层由独立的 tokio 任务
//! 定时刷新（默认 100ms / 1s / 5s）。刷新任务在首次入队时惰性启动，且只启动一次。
//!
//! 每次刷新最多取出 `batch_size` 个事件并发执行，单个事件失败不影响同批其他事件。
//! urgent / critical 事件不进入队列，在入队调用中同步执行完毕。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use notify_shared::config::QueueConfig;
use notify_shared::observability::metrics;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::dispatch::run_handlers;
use crate::error::{EngineError, Result};
use crate::events::EventEnvelope;
use crate::models::Priority;
use crate::registry::EventRegistry;
use crate::tracker::{EventTracker, TrackedOutcome};

/// 队列层级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueTier {
    High,
    Normal,
    Low,
}

impl QueueTier {
    pub const ALL: [QueueTier; 3] = [Self::High, Self::Normal, Self::Low];

    /// 优先级对应的层级；urgent 及以上不排队，返回 None
    pub fn for_priority(priority: Priority) -> Option<Self> {
        match priority {
            Priority::Low => Some(Self::Low),
            Priority::Normal => Some(Self::Normal),
            Priority::High => Some(Self::High),
            Priority::Urgent | Priority::Critical => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    fn index(&self) -> usize {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }

    fn interval(&self, config: &QueueConfig) -> Duration {
        let ms = match self {
            Self::High => config.high_interval_ms,
            Self::Normal => config.normal_interval_ms,
            Self::Low => config.low_interval_ms,
        };
        Duration::from_millis(ms.max(1))
    }
}

/// 等待批量投递的事件
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub envelope: EventEnvelope,
    pub tier: QueueTier,
    pub enqueued_at: DateTime<Utc>,
}

/// 入队结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// 已进入缓冲，depth 为入队后的层级积压
    Queued { tier: QueueTier, depth: usize },
    /// urgent 事件已同步执行，handlers 为实际执行的处理器数
    Processed { handlers: usize },
}

/// 一次刷新的结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchOutcome {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// (事件名, 错误信息)
    pub errors: Vec<(String, String)>,
}

/// 各层积压
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub started: bool,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.high + self.normal + self.low
    }
}

struct QueueInner {
    registry: EventRegistry,
    config: QueueConfig,
    handler_timeout: Option<Duration>,
    /// 批次中每个事件的最终结果写入追踪器
    tracker: Option<EventTracker>,
    buffers: [Mutex<VecDeque<QueueItem>>; 3],
    started: AtomicBool,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

/// 分层事件队列
#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<QueueInner>,
}

impl EventQueue {
    pub fn new(registry: EventRegistry, config: QueueConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(QueueInner {
                registry,
                config,
                handler_timeout: None,
                tracker: None,
                buffers: Default::default(),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                shutdown_tx,
            }),
        }
    }

    /// 设置处理器超时，需在队列被共享前调用
    pub fn with_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.handler_timeout = timeout;
        } else {
            warn!("事件队列已被共享，处理器超时设置未生效");
        }
        self
    }

    /// 设置追踪器，需在队列被共享前调用
    pub fn with_tracker(mut self, tracker: EventTracker) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.tracker = Some(tracker);
        } else {
            warn!("事件队列已被共享，追踪器设置未生效");
        }
        self
    }

    /// 入队
    ///
    /// urgent / critical 事件在此同步执行全部处理器，错误直接返回给调用方
    pub async fn enqueue(&self, envelope: EventEnvelope) -> Result<EnqueueOutcome> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(EngineError::QueueClosed);
        }

        let Some(tier) = QueueTier::for_priority(envelope.priority) else {
            debug!(event = %envelope.event_name, priority = %envelope.priority, "紧急事件同步执行");
            let handlers =
                run_handlers(&self.inner.registry, &envelope, self.inner.handler_timeout).await?;
            return Ok(EnqueueOutcome::Processed { handlers });
        };

        let depth = {
            let mut buffer = self.inner.buffers[tier.index()].lock();
            if buffer.len() >= self.inner.config.max_depth {
                return Err(EngineError::QueueFull {
                    tier: tier.as_str().to_string(),
                });
            }
            buffer.push_back(QueueItem {
                envelope,
                tier,
                enqueued_at: Utc::now(),
            });
            buffer.len()
        };
        metrics::set_queue_depth(tier.as_str(), depth);

        self.ensure_started();
        Ok(EnqueueOutcome::Queued { tier, depth })
    }

    /// 启动三层刷新任务，重复调用无副作用
    fn ensure_started(&self) {
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        for tier in QueueTier::ALL {
            spawn_flusher(Arc::downgrade(&self.inner), tier, self.inner.shutdown_tx.subscribe());
        }
        info!(
            high_ms = self.inner.config.high_interval_ms,
            normal_ms = self.inner.config.normal_interval_ms,
            low_ms = self.inner.config.low_interval_ms,
            "事件队列刷新任务已启动"
        );
    }

    /// 执行一次指定层级的刷新
    pub async fn process_tier(&self, tier: QueueTier) -> BatchOutcome {
        process_batch(&self.inner, tier).await
    }

    pub fn stats(&self) -> QueueStats {
        let depth = |tier: QueueTier| self.inner.buffers[tier.index()].lock().len();
        QueueStats {
            high: depth(QueueTier::High),
            normal: depth(QueueTier::Normal),
            low: depth(QueueTier::Low),
            started: self.inner.started.load(Ordering::Acquire),
        }
    }

    /// 丢弃所有待处理事件（不执行），返回丢弃数
    pub fn clear(&self) -> usize {
        let mut dropped = 0;
        for tier in QueueTier::ALL {
            let mut buffer = self.inner.buffers[tier.index()].lock();
            dropped += buffer.len();
            buffer.clear();
            metrics::set_queue_depth(tier.as_str(), 0);
        }
        if dropped > 0 {
            warn!(dropped, "事件队列已清空，未处理事件被丢弃");
        }
        dropped
    }

    /// 停止刷新任务并拒绝后续入队
    ///
    /// `drain` 为 true 时先把剩余事件全部执行完
    pub async fn shutdown(&self, drain: bool) -> BatchOutcome {
        self.inner.closed.store(true, Ordering::Release);
        let _ = self.inner.shutdown_tx.send(true);

        let mut total = BatchOutcome::default();
        if drain {
            for tier in QueueTier::ALL {
                loop {
                    let outcome = process_batch(&self.inner, tier).await;
                    if outcome.processed == 0 {
                        break;
                    }
                    total.merge(outcome);
                }
            }
        }
        info!(drained = total.processed, failed = total.failed, "事件队列已关闭");
        total
    }
}

impl BatchOutcome {
    fn merge(&mut self, other: BatchOutcome) {
        self.processed += other.processed;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.errors.extend(other.errors);
    }
}

fn spawn_flusher(inner: Weak<QueueInner>, tier: QueueTier, mut shutdown_rx: watch::Receiver<bool>) {
    let Some(period) = inner.upgrade().map(|i| tier.interval(&i.config)) else {
        return;
    };

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 跳过 interval 的首次立即触发
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(inner) = inner.upgrade() else { break };
                    process_batch(&inner, tier).await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(tier = tier.as_str(), "事件队列刷新任务已退出");
    });
}

async fn process_batch(inner: &QueueInner, tier: QueueTier) -> BatchOutcome {
    let (batch, remaining): (Vec<QueueItem>, usize) = {
        let mut buffer = inner.buffers[tier.index()].lock();
        let take = buffer.len().min(inner.config.batch_size.max(1));
        (buffer.drain(..take).collect(), buffer.len())
    };

    if batch.is_empty() {
        return BatchOutcome::default();
    }
    metrics::set_queue_depth(tier.as_str(), remaining);

    let results = join_all(batch.iter().map(|item| async {
        let started = std::time::Instant::now();
        let result = run_handlers(&inner.registry, &item.envelope, inner.handler_timeout).await;
        let event_name = item.envelope.event_name.as_str();
        let elapsed = started.elapsed();
        match (&inner.tracker, &result) {
            (Some(tracker), Ok(_)) => tracker.record(event_name, TrackedOutcome::Success, elapsed),
            (Some(tracker), Err(e)) => tracker.record_failure(event_name, &e.to_string(), elapsed),
            (None, Ok(_)) => metrics::record_event(event_name, "success", elapsed.as_secs_f64()),
            (None, Err(_)) => metrics::record_event(event_name, "failure", elapsed.as_secs_f64()),
        }
        result
    }))
    .await;

    let mut outcome = BatchOutcome {
        processed: batch.len(),
        ..Default::default()
    };
    for (item, result) in batch.iter().zip(results) {
        match result {
            Ok(_) => outcome.succeeded += 1,
            Err(e) => {
                outcome.failed += 1;
                outcome.errors.push((item.envelope.event_name.clone(), e.to_string()));
            }
        }
    }

    if outcome.failed > 0 {
        warn!(
            tier = tier.as_str(),
            processed = outcome.processed,
            failed = outcome.failed,
            remaining,
            "队列批次存在失败事件"
        );
    } else {
        debug!(tier = tier.as_str(), processed = outcome.processed, remaining, "队列批次处理完成");
    }
    outcome
}
