//! 摘要服务
//!
//! 决定每条通知立即投递还是合并进用户的待发摘要，并负责到期摘要的发送。
//!
//! 同一（用户, 频率）的摘要写入通过进程内互斥锁串行化，
//! 保证任意时刻最多只有一条 pending 摘要；发送同样持有该锁，
//! 追加不会落在已读出但尚未标记为 sent 的摘要上。

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, NaiveTime, Utc};
use dashmap::DashMap;
use notify_shared::config::DigestConfig;
use notify_shared::observability::metrics;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use super::schedule::{group_notifications_for_digest, next_send_time, parse_digest_time};
use crate::error::{EngineError, Result};
use crate::middleware::PreferenceCache;
use crate::models::{
    DigestFrequency, DigestGroup, DigestRecord, DigestStatus, MAX_DIGEST_ATTEMPTS, NotificationRecord,
    PreferenceRecord,
};
use crate::repository::{DigestMailer, DigestRepository, NotificationRepository};

/// 锁表超过该数量时顺带清理空闲锁
const LOCK_PRUNE_THRESHOLD: usize = 10_000;

/// 单条通知的摘要决策
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DigestDecision {
    SendImmediately,
    /// 用户屏蔽或关闭了该分类
    Suppressed { reason: String },
    Digested { digest_id: String },
}

/// 单个摘要的发送结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestSendResult {
    pub digest_id: String,
    pub status: DigestStatus,
    pub groups: Vec<DigestGroup>,
    pub emailed: bool,
    pub error: Option<String>,
}

/// 批量发送汇总
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DigestBatchReport {
    pub processed: usize,
    pub sent: usize,
    pub failed: usize,
}

pub struct DigestService {
    notifications: Arc<dyn NotificationRepository>,
    digests: Arc<dyn DigestRepository>,
    preferences: PreferenceCache,
    mailer: Arc<dyn DigestMailer>,
    /// 下划线形式
    critical_types: HashSet<String>,
    default_time: NaiveTime,
    default_day_of_week: u32,
    sample_titles: usize,
    locks: DashMap<(String, DigestFrequency), Arc<Mutex<()>>>,
}

impl DigestService {
    pub fn new(
        config: &DigestConfig,
        critical_types: &[String],
        notifications: Arc<dyn NotificationRepository>,
        digests: Arc<dyn DigestRepository>,
        preferences: PreferenceCache,
        mailer: Arc<dyn DigestMailer>,
    ) -> Self {
        let default_time = parse_digest_time(&config.default_time).unwrap_or_else(|| {
            warn!(value = %config.default_time, "默认摘要时间格式无效，使用 09:00");
            NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default()
        });

        Self {
            notifications,
            digests,
            preferences,
            mailer,
            critical_types: critical_types.iter().map(|t| t.replace('.', "_")).collect(),
            default_time,
            default_day_of_week: config.default_day_of_week % 7,
            sample_titles: config.sample_titles,
            locks: DashMap::new(),
        }
    }

    pub fn is_critical_type(&self, notification_type: &str) -> bool {
        self.critical_types
            .contains(&notification_type.replace('.', "_"))
    }

    /// 没有记录时使用系统默认偏好
    async fn preference_for(&self, user_email: &str) -> Result<PreferenceRecord> {
        Ok(self
            .preferences
            .get(user_email)
            .await?
            .unwrap_or_else(|| {
                PreferenceRecord::defaults(user_email, self.default_time, self.default_day_of_week)
            }))
    }

    /// 决定通知立即投递还是进入摘要
    pub async fn process_notification(&self, record: &NotificationRecord) -> Result<DigestDecision> {
        self.process_notification_at(record, Utc::now()).await
    }

    #[instrument(skip(self, record, now), fields(notification_id = %record.id, notification_type = %record.notification_type))]
    pub async fn process_notification_at(
        &self,
        record: &NotificationRecord,
        now: DateTime<Utc>,
    ) -> Result<DigestDecision> {
        if self.is_critical_type(&record.notification_type) || record.priority.is_urgent() {
            return Ok(DigestDecision::SendImmediately);
        }
        let Some(user_email) = record.recipient_email.as_deref() else {
            return Ok(DigestDecision::SendImmediately);
        };

        let preference = self.preference_for(user_email).await?;
        let category = record.category();

        if preference.is_muted(&record.notification_type) {
            return Ok(DigestDecision::Suppressed {
                reason: "event_muted".to_string(),
            });
        }
        if preference.is_category_disabled(category) {
            return Ok(DigestDecision::Suppressed {
                reason: "preference_disabled".to_string(),
            });
        }
        if preference.wants_realtime(category) {
            return Ok(DigestDecision::SendImmediately);
        }

        let digest_id = self.append_to_digest(user_email, &preference, &record.id, now).await?;
        Ok(DigestDecision::Digested { digest_id })
    }

    async fn append_to_digest(
        &self,
        user_email: &str,
        preference: &PreferenceRecord,
        notification_id: &str,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let frequency = preference.frequency;
        let lock = self.lock_for(user_email, frequency);
        let _guard = lock.lock().await;

        if let Some(mut digest) = self.digests.find_pending(user_email, frequency).await? {
            if digest.push_notification(notification_id) {
                self.digests.update(&digest).await?;
            }
            debug!(digest_id = %digest.id, size = digest.notification_ids.len(), "通知已合并进待发摘要");
            return Ok(digest.id);
        }

        let scheduled_for = next_send_time(
            frequency,
            preference.digest_time,
            preference.day_of_week,
            now,
        );
        let digest = DigestRecord::pending(user_email, frequency, scheduled_for, notification_id);
        let digest = self.digests.create(&digest).await?;
        info!(
            digest_id = %digest.id,
            user_email = %user_email,
            frequency = %frequency,
            scheduled_for = %scheduled_for,
            "创建待发摘要"
        );
        Ok(digest.id)
    }

    /// 取（用户, 频率）对应的锁，摘要追加和发送共用
    fn lock_for(&self, user_email: &str, frequency: DigestFrequency) -> Arc<Mutex<()>> {
        if self.locks.len() > LOCK_PRUNE_THRESHOLD {
            self.prune_idle_locks();
        }
        self.locks
            .entry((user_email.to_ascii_lowercase(), frequency))
            .or_default()
            .clone()
    }

    /// 移除没有任何任务持有的锁，返回移除数量
    ///
    /// 只有表内一份引用的锁才会被移除，`entry` 与 `retain` 在同一分片锁下进行，
    /// 不会出现两个任务各自持有不同锁的情况
    pub fn prune_idle_locks(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        let removed = before.saturating_sub(self.locks.len());
        if removed > 0 {
            debug!(removed, remaining = self.locks.len(), "清理空闲摘要锁");
        }
        removed
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// 发送摘要
    ///
    /// 发送全程持有该用户的摘要锁，加锁后重新读取摘要，
    /// 等待期间追加的通知会一并发出。失败时标记为 failed 并累加失败次数，
    /// 未超过重试上限的摘要由下一轮批处理重新发送
    pub async fn send_digest(&self, digest: DigestRecord) -> DigestSendResult {
        let lock = self.lock_for(&digest.user_email, digest.frequency);
        let _guard = lock.lock().await;

        let fresh = self.digests.get(&digest.id).await;
        let mut digest = match fresh {
            Ok(Some(current)) => current,
            Ok(None) => digest,
            Err(e) => {
                warn!(digest_id = %digest.id, error = %e, "重新读取摘要失败，使用调用方提供的版本");
                digest
            }
        };

        if digest.status == DigestStatus::Sent {
            debug!(digest_id = %digest.id, "摘要已发送，跳过");
            return DigestSendResult {
                digest_id: digest.id,
                status: DigestStatus::Sent,
                groups: digest.grouped_summary,
                emailed: false,
                error: None,
            };
        }

        match self.try_send(&mut digest).await {
            Ok(emailed) => {
                metrics::record_digest(DigestStatus::Sent.as_str());
                info!(digest_id = %digest.id, emailed, groups = digest.grouped_summary.len(), "摘要发送完成");
                DigestSendResult {
                    digest_id: digest.id,
                    status: DigestStatus::Sent,
                    groups: digest.grouped_summary,
                    emailed,
                    error: None,
                }
            }
            Err(e) => {
                digest.status = DigestStatus::Failed;
                digest.error = Some(e.to_string());
                digest.attempts += 1;
                if digest.attempts >= MAX_DIGEST_ATTEMPTS {
                    error!(digest_id = %digest.id, attempts = digest.attempts, error = %e, "摘要发送失败，已达重试上限");
                } else {
                    warn!(digest_id = %digest.id, attempts = digest.attempts, error = %e, "摘要发送失败，等待下一轮重试");
                }
                if let Err(update_err) = self.digests.update(&digest).await {
                    error!(digest_id = %digest.id, error = %update_err, "摘要失败状态写入失败");
                }
                metrics::record_digest(DigestStatus::Failed.as_str());
                DigestSendResult {
                    digest_id: digest.id,
                    status: DigestStatus::Failed,
                    groups: digest.grouped_summary,
                    emailed: false,
                    error: digest.error,
                }
            }
        }
    }

    async fn try_send(&self, digest: &mut DigestRecord) -> Result<bool> {
        let records = self.notifications.find_by_ids(&digest.notification_ids).await?;
        digest.grouped_summary = group_notifications_for_digest(&records, self.sample_titles);
        self.digests.update(digest).await?;

        let preference = self.preference_for(&digest.user_email).await?;
        let emailed = preference.email_digest && !records.is_empty();
        if emailed {
            self.mailer.send_digest(digest).await?;
        }

        digest.status = DigestStatus::Sent;
        digest.sent_at = Some(Utc::now());
        digest.error = None;
        self.digests.update(digest).await?;
        Ok(emailed)
    }

    /// 按 ID 发送
    pub async fn send_digest_by_id(&self, digest_id: &str) -> Result<DigestSendResult> {
        let digest = self
            .digests
            .get(digest_id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                entity: "digest".to_string(),
                id: digest_id.to_string(),
            })?;
        Ok(self.send_digest(digest).await)
    }

    /// 发送所有到期摘要，单个失败不影响其他摘要
    pub async fn process_all_pending_digests(&self) -> Result<DigestBatchReport> {
        self.process_all_pending_digests_at(Utc::now()).await
    }

    pub async fn process_all_pending_digests_at(&self, now: DateTime<Utc>) -> Result<DigestBatchReport> {
        self.prune_idle_locks();

        let due = self.digests.find_due(now).await?;
        let mut report = DigestBatchReport::default();
        if due.is_empty() {
            debug!("没有到期的摘要");
            return Ok(report);
        }

        for digest in due {
            report.processed += 1;
            match self.send_digest(digest).await.status {
                DigestStatus::Sent => report.sent += 1,
                _ => report.failed += 1,
            }
        }

        info!(
            processed = report.processed,
            sent = report.sent,
            failed = report.failed,
            "到期摘要处理完成"
        );
        Ok(report)
    }
}
