//! 内存仓储
//!
//! 使用 DashMap 实现的高并发内存存储，适用于测试和开发环境。
//! 进程重启后数据丢失。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::info;

use super::traits::{
    DigestMailer, DigestRepository, NotificationRepository, PreferenceRepository,
    RecipientQuery, RecipientResolver,
};
use crate::error::{EngineError, Result};
use crate::models::{
    ActorType, DigestFrequency, DigestRecord, DigestStatus, NotificationPatch, NotificationQuery,
    NotificationRecord, PreferenceRecord,
};

/// 通用内存存储
///
/// 返回值均为克隆，不向外暴露锁
#[derive(Debug)]
pub struct MemoryStore<T> {
    data: Arc<DashMap<String, T>>,
}

impl<T> Clone for MemoryStore<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
        }
    }
}

impl<T: Clone> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            data: Arc::new(DashMap::new()),
        }
    }

    pub fn insert(&self, id: &str, value: T) {
        self.data.insert(id.to_string(), value);
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.data.get(id).map(|v| v.clone())
    }

    /// 原地修改，记录不存在时返回 None
    pub fn update<F>(&self, id: &str, f: F) -> Option<T>
    where
        F: FnOnce(&mut T),
    {
        self.data.get_mut(id).map(|mut entry| {
            f(entry.value_mut());
            entry.value().clone()
        })
    }

    pub fn list_by<F>(&self, predicate: F) -> Vec<T>
    where
        F: Fn(&T) -> bool,
    {
        self.data
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.data.len()
    }
}

// ---------------------------------------------------------------------------
// 通知
// ---------------------------------------------------------------------------

/// 内存通知仓储
#[derive(Debug, Clone, Default)]
pub struct MemoryNotificationRepository {
    store: MemoryStore<NotificationRecord>,
}

impl MemoryNotificationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 全部记录（创建时间倒序）
    pub fn all(&self) -> Vec<NotificationRecord> {
        let mut records = self.store.list_by(|_| true);
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    pub fn count(&self) -> usize {
        self.store.count()
    }

    fn not_found(id: &str) -> EngineError {
        EngineError::NotFound {
            entity: "notification".to_string(),
            id: id.to_string(),
        }
    }
}

#[async_trait]
impl NotificationRepository for MemoryNotificationRepository {
    async fn create(&self, record: &NotificationRecord) -> Result<NotificationRecord> {
        self.store.insert(&record.id, record.clone());
        Ok(record.clone())
    }

    async fn update(&self, id: &str, patch: &NotificationPatch) -> Result<NotificationRecord> {
        let now = Utc::now();
        self.store
            .update(id, |record| patch.apply(record, now))
            .ok_or_else(|| Self::not_found(id))
    }

    async fn mark_as_read(&self, id: &str) -> Result<NotificationRecord> {
        self.update(id, &NotificationPatch::read()).await
    }

    async fn mark_all_as_read(&self, recipient_email: &str, tenant_id: Option<String>) -> Result<usize> {
        let mut query = NotificationQuery::for_recipient(recipient_email).unread();
        // 广播记录没有单人已读状态
        query.include_broadcast = false;
        if let Some(tenant_id) = tenant_id {
            query = query.with_tenant(tenant_id);
        }

        let now = Utc::now();
        let patch = NotificationPatch::read();
        let targets = self.store.list_by(|record| query.matches(record));
        for record in &targets {
            self.store.update(&record.id, |r| patch.apply(r, now));
        }
        Ok(targets.len())
    }

    async fn list(&self, query: &NotificationQuery) -> Result<Vec<NotificationRecord>> {
        let mut records = self.store.list_by(|record| query.matches(record));
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        if let Some(limit) = query.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn find_by_ids(&self, ids: &[String]) -> Result<Vec<NotificationRecord>> {
        Ok(ids.iter().filter_map(|id| self.store.get(id)).collect())
    }
}

// ---------------------------------------------------------------------------
// 偏好
// ---------------------------------------------------------------------------

/// 内存偏好仓储，以小写邮箱为键
#[derive(Debug, Clone, Default)]
pub struct MemoryPreferenceRepository {
    store: MemoryStore<PreferenceRecord>,
}

impl MemoryPreferenceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PreferenceRepository for MemoryPreferenceRepository {
    async fn get(&self, user_email: &str) -> Result<Option<PreferenceRecord>> {
        Ok(self.store.get(&user_email.to_ascii_lowercase()))
    }

    async fn upsert(&self, record: &PreferenceRecord) -> Result<PreferenceRecord> {
        let mut record = record.clone();
        record.updated_at = Utc::now();
        self.store
            .insert(&record.user_email.to_ascii_lowercase(), record.clone());
        Ok(record)
    }
}

// ---------------------------------------------------------------------------
// 摘要
// ---------------------------------------------------------------------------

/// 内存摘要仓储
#[derive(Debug, Clone, Default)]
pub struct MemoryDigestRepository {
    store: MemoryStore<DigestRecord>,
}

impl MemoryDigestRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<DigestRecord> {
        self.store.list_by(|_| true)
    }
}

#[async_trait]
impl DigestRepository for MemoryDigestRepository {
    async fn get(&self, id: &str) -> Result<Option<DigestRecord>> {
        Ok(self.store.get(id))
    }

    async fn find_pending(&self, user_email: &str, frequency: DigestFrequency) -> Result<Option<DigestRecord>> {
        let mut pending = self.store.list_by(|d| {
            d.status == DigestStatus::Pending
                && d.frequency == frequency
                && d.user_email.eq_ignore_ascii_case(user_email)
        });
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending.into_iter().next())
    }

    async fn create(&self, digest: &DigestRecord) -> Result<DigestRecord> {
        self.store.insert(&digest.id, digest.clone());
        Ok(digest.clone())
    }

    async fn update(&self, digest: &DigestRecord) -> Result<DigestRecord> {
        self.store
            .update(&digest.id, |stored| *stored = digest.clone())
            .ok_or_else(|| EngineError::NotFound {
                entity: "digest".to_string(),
                id: digest.id.clone(),
            })
    }

    async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<DigestRecord>> {
        let mut due = self.store.list_by(|d| d.is_due(now));
        due.sort_by(|a, b| a.scheduled_for.cmp(&b.scheduled_for));
        Ok(due)
    }
}

// ---------------------------------------------------------------------------
// 收件人与邮件
// ---------------------------------------------------------------------------

/// 静态收件人表
///
/// 按 actor 配置固定收件人，租户级收件人优先于 actor 级
#[derive(Debug, Clone, Default)]
pub struct StaticRecipientResolver {
    by_actor: HashMap<ActorType, Vec<String>>,
    by_tenant: HashMap<String, Vec<String>>,
}

impl StaticRecipientResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_actor(mut self, actor: ActorType, emails: &[&str]) -> Self {
        self.by_actor
            .insert(actor, emails.iter().map(|e| e.to_string()).collect());
        self
    }

    pub fn with_tenant(mut self, tenant_id: &str, emails: &[&str]) -> Self {
        self.by_tenant
            .insert(tenant_id.to_string(), emails.iter().map(|e| e.to_string()).collect());
        self
    }
}

#[async_trait]
impl RecipientResolver for StaticRecipientResolver {
    async fn resolve(&self, query: &RecipientQuery) -> Result<Vec<String>> {
        if let Some(emails) = query.tenant_id.as_ref().and_then(|t| self.by_tenant.get(t)) {
            return Ok(emails.clone());
        }
        Ok(self.by_actor.get(&query.actor).cloned().unwrap_or_default())
    }
}

/// 仅记录日志的摘要邮件发送器
///
/// 生产环境替换为真实邮件服务
#[derive(Debug, Clone, Default)]
pub struct LoggingDigestMailer;

#[async_trait]
impl DigestMailer for LoggingDigestMailer {
    async fn send_digest(&self, digest: &DigestRecord) -> Result<()> {
        info!(
            digest_id = %digest.id,
            user_email = %digest.user_email,
            groups = digest.grouped_summary.len(),
            notifications = digest.notification_ids.len(),
            "模拟发送摘要邮件"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ActorType;
    use chrono::Duration;

    fn record(recipient: Option<&str>) -> NotificationRecord {
        NotificationRecord::new(
            ActorType::Client,
            recipient.map(str::to_string),
            "order_placed",
            "下单成功",
            "订单已创建",
        )
    }

    #[tokio::test]
    async fn test_notification_create_and_mark_read() {
        let repo = MemoryNotificationRepository::new();
        let created = repo.create(&record(Some("a@example.com"))).await.unwrap();

        let read = repo.mark_as_read(&created.id).await.unwrap();
        assert!(read.is_read);
        assert!(read.read_at.is_some());

        let missing = repo.mark_as_read("missing").await;
        assert!(matches!(missing, Err(EngineError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_mark_all_as_read_skips_broadcast_and_other_users() {
        let repo = MemoryNotificationRepository::new();
        repo.create(&record(Some("a@example.com"))).await.unwrap();
        repo.create(&record(Some("a@example.com"))).await.unwrap();
        repo.create(&record(Some("b@example.com"))).await.unwrap();
        repo.create(&record(None)).await.unwrap();

        assert_eq!(repo.mark_all_as_read("a@example.com", None).await.unwrap(), 2);

        let unread_b = repo
            .list(&NotificationQuery::for_recipient("b@example.com").unread())
            .await
            .unwrap();
        // b 自己的一条 + 广播一条
        assert_eq!(unread_b.len(), 2);
    }

    #[tokio::test]
    async fn test_find_by_ids_preserves_order() {
        let repo = MemoryNotificationRepository::new();
        let first = repo.create(&record(Some("a@example.com"))).await.unwrap();
        let second = repo.create(&record(Some("a@example.com"))).await.unwrap();

        let found = repo
            .find_by_ids(&[second.id.clone(), "missing".to_string(), first.id.clone()])
            .await
            .unwrap();
        let ids: Vec<&str> = found.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![second.id.as_str(), first.id.as_str()]);
    }

    #[tokio::test]
    async fn test_digest_find_pending_and_due() {
        let repo = MemoryDigestRepository::new();
        let now = Utc::now();
        let digest = DigestRecord::pending("A@example.com", DigestFrequency::Daily, now - Duration::minutes(5), "n1");
        repo.create(&digest).await.unwrap();

        let pending = repo
            .find_pending("a@example.com", DigestFrequency::Daily)
            .await
            .unwrap();
        assert_eq!(pending.map(|d| d.id), Some(digest.id.clone()));
        assert!(repo
            .find_pending("a@example.com", DigestFrequency::Weekly)
            .await
            .unwrap()
            .is_none());

        assert_eq!(repo.find_due(now).await.unwrap().len(), 1);

        let mut sent = digest.clone();
        sent.status = DigestStatus::Sent;
        repo.update(&sent).await.unwrap();
        assert!(repo.find_due(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_static_resolver_prefers_tenant() {
        let resolver = StaticRecipientResolver::new()
            .with_actor(ActorType::Tenant, &["owner@example.com"])
            .with_tenant("t-1", &["shop@example.com"]);

        let tenant = resolver
            .resolve(&RecipientQuery {
                actor: ActorType::Tenant,
                tenant_id: Some("t-1".to_string()),
                roles: vec![],
            })
            .await
            .unwrap();
        assert_eq!(tenant, vec!["shop@example.com"]);

        let fallback = resolver
            .resolve(&RecipientQuery {
                actor: ActorType::Tenant,
                tenant_id: Some("t-2".to_string()),
                roles: vec![],
            })
            .await
            .unwrap();
        assert_eq!(fallback, vec!["owner@example.com"]);

        let admin = resolver
            .resolve(&RecipientQuery {
                actor: ActorType::Admin,
                tenant_id: None,
                roles: vec![],
            })
            .await
            .unwrap();
        assert!(admin.is_empty());
    }
}
