//! 仓储与外部协作方 Trait 定义
//!
//! 引擎只依赖这些抽象，存储后端、收件人解析和邮件服务由宿主注入，
//! 测试中通过 mockall 生成的 Mock 替换。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{
    ActorType, DigestFrequency, DigestRecord, NotificationPatch, NotificationQuery,
    NotificationRecord, PreferenceRecord,
};

/// 通知仓储接口（每种 actor 一个实例）
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn create(&self, record: &NotificationRecord) -> Result<NotificationRecord>;
    async fn update(&self, id: &str, patch: &NotificationPatch) -> Result<NotificationRecord>;
    async fn mark_as_read(&self, id: &str) -> Result<NotificationRecord>;
    /// 返回被标记的记录数
    async fn mark_all_as_read(&self, recipient_email: &str, tenant_id: Option<String>) -> Result<usize>;
    /// 按创建时间倒序返回
    async fn list(&self, query: &NotificationQuery) -> Result<Vec<NotificationRecord>>;
    async fn find_by_ids(&self, ids: &[String]) -> Result<Vec<NotificationRecord>>;
}

/// 偏好仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PreferenceRepository: Send + Sync {
    async fn get(&self, user_email: &str) -> Result<Option<PreferenceRecord>>;
    async fn upsert(&self, record: &PreferenceRecord) -> Result<PreferenceRecord>;
}

/// 摘要仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DigestRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<DigestRecord>>;
    async fn find_pending(&self, user_email: &str, frequency: DigestFrequency) -> Result<Option<DigestRecord>>;
    async fn create(&self, digest: &DigestRecord) -> Result<DigestRecord>;
    async fn update(&self, digest: &DigestRecord) -> Result<DigestRecord>;
    /// 计划时间不晚于 now 的 pending 摘要，以及未超过重试上限的 failed 摘要
    async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<DigestRecord>>;
}

/// 收件人解析条件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientQuery {
    pub actor: ActorType,
    pub tenant_id: Option<String>,
    pub roles: Vec<String>,
}

/// 广播收件人解析
///
/// 允许返回空列表，此时引擎对支持广播的 actor 写入一条无收件人记录
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecipientResolver: Send + Sync {
    async fn resolve(&self, query: &RecipientQuery) -> Result<Vec<String>>;
}

/// 摘要邮件发送
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DigestMailer: Send + Sync {
    async fn send_digest(&self, digest: &DigestRecord) -> Result<()>;
}
