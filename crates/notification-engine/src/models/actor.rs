//! 通知对象类型
//!
//! 每种对象对应一个独立的持久化集合，由各自的仓储负责读写。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::Priority;
use crate::error::EngineError;

/// 通知对象类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorType {
    /// 普通用户（买家）
    Client,
    /// 平台管理员
    Admin,
    /// 租户（店铺）
    Tenant,
    /// 内测用户
    Tester,
}

impl ActorType {
    pub const ALL: [ActorType; 4] = [Self::Client, Self::Admin, Self::Tenant, Self::Tester];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Admin => "admin",
            Self::Tenant => "tenant",
            Self::Tester => "tester",
        }
    }

    /// 是否允许无接收人的广播记录
    ///
    /// 管理员和租户的通知中心按角色展示广播；买家端只展示定向通知
    pub fn supports_broadcast(&self) -> bool {
        matches!(self, Self::Admin | Self::Tenant)
    }

    /// 未显式指定时的默认优先级
    pub fn default_priority(&self) -> Priority {
        match self {
            Self::Admin => Priority::High,
            Self::Client | Self::Tenant => Priority::Normal,
            Self::Tester => Priority::Low,
        }
    }
}

impl fmt::Display for ActorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActorType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "client" => Ok(Self::Client),
            "admin" => Ok(Self::Admin),
            "tenant" => Ok(Self::Tenant),
            "tester" => Ok(Self::Tester),
            other => Err(EngineError::InvalidActor(other.to_string())),
        }
    }
}
