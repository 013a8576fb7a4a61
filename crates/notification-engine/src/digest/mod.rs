//! 通知摘要
//!
//! 低优先级通知按用户偏好合并成定期摘要，由外部调度（见 [`crate::worker`]）
//! 周期性触发到期摘要的发送。

mod schedule;
mod service;

pub use schedule::{group_notifications_for_digest, next_send_time, parse_digest_time};
pub use service::{DigestBatchReport, DigestDecision, DigestSendResult, DigestService};
