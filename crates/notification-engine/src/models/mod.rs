//! 领域模型定义

mod actor;
mod category;
mod digest;
mod notification;
mod preference;
mod priority;

pub use actor::ActorType;
pub use category::NotificationCategory;
pub use digest::{DigestGroup, DigestRecord, DigestStatus, MAX_DIGEST_ATTEMPTS};
pub use notification::{
    NewNotification, NotificationPatch, NotificationQuery, NotificationRecord, RelatedEntity,
};
pub use preference::{ChannelSetting, DigestFrequency, PreferenceRecord};
pub use priority::Priority;
