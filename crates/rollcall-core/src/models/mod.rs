//! Data models for Rollcall

mod codec;
mod entity;
mod field;
mod group;
mod id;
mod setting;
mod user;

pub(crate) use codec::{blank_to_none, now_millis};
pub use entity::{Entity, RawRecord};
pub use field::Field;
pub use group::{Group, DEFAULT_GROUP_CAPACITY};
pub use id::{EntityId, EntityKind};
pub use setting::{Setting, SETTINGS_ROW_ID};
pub use user::{is_valid_email, DynamicFields, User, UserStatus};
