//! Registration field model

use serde::{Deserialize, Serialize};

use super::codec::{flexible_bool, now_millis, timestamp};
use super::EntityId;

/// A registration form field definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub id: EntityId,
    pub name: String,
    #[serde(rename = "type", alias = "field_type", default = "default_field_type")]
    pub field_type: String,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub required: bool,
    #[serde(default, alias = "field_order")]
    pub order: i32,
    #[serde(default, with = "timestamp")]
    pub updated_at: i64,
}

fn default_field_type() -> String {
    "text".to_string()
}

impl Field {
    #[must_use]
    pub fn new(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            id: EntityId::provisional(),
            name: name.into(),
            field_type: field_type.into(),
            required: false,
            order: 0,
            updated_at: now_millis(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Field name required".to_string());
        }
        if self.field_type.trim().is_empty() {
            return Err(format!("Field '{}' needs a type", self.name));
        }
        Ok(())
    }
}
