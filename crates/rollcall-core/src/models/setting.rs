//! Registration settings model

use serde::{Deserialize, Serialize};

use super::codec::{flexible_bool, timestamp};
use super::EntityId;

/// Id of the singleton settings row
pub const SETTINGS_ROW_ID: EntityId = EntityId::new(1);

/// Singleton registration configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting {
    #[serde(default = "default_setting_id")]
    pub id: EntityId,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub enabled: bool,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default, with = "timestamp")]
    pub updated_at: i64,
}

const fn default_setting_id() -> EntityId {
    SETTINGS_ROW_ID
}

fn default_mode() -> String {
    "open".to_string()
}

impl Default for Setting {
    fn default() -> Self {
        Self {
            id: SETTINGS_ROW_ID,
            enabled: false,
            mode: default_mode(),
            updated_at: 0,
        }
    }
}

impl Setting {
    pub fn validate(&self) -> Result<(), String> {
        if self.mode.trim().is_empty() {
            return Err("Registration mode required".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_columns_fall_back_to_defaults() {
        let setting: Setting = serde_json::from_value(serde_json::json!({"enabled": 1})).unwrap();
        assert_eq!(setting.id, SETTINGS_ROW_ID);
        assert!(setting.enabled);
        assert_eq!(setting.mode, "open");
    }
}
