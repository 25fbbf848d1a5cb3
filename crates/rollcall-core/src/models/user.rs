//! User model

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use super::codec::{blank_to_none, flexible_bool, now_millis, null_as_default, timestamp};
use super::EntityId;

static EMAIL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("Invalid regex"));

/// Registration status of a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    #[default]
    Active,
    Flagged,
    Inactive,
}

/// Answers to registration fields plus the dynamic leader flag
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DynamicFields {
    /// Whether this user currently holds the leader slot of their group
    #[serde(default, deserialize_with = "flexible_bool")]
    pub is_leader: bool,
    /// Free-form answers keyed by registration field name
    #[serde(flatten)]
    pub answers: BTreeMap<String, Value>,
}

/// A registered user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: EntityId,
    #[serde(rename = "full_name", alias = "name")]
    pub name: String,
    #[serde(alias = "regNo")]
    pub registration_number: String,
    #[serde(default, alias = "phone")]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, alias = "groupId")]
    pub group_id: Option<EntityId>,
    #[serde(default)]
    pub status: UserStatus,
    #[serde(default, alias = "case_notes", alias = "caseInfo")]
    pub case_info: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub dynamic_fields: DynamicFields,
    #[serde(default, with = "timestamp")]
    pub updated_at: i64,
}

impl User {
    /// Create a new user with a provisional id
    #[must_use]
    pub fn new(name: impl Into<String>, registration_number: impl Into<String>) -> Self {
        Self {
            id: EntityId::provisional(),
            name: name.into(),
            registration_number: registration_number.into(),
            phone_number: None,
            email: None,
            group_id: None,
            status: UserStatus::Active,
            case_info: None,
            dynamic_fields: DynamicFields::default(),
            updated_at: now_millis(),
        }
    }

    /// Trim text fields and collapse blank optionals to `None`
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.name = self.name.trim().to_string();
        self.registration_number = self.registration_number.trim().to_string();
        self.phone_number = blank_to_none(self.phone_number);
        self.email = blank_to_none(self.email);
        self.case_info = blank_to_none(self.case_info);
        self
    }

    /// Check required fields and formats
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Missing required field: full_name".to_string());
        }
        if self.registration_number.trim().is_empty() {
            return Err("Missing required field: registration_number".to_string());
        }
        if let Some(email) = self.email.as_deref() {
            if !is_valid_email(email) {
                return Err(format!("Invalid email format: {email}"));
            }
        }
        Ok(())
    }

    /// Whether this user's unique keys collide with `other`'s
    ///
    /// Returns the name of the first colliding field.
    #[must_use]
    pub fn unique_key_collision(&self, other: &Self) -> Option<&'static str> {
        if self.id == other.id {
            return None;
        }
        if self
            .registration_number
            .trim()
            .eq_ignore_ascii_case(other.registration_number.trim())
        {
            return Some("registration_number");
        }
        match (self.email.as_deref(), other.email.as_deref()) {
            (Some(mine), Some(theirs)) if mine.trim().eq_ignore_ascii_case(theirs.trim()) => {
                Some("email")
            }
            _ => None,
        }
    }
}

/// Validate an email address
#[must_use]
pub fn is_valid_email(email: &str) -> bool {
    EMAIL_PATTERN.is_match(email.trim())
}
