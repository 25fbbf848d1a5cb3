//! Entity identifiers and kinds

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

static PROVISIONAL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identifier of an entity, unique within its kind.
///
/// Remote-assigned ids are positive. Ids minted locally before the remote has
/// seen the entity are negative and time-ordered, so the two never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct EntityId(i64);

impl EntityId {
    /// Wrap a raw id
    #[must_use]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// Mint a provisional, client-side id derived from the current time
    #[must_use]
    pub fn provisional() -> Self {
        let micros = chrono::Utc::now().timestamp_micros().max(1);
        let sequence = PROVISIONAL_COUNTER.fetch_add(1, Ordering::Relaxed) % 1000;
        let sequence = i64::try_from(sequence).unwrap_or_default();
        Self(-(micros.saturating_mul(1000).saturating_add(sequence)))
    }

    /// Raw integer value
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Whether this id was minted locally and not yet replaced by the remote
    #[must_use]
    pub const fn is_provisional(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}

impl From<i64> for EntityId {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

// Remote rows carry ids either as numbers or numeric strings.
impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Number(i64),
            Text(String),
        }

        match RawId::deserialize(deserializer)? {
            RawId::Number(value) => Ok(Self(value)),
            RawId::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// The four kinds of synchronized entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    User,
    Group,
    Field,
    Setting,
}

impl EntityKind {
    /// Every kind, in reconciliation order (groups before users so references resolve)
    pub const ALL: [Self; 4] = [Self::Group, Self::User, Self::Field, Self::Setting];

    /// Remote table backing this kind
    #[must_use]
    pub const fn table(self) -> &'static str {
        match self {
            Self::User => "users",
            Self::Group => "user_groups",
            Self::Field => "registration_fields",
            Self::Setting => "registration_settings",
        }
    }

    /// Local store key holding this kind's cache snapshot
    #[must_use]
    pub const fn cache_key(self) -> &'static str {
        match self {
            Self::User => "cache:users",
            Self::Group => "cache:groups",
            Self::Field => "cache:fields",
            Self::Setting => "cache:settings",
        }
    }

    /// Short label for logs and operation ids
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Group => "group",
            Self::Field => "field",
            Self::Setting => "setting",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" | "users" => Ok(Self::User),
            "group" | "groups" | "user_groups" => Ok(Self::Group),
            "field" | "fields" | "registration_fields" => Ok(Self::Field),
            "setting" | "settings" | "registration_settings" => Ok(Self::Setting),
            other => Err(format!("unknown entity kind: {other}")),
        }
    }
}
