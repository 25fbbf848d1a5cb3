//! Kind-erased entity and the remote record boundary

use serde::Serialize;
use serde_json::{Map, Value};

use super::codec::now_millis;
use super::{EntityId, EntityKind, Field, Group, Setting, User};

/// A loosely typed row as exchanged with the remote store
pub type RawRecord = Map<String, Value>;

/// One synchronized record of any kind
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Entity {
    User(User),
    Group(Group),
    Field(Field),
    Setting(Setting),
}

impl Entity {
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::User(_) => EntityKind::User,
            Self::Group(_) => EntityKind::Group,
            Self::Field(_) => EntityKind::Field,
            Self::Setting(_) => EntityKind::Setting,
        }
    }

    #[must_use]
    pub const fn id(&self) -> EntityId {
        match self {
            Self::User(user) => user.id,
            Self::Group(group) => group.id,
            Self::Field(field) => field.id,
            Self::Setting(setting) => setting.id,
        }
    }

    pub fn set_id(&mut self, id: EntityId) {
        match self {
            Self::User(user) => user.id = id,
            Self::Group(group) => group.id = id,
            Self::Field(field) => field.id = id,
            Self::Setting(setting) => setting.id = id,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: EntityId) -> Self {
        self.set_id(id);
        self
    }

    #[must_use]
    pub const fn updated_at(&self) -> i64 {
        match self {
            Self::User(user) => user.updated_at,
            Self::Group(group) => group.updated_at,
            Self::Field(field) => field.updated_at,
            Self::Setting(setting) => setting.updated_at,
        }
    }

    /// Bump `updated_at` to now, never moving it backwards
    pub fn touch(&mut self) {
        let now = now_millis();
        let slot = match self {
            Self::User(user) => &mut user.updated_at,
            Self::Group(group) => &mut group.updated_at,
            Self::Field(field) => &mut field.updated_at,
            Self::Setting(setting) => &mut setting.updated_at,
        };
        *slot = (*slot).max(now);
    }

    /// Check the kind's field rules
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::User(user) => user.validate(),
            Self::Group(group) => group.validate(),
            Self::Field(field) => field.validate(),
            Self::Setting(setting) => setting.validate(),
        }
    }

    /// Decode a record of the given kind
    pub fn from_record(kind: EntityKind, record: &RawRecord) -> serde_json::Result<Self> {
        let value = Value::Object(record.clone());
        Self::from_value(kind, value)
    }

    /// Decode a JSON value of the given kind
    pub fn from_value(kind: EntityKind, value: Value) -> serde_json::Result<Self> {
        Ok(match kind {
            EntityKind::User => Self::User(serde_json::from_value::<User>(value)?.normalized()),
            EntityKind::Group => Self::Group(serde_json::from_value(value)?),
            EntityKind::Field => Self::Field(serde_json::from_value(value)?),
            EntityKind::Setting => Self::Setting(serde_json::from_value(value)?),
        })
    }

    /// Full record, as kept in the local cache
    pub fn to_record(&self) -> serde_json::Result<RawRecord> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(serde::ser::Error::custom(format!(
                "{} did not serialize to an object: {other}",
                self.kind()
            ))),
        }
    }

    /// Record for an outbound remote write
    ///
    /// Provisional ids are left out so the remote assigns the real one.
    /// References to provisional ids are dropped too; they are pushed again
    /// once the referenced entity has its remote id.
    pub fn to_remote_record(&self) -> serde_json::Result<RawRecord> {
        let outbound = match self {
            Self::User(user) if user.group_id.is_some_and(EntityId::is_provisional) => {
                let mut user = user.clone();
                user.group_id = None;
                user.dynamic_fields.is_leader = false;
                Self::User(user)
            }
            Self::Group(group)
                if group.members.iter().any(|member| member.is_provisional())
                    || group.leader_id.is_some_and(EntityId::is_provisional) =>
            {
                let mut group = group.clone();
                group.members.retain(|member| !member.is_provisional());
                group.leader_id = group.leader_id.filter(|leader| !leader.is_provisional());
                Self::Group(group)
            }
            other => other.clone(),
        };
        let mut record = outbound.to_record()?;
        if self.id().is_provisional() {
            record.remove("id");
        }
        Ok(record)
    }

    /// Copy from `local` the references to provisional ids that the
    /// outbound record left out
    pub fn restore_provisional_references(&mut self, local: &Self) {
        match (self, local) {
            (Self::User(user), Self::User(local))
                if local.group_id.is_some_and(EntityId::is_provisional) =>
            {
                user.group_id = local.group_id;
                user.dynamic_fields.is_leader = local.dynamic_fields.is_leader;
            }
            (Self::Group(group), Self::Group(local)) => {
                if local.members.iter().any(|member| member.is_provisional()) {
                    group.members.clone_from(&local.members);
                }
                if local.leader_id.is_some_and(EntityId::is_provisional) {
                    group.leader_id = local.leader_id;
                }
            }
            _ => {}
        }
    }

    #[must_use]
    pub const fn as_user(&self) -> Option<&User> {
        match self {
            Self::User(user) => Some(user),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_group(&self) -> Option<&Group> {
        match self {
            Self::Group(group) => Some(group),
            _ => None,
        }
    }

    pub fn as_user_mut(&mut self) -> Option<&mut User> {
        match self {
            Self::User(user) => Some(user),
            _ => None,
        }
    }

    pub fn as_group_mut(&mut self) -> Option<&mut Group> {
        match self {
            Self::Group(group) => Some(group),
            _ => None,
        }
    }
}

impl From<User> for Entity {
    fn from(user: User) -> Self {
        Self::User(user)
    }
}

impl From<Group> for Entity {
    fn from(group: Group) -> Self {
        Self::Group(group)
    }
}

impl From<Field> for Entity {
    fn from(field: Field) -> Self {
        Self::Field(field)
    }
}

impl From<Setting> for Entity {
    fn from(setting: Setting) -> Self {
        Self::Setting(setting)
    }
}
