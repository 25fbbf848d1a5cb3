//! Group model

use serde::{Deserialize, Serialize};

use super::codec::{flexible_bool, now_millis, null_as_default, timestamp};
use super::EntityId;

/// Default capacity for groups created without an explicit size
pub const DEFAULT_GROUP_CAPACITY: u32 = 10;

/// A bounded group of users with an optional leader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: EntityId,
    pub name: String,
    #[serde(rename = "size", alias = "capacity")]
    pub capacity: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub members: Vec<EntityId>,
    #[serde(default, alias = "leader")]
    pub leader_id: Option<EntityId>,
    #[serde(
        default,
        alias = "is_flagged",
        deserialize_with = "flexible_bool"
    )]
    pub flagged: bool,
    #[serde(default, with = "timestamp")]
    pub updated_at: i64,
}

impl Group {
    /// Create an empty group with a provisional id
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: u32) -> Self {
        Self {
            id: EntityId::provisional(),
            name: name.into(),
            capacity,
            members: Vec::new(),
            leader_id: None,
            flagged: false,
            updated_at: now_millis(),
        }
    }

    /// Whether another member can be added
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.members.len() >= self.capacity as usize
    }

    #[must_use]
    pub fn has_member(&self, user_id: EntityId) -> bool {
        self.members.contains(&user_id)
    }

    /// Remove a member, clearing the leader slot if they held it
    ///
    /// Returns whether anything changed.
    pub fn remove_member(&mut self, user_id: EntityId) -> bool {
        let before = self.members.len();
        self.members.retain(|member| *member != user_id);
        let mut changed = before != self.members.len();
        if self.leader_id == Some(user_id) {
            self.leader_id = None;
            changed = true;
        }
        changed
    }

    /// Check required fields and the capacity invariant
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Group name required".to_string());
        }
        if self.capacity == 0 {
            return Err("Group size must be at least 1".to_string());
        }
        if self.members.len() > self.capacity as usize {
            return Err(format!(
                "Group '{}' has {} members but capacity {}",
                self.name,
                self.members.len(),
                self.capacity
            ));
        }
        if let Some(leader) = self.leader_id {
            if !self.has_member(leader) {
                return Err(format!(
                    "Leader {leader} is not a member of group '{}'",
                    self.name
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_maps_size_and_leader_columns() {
        let group: Group = serde_json::from_value(serde_json::json!({
            "id": 4,
            "name": "Alpha",
            "size": 3,
            "members": ["1", 2],
            "leader_id": 2,
            "is_flagged": true
        }))
        .unwrap();

        assert_eq!(group.capacity, 3);
        assert_eq!(group.members, vec![EntityId::new(1), EntityId::new(2)]);
        assert_eq!(group.leader_id, Some(EntityId::new(2)));
        assert!(group.flagged);

        let written = serde_json::to_value(&group).unwrap();
        assert_eq!(written["size"], 3);
    }

    #[test]
    fn validate_rejects_overfull_groups() {
        let mut group = Group::new("Alpha", 1);
        group.members = vec![EntityId::new(1), EntityId::new(2)];
        assert!(group.validate().is_err());
    }

    #[test]
    fn validate_rejects_leader_outside_members() {
        let mut group = Group::new("Alpha", 2);
        group.leader_id = Some(EntityId::new(9));
        assert!(group.validate().unwrap_err().contains("Leader"));
    }

    #[test]
    fn remove_member_clears_leader() {
        let mut group = Group::new("Alpha", 2);
        group.members = vec![EntityId::new(1), EntityId::new(2)];
        group.leader_id = Some(EntityId::new(1));

        assert!(group.remove_member(EntityId::new(1)));
        assert_eq!(group.members, vec![EntityId::new(2)]);
        assert_eq!(group.leader_id, None);
        assert!(!group.remove_member(EntityId::new(1)));
    }
}
