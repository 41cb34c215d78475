//! Entity records shared by both stores.
//!
//! Every entity carries the numeric ID issued by the primary store's counter.
//! That ID is the join key between the stores and must match on both sides.

use crate::{EntityKind, Error, Id, Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// A user account. Unique by email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Id,
    pub email: String,
    pub name: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl User {
    /// Create a new user record.
    pub fn new(
        id: Id,
        email: impl Into<String>,
        name: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id,
            email: email.into(),
            name: name.into(),
            created_at: timestamp,
            updated_at: timestamp,
        }
    }
}

/// A group of users. Unique by name, compared case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: Id,
    pub name: String,
    pub admin_id: Id,
    /// Membership edges owned by this group.
    #[serde(default)]
    pub member_ids: BTreeSet<Id>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Group {
    /// Create a new group. The admin is always a member.
    pub fn new(id: Id, name: impl Into<String>, admin_id: Id, timestamp: Timestamp) -> Self {
        Self {
            id,
            name: name.into(),
            admin_id,
            member_ids: BTreeSet::from([admin_id]),
            created_at: timestamp,
            updated_at: timestamp,
        }
    }

    /// Builder-style helper to add members.
    pub fn with_members(mut self, members: impl IntoIterator<Item = Id>) -> Self {
        self.member_ids.extend(members);
        self
    }

    /// Membership edges of this group.
    pub fn memberships(&self) -> impl Iterator<Item = Membership> + '_ {
        self.member_ids.iter().map(move |&user_id| Membership {
            user_id,
            group_id: self.id,
        })
    }
}

/// Workflow state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "todo" => Ok(TaskStatus::Todo),
            "in_progress" => Ok(TaskStatus::InProgress),
            "done" => Ok(TaskStatus::Done),
            other => Err(Error::InvalidTaskStatus(other.to_string())),
        }
    }
}

/// A task owned by one user inside one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Id,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    pub user_id: Id,
    pub group_id: Id,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Task {
    /// Create a new task in the `todo` state.
    pub fn new(
        id: Id,
        title: impl Into<String>,
        user_id: Id,
        group_id: Id,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id,
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Todo,
            user_id,
            group_id,
            created_at: timestamp,
            updated_at: timestamp,
        }
    }
}

/// A user-to-group edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub user_id: Id,
    pub group_id: Id,
}

/// Any synchronized record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record")]
pub enum Entity {
    #[serde(rename = "users")]
    User(User),
    #[serde(rename = "groups")]
    Group(Group),
    #[serde(rename = "tasks")]
    Task(Task),
}

impl Entity {
    pub fn id(&self) -> Id {
        match self {
            Entity::User(u) => u.id,
            Entity::Group(g) => g.id,
            Entity::Task(t) => t.id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::User(_) => EntityKind::User,
            Entity::Group(_) => EntityKind::Group,
            Entity::Task(_) => EntityKind::Task,
        }
    }

    /// The natural unique key, normalized for comparison.
    ///
    /// Emails are compared as stored; group names case-insensitively.
    pub fn natural_key(&self) -> Option<String> {
        match self {
            Entity::User(u) => Some(u.email.clone()),
            Entity::Group(g) => Some(normalize_group_name(&g.name)),
            Entity::Task(_) => None,
        }
    }

    /// Check the invariants a record must satisfy before it is written.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Error::InvalidRecord {
            kind: self.kind(),
            id: self.id(),
            reason: reason.to_string(),
        };

        if self.id() == 0 {
            return Err(invalid("id must be non-zero"));
        }
        match self {
            Entity::User(u) if u.email.trim().is_empty() => Err(invalid("empty email")),
            Entity::Group(g) if g.name.trim().is_empty() => Err(invalid("empty name")),
            Entity::Task(t) if t.user_id == 0 || t.group_id == 0 => {
                Err(invalid("task must reference a user and a group"))
            }
            _ => Ok(()),
        }
    }

    /// Serialize the inner record (without the kind tag).
    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            Entity::User(u) => serde_json::to_string(u),
            Entity::Group(g) => serde_json::to_string(g),
            Entity::Task(t) => serde_json::to_string(t),
        }
    }

    /// Parse a record of a known kind from its untagged JSON form.
    pub fn from_json(kind: EntityKind, json: &str) -> serde_json::Result<Self> {
        Ok(match kind {
            EntityKind::User => Entity::User(serde_json::from_str(json)?),
            EntityKind::Group => Entity::Group(serde_json::from_str(json)?),
            EntityKind::Task => Entity::Task(serde_json::from_str(json)?),
        })
    }

    pub fn as_user(&self) -> Option<&User> {
        match self {
            Entity::User(u) => Some(u),
            _ => None,
        }
    }

    pub fn as_group(&self) -> Option<&Group> {
        match self {
            Entity::Group(g) => Some(g),
            _ => None,
        }
    }

    pub fn as_task(&self) -> Option<&Task> {
        match self {
            Entity::Task(t) => Some(t),
            _ => None,
        }
    }
}

impl From<User> for Entity {
    fn from(user: User) -> Self {
        Entity::User(user)
    }
}

impl From<Group> for Entity {
    fn from(group: Group) -> Self {
        Entity::Group(group)
    }
}

impl From<Task> for Entity {
    fn from(task: Task) -> Self {
        Entity::Task(task)
    }
}

/// Normalize a group name for uniqueness checks.
pub fn normalize_group_name(name: &str) -> String {
    name.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_admin_is_member() {
        let group = Group::new(3, "Ops", 1, 1000).with_members([2, 4]);
        assert_eq!(group.member_ids, BTreeSet::from([1, 2, 4]));

        let edges: Vec<Membership> = group.memberships().collect();
        assert_eq!(edges.len(), 3);
        assert!(edges.iter().all(|m| m.group_id == 3));
    }

    #[test]
    fn natural_keys() {
        let user: Entity = User::new(1, "a@x.com", "Alice", 1000).into();
        assert_eq!(user.natural_key().as_deref(), Some("a@x.com"));

        let group: Entity = Group::new(2, "  Platform Team ", 1, 1000).into();
        assert_eq!(group.natural_key().as_deref(), Some("platform team"));

        let task: Entity = Task::new(3, "Write docs", 1, 2, 1000).into();
        assert_eq!(task.natural_key(), None);
    }

    #[test]
    fn json_roundtrip_without_tag() {
        let task = Task::new(9, "Ship", 1, 2, 1000);
        let entity = Entity::Task(task.clone());
        let json = entity.to_json().unwrap();
        assert!(json.contains("\"userId\":1"));
        assert!(!json.contains("\"kind\""));

        let parsed = Entity::from_json(EntityKind::Task, &json).unwrap();
        assert_eq!(parsed, Entity::Task(task));
    }

    #[test]
    fn from_json_wrong_kind_fails() {
        let json = Entity::Task(Task::new(9, "Ship", 1, 2, 1000))
            .to_json()
            .unwrap();
        assert!(Entity::from_json(EntityKind::User, &json).is_err());
    }

    #[test]
    fn tagged_serialization() {
        let entity: Entity = User::new(5, "a@x.com", "A", 1).into();
        let value = serde_json::to_value(&entity).unwrap();
        assert_eq!(value["kind"], "users");
        assert_eq!(value["record"]["email"], "a@x.com");
    }

    #[test]
    fn validation() {
        assert!(Entity::from(User::new(1, "a@x.com", "A", 1)).validate().is_ok());
        assert!(Entity::from(User::new(0, "a@x.com", "A", 1)).validate().is_err());
        assert!(Entity::from(User::new(1, " ", "A", 1)).validate().is_err());
        assert!(Entity::from(Group::new(1, "", 1, 1)).validate().is_err());
        assert!(Entity::from(Task::new(1, "t", 0, 2, 1)).validate().is_err());
    }

    #[test]
    fn task_status_parsing() {
        assert_eq!("in_progress".parse::<TaskStatus>().unwrap(), TaskStatus::InProgress);
        assert_eq!(TaskStatus::Done.to_string(), "done");
        assert!("blocked".parse::<TaskStatus>().is_err());
    }
}
