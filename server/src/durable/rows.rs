//! Row types for the PostgreSQL tables.

use sqlx::Row;
use std::collections::{BTreeMap, BTreeSet};
use tandem_engine::{Entity, Group, Id, Task, TaskStatus, User};

use crate::error::{StoreError, StoreResult};

/// A stored row of the users table.
#[derive(Debug)]
pub struct UserRow {
    pub id: i64,
    pub email: String,
    pub name: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for UserRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(UserRow {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            name: row.try_get("name")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl UserRow {
    pub fn to_entity(&self) -> Entity {
        Entity::User(User {
            id: self.id as Id,
            email: self.email.clone(),
            name: self.name.clone(),
            created_at: self.created_at as u64,
            updated_at: self.updated_at as u64,
        })
    }
}

/// A stored row of the groups table.
#[derive(Debug)]
pub struct GroupRow {
    pub id: i64,
    pub name: String,
    pub admin_id: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for GroupRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(GroupRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            admin_id: row.try_get("admin_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl GroupRow {
    /// Convert to an entity, attaching the group's membership edges.
    pub fn to_entity(&self, members: &BTreeMap<i64, BTreeSet<Id>>) -> Entity {
        Entity::Group(Group {
            id: self.id as Id,
            name: self.name.clone(),
            admin_id: self.admin_id as Id,
            member_ids: members.get(&self.id).cloned().unwrap_or_default(),
            created_at: self.created_at as u64,
            updated_at: self.updated_at as u64,
        })
    }
}

/// A stored row of the tasks table.
#[derive(Debug)]
pub struct TaskRow {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub status: String,
    pub user_id: i64,
    pub group_id: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for TaskRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(TaskRow {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            status: row.try_get("status")?,
            user_id: row.try_get("user_id")?,
            group_id: row.try_get("group_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TaskRow {
    pub fn to_entity(&self) -> StoreResult<Entity> {
        let status: TaskStatus = self.status.parse()?;
        Ok(Entity::Task(Task {
            id: self.id as Id,
            title: self.title.clone(),
            description: self.description.clone(),
            status,
            user_id: self.user_id as Id,
            group_id: self.group_id as Id,
            created_at: self.created_at as u64,
            updated_at: self.updated_at as u64,
        }))
    }
}

/// Convert an ID for binding. IDs above `i64::MAX` cannot be stored.
pub fn sql_id(id: Id) -> StoreResult<i64> {
    i64::try_from(id).map_err(|_| StoreError::Corrupt {
        key: id.to_string(),
        reason: "id exceeds BIGINT range".to_string(),
    })
}

/// Convert a timestamp for binding.
pub fn sql_timestamp(timestamp: u64) -> i64 {
    i64::try_from(timestamp).unwrap_or(i64::MAX)
}
