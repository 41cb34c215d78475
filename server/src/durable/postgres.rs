//! PostgreSQL durable store.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};
use std::collections::{BTreeMap, BTreeSet};
use tandem_engine::{
    normalize_group_name, resolve_in_batch, BatchReport, Entity, EntityKind, Error, Id,
};

use super::rows::{sql_id, sql_timestamp, GroupRow, TaskRow, UserRow};
use super::DurableStore;
use crate::error::StoreResult;

/// Durable store backed by a PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PgDurableStore {
    pool: PgPool,
}

impl PgDurableStore {
    /// Create a connection pool for `database_url`.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        tracing::info!("Connected to PostgreSQL durable store");
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn table(kind: EntityKind) -> &'static str {
    kind.as_str()
}

async fn exists(conn: &mut PgConnection, kind: EntityKind, id: i64) -> StoreResult<bool> {
    let sql = format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = $1)", table(kind));
    let result: (bool,) = sqlx::query_as(&sql).bind(id).fetch_one(&mut *conn).await?;
    Ok(result.0)
}

/// ID of a row outside `batch` currently holding a natural key.
///
/// Rows inside the batch may hold a key another batch row is taking over
/// until the batch commits.
async fn key_owner(
    conn: &mut PgConnection,
    kind: EntityKind,
    key: &str,
    batch: &[i64],
) -> StoreResult<Option<Id>> {
    let sql = match kind {
        EntityKind::User => {
            "SELECT id FROM users WHERE email = $1 AND NOT (id = ANY($2)) LIMIT 1"
        }
        EntityKind::Group => {
            "SELECT id FROM groups WHERE name_key = $1 AND NOT (id = ANY($2)) LIMIT 1"
        }
        EntityKind::Task => return Ok(None),
    };
    let row: Option<(i64,)> = sqlx::query_as(sql)
        .bind(key)
        .bind(batch)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(|(id,)| id as Id))
}

/// Delete one row; foreign keys cascade to tasks and memberships.
async fn delete_row(conn: &mut PgConnection, kind: EntityKind, id: i64) -> StoreResult<bool> {
    let sql = format!("DELETE FROM {} WHERE id = $1", table(kind));
    let result = sqlx::query(&sql).bind(id).execute(&mut *conn).await?;
    Ok(result.rows_affected() > 0)
}

/// Insert or overwrite a row by ID. `first_synced_at` keeps its original
/// value on update.
async fn write_row(conn: &mut PgConnection, entity: &Entity) -> StoreResult<()> {
    match entity {
        Entity::User(user) => {
            sqlx::query(
                r#"
                INSERT INTO users (id, email, name, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (id) DO UPDATE SET
                    email = EXCLUDED.email,
                    name = EXCLUDED.name,
                    created_at = EXCLUDED.created_at,
                    updated_at = EXCLUDED.updated_at,
                    last_synced_at = now()
                "#,
            )
            .bind(sql_id(user.id)?)
            .bind(&user.email)
            .bind(&user.name)
            .bind(sql_timestamp(user.created_at))
            .bind(sql_timestamp(user.updated_at))
            .execute(&mut *conn)
            .await?;
        }
        Entity::Group(group) => {
            let group_id = sql_id(group.id)?;
            sqlx::query(
                r#"
                INSERT INTO groups (id, name, name_key, admin_id, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (id) DO UPDATE SET
                    name = EXCLUDED.name,
                    name_key = EXCLUDED.name_key,
                    admin_id = EXCLUDED.admin_id,
                    created_at = EXCLUDED.created_at,
                    updated_at = EXCLUDED.updated_at,
                    last_synced_at = now()
                "#,
            )
            .bind(group_id)
            .bind(&group.name)
            .bind(normalize_group_name(&group.name))
            .bind(sql_id(group.admin_id)?)
            .bind(sql_timestamp(group.created_at))
            .bind(sql_timestamp(group.updated_at))
            .execute(&mut *conn)
            .await?;

            let members = group
                .member_ids
                .iter()
                .map(|&id| sql_id(id))
                .collect::<StoreResult<Vec<i64>>>()?;
            sqlx::query("DELETE FROM memberships WHERE group_id = $1")
                .bind(group_id)
                .execute(&mut *conn)
                .await?;
            sqlx::query(
                r#"
                INSERT INTO memberships (group_id, user_id)
                SELECT $1, member FROM UNNEST($2::BIGINT[]) AS member
                "#,
            )
            .bind(group_id)
            .bind(&members)
            .execute(&mut *conn)
            .await?;
        }
        Entity::Task(task) => {
            sqlx::query(
                r#"
                INSERT INTO tasks (
                    id, title, description, status, user_id, group_id,
                    created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (id) DO UPDATE SET
                    title = EXCLUDED.title,
                    description = EXCLUDED.description,
                    status = EXCLUDED.status,
                    user_id = EXCLUDED.user_id,
                    group_id = EXCLUDED.group_id,
                    created_at = EXCLUDED.created_at,
                    updated_at = EXCLUDED.updated_at,
                    last_synced_at = now()
                "#,
            )
            .bind(sql_id(task.id)?)
            .bind(&task.title)
            .bind(&task.description)
            .bind(task.status.as_str())
            .bind(sql_id(task.user_id)?)
            .bind(sql_id(task.group_id)?)
            .bind(sql_timestamp(task.created_at))
            .bind(sql_timestamp(task.updated_at))
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}

#[async_trait]
impl DurableStore for PgDurableStore {
    async fn sync_collection(
        &self,
        kind: EntityKind,
        records: &[Entity],
    ) -> StoreResult<BatchReport> {
        let ids = records
            .iter()
            .map(|entity| sql_id(entity.id()))
            .collect::<StoreResult<Vec<i64>>>()?;
        let batch: BTreeSet<Id> = records.iter().map(Entity::id).collect();

        let mut tx = self.pool.begin().await?;
        let mut report = BatchReport::new(kind);

        // Any early return drops `tx`, which rolls the whole batch back.
        // Natural-key constraints are deferred and checked by the commit.
        for entity in records {
            if entity.kind() != kind {
                return Err(Error::KindMismatch {
                    expected: kind,
                    actual: entity.kind(),
                }
                .into());
            }
            entity.validate()?;

            let id = entity.id();
            let row_id = sql_id(id)?;
            let found_by_id = exists(&mut tx, kind, row_id).await?;
            let owner = match entity.natural_key() {
                Some(key) => key_owner(&mut tx, kind, &key, &ids).await?,
                None => None,
            };

            let resolution = resolve_in_batch(id, found_by_id, owner, &batch);
            if let Some(stale_id) = resolution.evicted() {
                delete_row(&mut tx, kind, sql_id(stale_id)?).await?;
            }
            write_row(&mut tx, entity).await?;
            report.record(id, resolution);
        }

        let sql = format!("DELETE FROM {} WHERE NOT (id = ANY($1))", table(kind));
        let removed = sqlx::query(&sql).bind(&ids).execute(&mut *tx).await?;
        report.removed = removed.rows_affected() as usize;

        tx.commit().await?;
        Ok(report)
    }

    async fn get_all(&self, kind: EntityKind) -> StoreResult<Vec<Entity>> {
        match kind {
            EntityKind::User => {
                let rows = sqlx::query_as::<_, UserRow>(
                    "SELECT id, email, name, created_at, updated_at FROM users ORDER BY id",
                )
                .fetch_all(&self.pool)
                .await?;
                Ok(rows.iter().map(UserRow::to_entity).collect())
            }
            EntityKind::Group => {
                let rows = sqlx::query_as::<_, GroupRow>(
                    "SELECT id, name, admin_id, created_at, updated_at FROM groups ORDER BY id",
                )
                .fetch_all(&self.pool)
                .await?;
                let edges: Vec<(i64, i64)> =
                    sqlx::query_as("SELECT group_id, user_id FROM memberships")
                        .fetch_all(&self.pool)
                        .await?;

                let mut members: BTreeMap<i64, BTreeSet<Id>> = BTreeMap::new();
                for (group_id, user_id) in edges {
                    members.entry(group_id).or_default().insert(user_id as Id);
                }
                Ok(rows.iter().map(|row| row.to_entity(&members)).collect())
            }
            EntityKind::Task => {
                let rows = sqlx::query_as::<_, TaskRow>(
                    r#"
                    SELECT id, title, description, status, user_id, group_id,
                           created_at, updated_at
                    FROM tasks
                    ORDER BY id
                    "#,
                )
                .fetch_all(&self.pool)
                .await?;
                rows.iter().map(TaskRow::to_entity).collect()
            }
        }
    }

    async fn max_id(&self, kind: EntityKind) -> StoreResult<Id> {
        let sql = format!("SELECT COALESCE(MAX(id), 0) FROM {}", table(kind));
        let result: (i64,) = sqlx::query_as(&sql).fetch_one(&self.pool).await?;
        Ok(result.0.max(0) as Id)
    }

    async fn delete(&self, kind: EntityKind, id: Id) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        let deleted = delete_row(&mut tx, kind, sql_id(id)?).await?;
        tx.commit().await?;
        Ok(deleted)
    }
}
