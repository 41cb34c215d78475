//! Redis primary store.
//!
//! # Key Design
//!
//! - `user:{id}` / `group:{id}` / `task:{id}` -> JSON record
//! - `users:all` / `groups:all` / `tasks:all` -> SET of IDs
//! - `user:email:{email}` / `group:name:{lower(name)}` -> ID
//! - `group:{id}:members`, `user:{id}:groups`, `user:{id}:tasks`,
//!   `group:{id}:tasks` -> SET of IDs
//! - `counter:{kind}` -> last issued ID
//! - `sync:dirty` -> SET of dirty kinds
//! - `sync:in_flight` -> SET of kinds claimed by the running cycle
//! - `sync:last_sync` -> RFC 3339 timestamp
//!
//! Saves and removes run as one Lua script: the record is written only if it
//! still holds the value the diff was computed from, the alternate key is
//! claimed only if free or already ours, and a released alternate key is
//! deleted only while it still points at this record. A lost race is retried
//! from a fresh read.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::{BTreeMap, BTreeSet};
use tandem_engine::{
    index_entries, normalize_group_name, unique_key_name, unique_key_prefix, Entity, EntityKind,
    Id, IndexDiff, IndexEntry, IndexSet,
};

use super::{
    counter_key, record_key, PrimaryStore, RepairReport, DIRTY_KEY, IN_FLIGHT_KEY, LAST_SYNC_KEY,
};
use crate::error::{StoreError, StoreResult};

/// Raises a counter to at least ARGV[1] and returns its value.
const ADVANCE_COUNTER_SCRIPT: &str = r"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local target = tonumber(ARGV[1])
if target > current then
    redis.call('SET', KEYS[1], target)
    return target
end
return current
";

/// Writes or deletes a record together with its index changes.
///
/// KEYS: record key, dirty set. ARGV: expected current value ('' if absent),
/// new value ('' deletes), id, kind name, alternate key to claim ('' for
/// none), then `op key member` triples.
const WRITE_RECORD_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1]) or ''
if current ~= ARGV[1] then
    return {'conflict'}
end
if ARGV[5] ~= '' then
    local owner = redis.call('GET', ARGV[5])
    if owner and owner ~= ARGV[3] then
        return {'duplicate', owner}
    end
end
if ARGV[2] == '' then
    redis.call('DEL', KEYS[1])
else
    redis.call('SET', KEYS[1], ARGV[2])
end
for i = 6, #ARGV, 3 do
    local op, key, member = ARGV[i], ARGV[i + 1], ARGV[i + 2]
    if op == 'sadd' then
        redis.call('SADD', key, member)
    elseif op == 'srem' then
        redis.call('SREM', key, member)
    elseif op == 'uset' then
        redis.call('SET', key, member)
    elseif op == 'udel' and redis.call('GET', key) == member then
        redis.call('DEL', key)
    end
end
redis.call('SADD', KEYS[2], ARGV[4])
return {'ok'}
";

/// Deletes KEYS[1] only while it holds ARGV[1].
const RELEASE_KEY_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

/// Attempts at a record write before giving up on a contended key.
const WRITE_ATTEMPTS: usize = 5;

/// Keys scanned per `SCAN` round trip during repair.
const SCAN_COUNT: usize = 500;

/// Result of one run of [`WRITE_RECORD_SCRIPT`].
enum WriteOutcome {
    Written,
    /// The record changed since it was read.
    Conflict,
    /// The alternate key belongs to another record.
    Duplicate(Id),
}

/// Primary store backed by Redis.
///
/// `ConnectionManager` multiplexes one connection and reconnects on its own;
/// cloning it is cheap.
#[derive(Clone)]
pub struct RedisPrimaryStore {
    conn: ConnectionManager,
}

impl RedisPrimaryStore {
    /// Open a managed connection to `redis_url`.
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("Connected to Redis primary store");
        Ok(Self { conn })
    }

    fn lookup_key(kind: EntityKind, key: &str) -> String {
        match kind {
            EntityKind::Group => unique_key_name(kind, &normalize_group_name(key)),
            _ => unique_key_name(kind, key),
        }
    }

    async fn read_raw(&self, kind: EntityKind, id: Id) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(record_key(kind, id)).await?)
    }

    /// Read a record for rewriting. An unreadable value yields no previous
    /// version, so its index entries are left for [`PrimaryStore::repair_indices`].
    async fn read_for_write(
        &self,
        kind: EntityKind,
        id: Id,
    ) -> StoreResult<(Option<String>, Option<Entity>)> {
        let raw = self.read_raw(kind, id).await?;
        let previous = match raw.as_deref().map(|raw| Entity::from_json(kind, raw)) {
            Some(Ok(previous)) => Some(previous),
            Some(Err(e)) => {
                tracing::warn!(
                    key = %record_key(kind, id),
                    error = %e,
                    "Rewriting unreadable record, its index entries remain until repair"
                );
                None
            }
            None => None,
        };
        Ok((raw, previous))
    }

    async fn write_record(
        &self,
        kind: EntityKind,
        id: Id,
        expected: Option<&str>,
        value: Option<&str>,
        claim: Option<&str>,
        ops: &[IndexOp],
    ) -> StoreResult<WriteOutcome> {
        let script = redis::Script::new(WRITE_RECORD_SCRIPT);
        let mut invocation = script.key(record_key(kind, id));
        invocation
            .key(DIRTY_KEY)
            .arg(expected.unwrap_or(""))
            .arg(value.unwrap_or(""))
            .arg(id)
            .arg(kind.as_str())
            .arg(claim.unwrap_or(""));
        for op in ops {
            invocation.arg(op.name).arg(&op.key).arg(op.member);
        }

        let mut conn = self.conn.clone();
        let reply: Vec<String> = invocation.invoke_async(&mut conn).await?;
        match reply.as_slice() {
            [status] if status == "ok" => Ok(WriteOutcome::Written),
            [status] if status == "conflict" => Ok(WriteOutcome::Conflict),
            [status, owner] if status == "duplicate" => {
                let owner = owner.parse().map_err(|_| StoreError::Corrupt {
                    key: claim.unwrap_or_default().to_string(),
                    reason: format!("owner '{owner}' is not an id"),
                })?;
                Ok(WriteOutcome::Duplicate(owner))
            }
            other => Err(StoreError::Corrupt {
                key: record_key(kind, id),
                reason: format!("unexpected write reply {other:?}"),
            }),
        }
    }

    async fn scan_keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }

    /// Grouping-set members written by records of `kind` that `expected`
    /// does not contain.
    async fn stale_members(
        &self,
        kind: EntityKind,
        expected: &BTreeSet<IndexEntry>,
    ) -> StoreResult<Vec<(IndexSet, Id)>> {
        let patterns: &[&str] = match kind {
            EntityKind::User => &[],
            EntityKind::Group => &["group:*:members", "user:*:groups"],
            EntityKind::Task => &["user:*:tasks", "group:*:tasks"],
        };

        let mut stale = Vec::new();
        for pattern in patterns {
            for name in self.scan_keys(pattern).await? {
                let Some(set) = IndexSet::parse(&name).filter(|set| set.owner_kind() == kind)
                else {
                    continue;
                };
                for id in self.index_members(&set).await? {
                    let entry = IndexEntry::Member {
                        set: set.clone(),
                        id,
                    };
                    if !expected.contains(&entry) {
                        stale.push((set.clone(), id));
                    }
                }
            }
        }
        Ok(stale)
    }

    /// Alternate-key lookups of `kind` that do not point at the record
    /// `expected` assigns them to, with the value they hold.
    async fn stale_keys(
        &self,
        kind: EntityKind,
        expected: &BTreeSet<IndexEntry>,
    ) -> StoreResult<Vec<(String, String)>> {
        let owners: BTreeMap<String, String> = expected
            .iter()
            .filter_map(|entry| match entry {
                IndexEntry::Unique { kind, key, id } => {
                    Some((unique_key_name(*kind, key), id.to_string()))
                }
                IndexEntry::Member { .. } => None,
            })
            .collect();

        let keys = self
            .scan_keys(&format!("{}*", unique_key_prefix(kind)))
            .await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        Ok(keys
            .into_iter()
            .zip(values)
            .filter_map(|(key, value)| {
                let value = value?;
                (owners.get(&key) != Some(&value)).then_some((key, value))
            })
            .collect())
    }
}

/// One index change applied by [`WRITE_RECORD_SCRIPT`].
struct IndexOp {
    name: &'static str,
    key: String,
    member: Id,
}

fn index_ops(kind: EntityKind, diff: &IndexDiff) -> Vec<IndexOp> {
    let removed = diff.removed.iter().map(|entry| match entry {
        IndexEntry::Member { set, id } => IndexOp {
            name: "srem",
            key: set.to_string(),
            member: *id,
        },
        IndexEntry::Unique { key, id, .. } => IndexOp {
            name: "udel",
            key: unique_key_name(kind, key),
            member: *id,
        },
    });
    let added = diff.added.iter().map(|entry| match entry {
        IndexEntry::Member { set, id } => IndexOp {
            name: "sadd",
            key: set.to_string(),
            member: *id,
        },
        IndexEntry::Unique { kind, key, id } => IndexOp {
            name: "uset",
            key: unique_key_name(*kind, key),
            member: *id,
        },
    });
    removed.chain(added).collect()
}

fn parse_kinds(names: Vec<String>) -> BTreeSet<EntityKind> {
    let mut kinds = BTreeSet::new();
    for name in names {
        match name.parse::<EntityKind>() {
            Ok(kind) => {
                kinds.insert(kind);
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring unknown dirty type"),
        }
    }
    kinds
}

#[async_trait]
impl PrimaryStore for RedisPrimaryStore {
    async fn next_id(&self, kind: EntityKind) -> StoreResult<Id> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(counter_key(kind), 1u64).await?)
    }

    async fn current_counter(&self, kind: EntityKind) -> StoreResult<Id> {
        let mut conn = self.conn.clone();
        let value: Option<Id> = conn.get(counter_key(kind)).await?;
        Ok(value.unwrap_or(0))
    }

    async fn advance_counter(&self, kind: EntityKind, at_least: Id) -> StoreResult<Id> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(ADVANCE_COUNTER_SCRIPT);
        let value: Id = script
            .key(counter_key(kind))
            .arg(at_least)
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn save(&self, entity: &Entity) -> StoreResult<()> {
        entity.validate()?;
        let kind = entity.kind();
        let id = entity.id();
        let json = entity.to_json()?;
        let natural_key = entity.natural_key();
        let claim = natural_key.as_ref().map(|key| unique_key_name(kind, key));

        for attempt in 1..=WRITE_ATTEMPTS {
            let (raw, previous) = self.read_for_write(kind, id).await?;
            let diff = IndexDiff::between(previous.as_ref(), Some(entity));
            let ops = index_ops(kind, &diff);

            let outcome = self
                .write_record(kind, id, raw.as_deref(), Some(&json), claim.as_deref(), &ops)
                .await?;
            match outcome {
                WriteOutcome::Written => return Ok(()),
                WriteOutcome::Duplicate(owner) => {
                    return Err(StoreError::DuplicateKey {
                        kind,
                        key: natural_key.unwrap_or_default(),
                        owner,
                    });
                }
                WriteOutcome::Conflict => {
                    tracing::debug!(key = %record_key(kind, id), attempt, "Record changed during save, retrying");
                }
            }
        }

        Err(StoreError::Contended {
            key: record_key(kind, id),
        })
    }

    async fn get(&self, kind: EntityKind, id: Id) -> StoreResult<Option<Entity>> {
        match self.read_raw(kind, id).await? {
            Some(raw) => Ok(Some(Entity::from_json(kind, &raw)?)),
            None => Ok(None),
        }
    }

    async fn get_by_key(&self, kind: EntityKind, key: &str) -> StoreResult<Option<Entity>> {
        let mut conn = self.conn.clone();
        let owner: Option<Id> = conn.get(Self::lookup_key(kind, key)).await?;
        match owner {
            Some(id) => self.get(kind, id).await,
            None => Ok(None),
        }
    }

    async fn get_all(&self, kind: EntityKind) -> StoreResult<Vec<Entity>> {
        let ids = self.index_members(&IndexSet::All(kind)).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|&id| record_key(kind, id)).collect();
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        let mut entities = Vec::with_capacity(ids.len());
        for (key, value) in keys.iter().zip(values) {
            match value.map(|raw| Entity::from_json(kind, &raw)) {
                Some(Ok(entity)) => entities.push(entity),
                Some(Err(e)) => {
                    tracing::warn!(key = %key, error = %e, "Skipping unreadable record");
                }
                None => tracing::warn!(key = %key, "Skipping dangling index entry"),
            }
        }

        Ok(entities)
    }

    async fn index_members(&self, set: &IndexSet) -> StoreResult<Vec<Id>> {
        let mut conn = self.conn.clone();
        let mut members: Vec<Id> = conn.smembers(set.to_string()).await?;
        members.sort_unstable();
        Ok(members)
    }

    async fn remove(&self, kind: EntityKind, id: Id) -> StoreResult<Option<Entity>> {
        for attempt in 1..=WRITE_ATTEMPTS {
            let (raw, previous) = self.read_for_write(kind, id).await?;
            let diff = IndexDiff::between(previous.as_ref(), None);
            let mut ops = index_ops(kind, &diff);
            ops.push(IndexOp {
                name: "srem",
                key: IndexSet::All(kind).to_string(),
                member: id,
            });

            let outcome = self
                .write_record(kind, id, raw.as_deref(), None, None, &ops)
                .await?;
            match outcome {
                WriteOutcome::Written => return Ok(previous),
                WriteOutcome::Conflict | WriteOutcome::Duplicate(_) => {
                    tracing::debug!(key = %record_key(kind, id), attempt, "Record changed during remove, retrying");
                }
            }
        }

        Err(StoreError::Contended {
            key: record_key(kind, id),
        })
    }

    async fn mark_dirty(&self, kind: EntityKind) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(DIRTY_KEY, kind.as_str()).await?;
        Ok(())
    }

    async fn dirty_types(&self) -> StoreResult<BTreeSet<EntityKind>> {
        let mut conn = self.conn.clone();
        let names: Vec<String> = conn.sunion(&[DIRTY_KEY, IN_FLIGHT_KEY]).await?;
        Ok(parse_kinds(names))
    }

    async fn clear_dirty_types(&self, kinds: &[EntityKind]) -> StoreResult<()> {
        if kinds.is_empty() {
            return Ok(());
        }
        let names: Vec<&str> = kinds.iter().map(EntityKind::as_str).collect();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .srem(DIRTY_KEY, &names)
            .ignore()
            .srem(IN_FLIGHT_KEY, &names)
            .ignore();
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn take_dirty_types(&self) -> StoreResult<BTreeSet<EntityKind>> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .sunionstore(IN_FLIGHT_KEY, &[IN_FLIGHT_KEY, DIRTY_KEY])
            .ignore()
            .del(DIRTY_KEY)
            .ignore()
            .smembers(IN_FLIGHT_KEY);
        let mut conn = self.conn.clone();
        let (names,): (Vec<String>,) = pipe.query_async(&mut conn).await?;
        Ok(parse_kinds(names))
    }

    async fn requeue_dirty_types(&self) -> StoreResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .sunionstore(DIRTY_KEY, &[DIRTY_KEY, IN_FLIGHT_KEY])
            .ignore()
            .del(IN_FLIGHT_KEY)
            .ignore();
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn complete_dirty_types(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(IN_FLIGHT_KEY).await?;
        Ok(())
    }

    async fn last_sync_time(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(LAST_SYNC_KEY).await?;
        raw.map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|at| at.with_timezone(&Utc))
                .map_err(|e| StoreError::Corrupt {
                    key: LAST_SYNC_KEY.to_string(),
                    reason: e.to_string(),
                })
        })
        .transpose()
    }

    async fn set_last_sync_time(&self, at: DateTime<Utc>) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(LAST_SYNC_KEY, at.to_rfc3339()).await?;
        Ok(())
    }

    async fn persist_snapshot(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("BGSAVE").query_async(&mut conn).await?;
        tracing::info!("Requested Redis background save");
        Ok(())
    }

    async fn repair_indices(&self, kind: EntityKind) -> StoreResult<RepairReport> {
        let mut report = RepairReport::default();
        let all_key = IndexSet::All(kind).to_string();
        let mut pipe = redis::pipe();
        pipe.atomic();

        for id in self.index_members(&IndexSet::All(kind)).await? {
            let readable = matches!(
                self.read_raw(kind, id).await?.map(|raw| Entity::from_json(kind, &raw)),
                Some(Ok(_))
            );
            if !readable {
                pipe.srem(&all_key, id).ignore();
                report.dangling_removed += 1;
            }
        }

        let entities = self.get_all(kind).await?;
        let expected: BTreeSet<IndexEntry> = entities.iter().flat_map(index_entries).collect();

        let stale_members = self.stale_members(kind, &expected).await?;
        for (set, id) in &stale_members {
            tracing::debug!(set = %set, id, "Removing stale index member");
            pipe.srem(set.to_string(), *id).ignore();
        }

        let stale_keys = self.stale_keys(kind, &expected).await?;
        let release = redis::Script::new(RELEASE_KEY_SCRIPT);
        let mut conn = self.conn.clone();
        for (key, value) in &stale_keys {
            tracing::debug!(key = %key, owner = %value, "Removing stale alternate key");
            let _: i64 = release.key(key).arg(value).invoke_async(&mut conn).await?;
        }
        report.stale_entries_removed = stale_members.len() + stale_keys.len();

        for entry in &expected {
            match entry {
                IndexEntry::Member { set, id } => {
                    pipe.sadd(set.to_string(), *id).ignore();
                }
                IndexEntry::Unique { kind, key, id } => {
                    pipe.set(unique_key_name(*kind, key), *id).ignore();
                }
            }
        }
        report.reindexed = entities.len();

        let _: () = pipe.query_async(&mut conn).await?;
        tracing::info!(
            kind = %kind,
            dangling_removed = report.dangling_removed,
            stale_entries_removed = report.stale_entries_removed,
            reindexed = report.reindexed,
            "Repaired primary store indices"
        );
        Ok(report)
    }
}
