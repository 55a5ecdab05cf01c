use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::envelope::{EntityRow, EntityTable};
use crate::error::{EngineError, Result};

pub(crate) const CURRENT_SCHEMA_VERSION: i32 = 2;

/// A page of rows returned from a ranged query, along with the cursor a caller should
/// use to fetch the next page (the greatest `(updated_at, id)` pair observed).
pub struct Page<T> {
    pub rows: Vec<T>,
    pub next_cursor: Option<(DateTime<Utc>, String)>,
}

/// Transactional embedded store: per-table CRUD, secondary-index queries, multi-table
/// transactions with rollback on error, and forward-only schema migrations (spec.md
/// §4.1). Generalizes the teacher's `SyncEngine` (`oplog.rs`) from one implicit table to
/// the full fixed `EntityTable` enumeration, and from free-form row JSON to the
/// envelope + opaque-fields split of `EntityRow`.
pub struct LocalStore {
    conn: Connection,
}

impl LocalStore {
    pub fn open(conn: Connection) -> Result<Self> {
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(Connection::open_in_memory()?)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Create required tables and indexes. Safe to call multiple times.
    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        for table in EntityTable::ALL {
            self.conn.execute_batch(&format!(
                r#"
CREATE TABLE IF NOT EXISTS {table} (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    version INTEGER NOT NULL DEFAULT 1,
    device_id TEXT,
    fields TEXT NOT NULL DEFAULT '{{}}'
);
CREATE INDEX IF NOT EXISTS idx_{table}_user_id ON {table}(user_id);
CREATE INDEX IF NOT EXISTS idx_{table}_updated_at ON {table}(updated_at, id);
"#,
                table = table.as_str()
            ))?;
        }

        self.conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS sync_queue (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    kind TEXT NOT NULL CHECK(kind IN ('create','delete','set','increment')),
    field TEXT,
    value TEXT,
    timestamp TEXT NOT NULL,
    retries INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_sync_queue_timestamp ON sync_queue(timestamp);
CREATE INDEX IF NOT EXISTS idx_sync_queue_entity ON sync_queue(table_name, entity_id);

CREATE TABLE IF NOT EXISTS conflict_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    field TEXT NOT NULL,
    local_value TEXT,
    remote_value TEXT,
    resolved_value TEXT,
    winner TEXT NOT NULL CHECK(winner IN ('local','remote','merged')),
    strategy TEXT NOT NULL,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_conflict_history_timestamp ON conflict_history(timestamp);

CREATE TABLE IF NOT EXISTS sync_kv (
    k TEXT PRIMARY KEY,
    v TEXT NOT NULL
);
"#,
        )?;

        self.conn.execute(
            "INSERT INTO sync_kv(k,v) VALUES('schema_version','1') ON CONFLICT(k) DO NOTHING",
            [],
        )?;
        self.run_migrations(CURRENT_SCHEMA_VERSION)?;
        Ok(())
    }

    pub fn get_schema_version(&self) -> Result<i32> {
        let ver: Option<String> = self
            .conn
            .query_row("SELECT v FROM sync_kv WHERE k='schema_version'", [], |r| r.get(0))
            .optional()?;
        Ok(ver.and_then(|s| s.parse().ok()).unwrap_or(1))
    }

    /// Forward-only migrations. Version 2 backfills `_version=1` and `device_id=NULL` on
    /// rows written before the envelope columns existed (spec.md §4.1(d)) — a real step,
    /// unlike the teacher's placeholder that only bumped the stored version number.
    pub fn run_migrations(&self, target_version: i32) -> Result<()> {
        if target_version < 1 {
            return Err(EngineError::State("invalid target_version"));
        }
        let current = self.get_schema_version()?;
        if current >= target_version {
            return Ok(());
        }

        let tx = self.conn.unchecked_transaction()?;
        if current < 2 && target_version >= 2 {
            for table in EntityTable::ALL {
                tx.execute(
                    &format!(
                        "UPDATE {table} SET version = 1 WHERE version IS NULL",
                        table = table.as_str()
                    ),
                    [],
                )?;
                tx.execute(
                    &format!(
                        "UPDATE {table} SET device_id = NULL WHERE device_id = ''",
                        table = table.as_str()
                    ),
                    [],
                )?;
            }
        }
        tx.execute(
            "INSERT INTO sync_kv(k,v) VALUES('schema_version',?1) ON CONFLICT(k) DO UPDATE SET v=excluded.v",
            params![target_version.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Execute `f` inside a transaction, committing only if it returns `Ok`. The only
    /// source of concurrency control with respect to the local store (spec.md §5).
    pub fn with_tx<R>(&mut self, f: impl FnOnce(&Transaction<'_>) -> Result<R>) -> Result<R> {
        let tx = self.conn.unchecked_transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    pub fn get(&self, table: EntityTable, id: &str) -> Result<Option<EntityRow>> {
        Self::get_tx(&self.conn, table, id)
    }

    pub fn get_tx(conn: &Connection, table: EntityTable, id: &str) -> Result<Option<EntityRow>> {
        conn.query_row(
            &format!(
                "SELECT id, user_id, created_at, updated_at, deleted, version, device_id, fields
                 FROM {table} WHERE id = ?1",
                table = table.as_str()
            ),
            params![id],
            Self::row_from_query,
        )
        .optional()
        .map_err(EngineError::from)
    }

    pub fn put(&mut self, table: EntityTable, row: &EntityRow) -> Result<()> {
        self.with_tx(|tx| Self::put_tx(tx, table, row))
    }

    pub fn put_tx(tx: &Transaction<'_>, table: EntityTable, row: &EntityRow) -> Result<()> {
        tx.execute(
            &format!(
                "INSERT INTO {table} (id, user_id, created_at, updated_at, deleted, version, device_id, fields)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
                 ON CONFLICT(id) DO UPDATE SET
                    user_id=excluded.user_id, created_at=excluded.created_at,
                    updated_at=excluded.updated_at, deleted=excluded.deleted,
                    version=excluded.version, device_id=excluded.device_id, fields=excluded.fields",
                table = table.as_str()
            ),
            params![
                row.id,
                row.user_id,
                row.created_at.to_rfc3339(),
                row.updated_at.to_rfc3339(),
                row.deleted as i64,
                row.version,
                row.device_id,
                row.fields.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn delete(&mut self, table: EntityTable, id: &str) -> Result<()> {
        self.with_tx(|tx| Self::delete_tx(tx, table, id))
    }

    pub fn delete_tx(tx: &Transaction<'_>, table: EntityTable, id: &str) -> Result<()> {
        tx.execute(
            &format!("DELETE FROM {table} WHERE id = ?1", table = table.as_str()),
            params![id],
        )?;
        Ok(())
    }

    pub fn bulk_put(&mut self, table: EntityTable, rows: &[EntityRow]) -> Result<()> {
        self.with_tx(|tx| {
            for row in rows {
                Self::put_tx(tx, table, row)?;
            }
            Ok(())
        })
    }

    pub fn bulk_delete(&mut self, table: EntityTable, ids: &[String]) -> Result<()> {
        self.with_tx(|tx| {
            for id in ids {
                Self::delete_tx(tx, table, id)?;
            }
            Ok(())
        })
    }

    /// Equality query on a named secondary index column (`user_id` or an
    /// entity-specific field promoted to a real column by the host schema, e.g. `date`
    /// or a `(routine_id, date)` composite expressed as a single generated column).
    pub fn query_by_index(
        &self,
        table: EntityTable,
        column: &str,
        value: &str,
    ) -> Result<Vec<EntityRow>> {
        Self::assert_safe_identifier(column)?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, user_id, created_at, updated_at, deleted, version, device_id, fields
             FROM {table} WHERE {column} = ?1 ORDER BY updated_at, id",
            table = table.as_str(),
            column = column
        ))?;
        let rows = stmt
            .query_map(params![value], Self::row_from_query)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Ranged query used by pull reconcile: rows with `updated_at >= cursor`, stably
    /// sorted by `(updated_at, id)` so rows sharing a timestamp are never skipped across
    /// pages (spec.md §4.6 "Egress optimisation").
    pub fn query_since(
        &self,
        table: EntityTable,
        cursor: DateTime<Utc>,
        page_size: i64,
        after_id: Option<&str>,
    ) -> Result<Page<EntityRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, user_id, created_at, updated_at, deleted, version, device_id, fields
             FROM {table}
             WHERE updated_at > ?1 OR (updated_at = ?1 AND id > ?2)
             ORDER BY updated_at, id
             LIMIT ?3",
            table = table.as_str()
        ))?;
        let rows = stmt
            .query_map(
                params![cursor.to_rfc3339(), after_id.unwrap_or(""), page_size],
                Self::row_from_query,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let next_cursor = rows.last().map(|r| (r.updated_at, r.id.clone()));
        Ok(Page { rows, next_cursor })
    }

    /// Append a resolver decision to the append-only `conflict_history` audit log
    /// (spec.md §3, §4.7).
    pub fn append_conflict(&self, conflict: &crate::resolver::FieldConflict) -> Result<()> {
        let winner = match conflict.winner {
            crate::resolver::Winner::Local => "local",
            crate::resolver::Winner::Remote => "remote",
            crate::resolver::Winner::Merged => "merged",
        };
        let strategy = match conflict.strategy {
            crate::resolver::Strategy::LocalPending => "local_pending",
            crate::resolver::Strategy::DeleteWins => "delete_wins",
            crate::resolver::Strategy::LastWrite => "last_write",
        };
        self.conn.execute(
            "INSERT INTO conflict_history
                (entity_id, entity_type, field, local_value, remote_value, resolved_value, winner, strategy, timestamp)
             VALUES (?1, '', ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                conflict.entity_id,
                conflict.field,
                conflict.local_value.as_ref().map(|v| v.to_string()),
                conflict.remote_value.as_ref().map(|v| v.to_string()),
                conflict.resolved_value.to_string(),
                winner,
                strategy,
                conflict.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Prune conflict-history rows older than `retention_days` (spec.md §3: "pruned
    /// after 30 days").
    pub fn prune_conflict_history(&self, now: DateTime<Utc>, retention_days: i64) -> Result<usize> {
        let cutoff = now - chrono::Duration::days(retention_days);
        let affected = self.conn.execute(
            "DELETE FROM conflict_history WHERE timestamp < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(affected)
    }

    /// Hard-delete tombstoned rows older than `retention_days` (the retention sweep
    /// spec.md §9's Open Questions recommend adding, since the source keeps tombstones
    /// indefinitely).
    pub fn sweep_tombstones(&mut self, now: DateTime<Utc>, retention_days: i64) -> Result<usize> {
        let cutoff = now - chrono::Duration::days(retention_days);
        let mut total = 0usize;
        self.with_tx(|tx| {
            for table in EntityTable::ALL {
                total += tx.execute(
                    &format!(
                        "DELETE FROM {table} WHERE deleted = 1 AND updated_at < ?1",
                        table = table.as_str()
                    ),
                    params![cutoff.to_rfc3339()],
                )?;
            }
            Ok(())
        })?;
        Ok(total)
    }

    /// Read a value from the `sync_kv` platform-durable table: the pull cursor
    /// (spec.md §6 "Persistent cursor") lives here.
    pub fn get_kv(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row("SELECT v FROM sync_kv WHERE k = ?1", params![key], |r| r.get(0))
            .optional()
            .map_err(EngineError::from)
    }

    pub fn set_kv(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_kv(k,v) VALUES(?1,?2) ON CONFLICT(k) DO UPDATE SET v=excluded.v",
            params![key, value],
        )?;
        Ok(())
    }

    /// Wipe all entity tables, the outbox, and the conflict history (spec.md §6:
    /// "Logout clears: local entity tables, outbox, conflict history, cursor").
    pub fn clear_all_for_logout(&mut self) -> Result<()> {
        self.with_tx(|tx| {
            for table in EntityTable::ALL {
                tx.execute(&format!("DELETE FROM {table}", table = table.as_str()), [])?;
            }
            tx.execute("DELETE FROM sync_queue", [])?;
            tx.execute("DELETE FROM conflict_history", [])?;
            tx.execute("DELETE FROM sync_kv WHERE k = 'pull_cursor'", [])?;
            Ok(())
        })
    }

    fn assert_safe_identifier(column: &str) -> Result<()> {
        if column.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') && !column.is_empty() {
            Ok(())
        } else {
            Err(EngineError::State("invalid index column name"))
        }
    }

    fn row_from_query(r: &rusqlite::Row<'_>) -> rusqlite::Result<EntityRow> {
        let created_at: String = r.get(2)?;
        let updated_at: String = r.get(3)?;
        let fields: String = r.get(7)?;
        Ok(EntityRow {
            id: r.get(0)?,
            user_id: r.get(1)?,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            updated_at: DateTime::parse_from_rfc3339(&updated_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            deleted: r.get::<_, i64>(4)? != 0,
            version: r.get(5)?,
            device_id: r.get(6)?,
            fields: serde_json::from_str(&fields).unwrap_or(serde_json::Value::Null),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceId;
    use serde_json::json;

    fn sample_row(id: &str) -> EntityRow {
        EntityRow::new_create(
            id.to_string(),
            "user-1".to_string(),
            Utc::now(),
            &DeviceId("device-a".to_string()),
            json!({"name": "Run a 5k"}),
        )
    }

    #[test]
    fn put_then_get_round_trips() {
        let mut store = LocalStore::open_in_memory().unwrap();
        let row = sample_row("g1");
        store.put(EntityTable::Goal, &row).unwrap();
        let fetched = store.get(EntityTable::Goal, "g1").unwrap().unwrap();
        assert_eq!(fetched.id, "g1");
        assert_eq!(fetched.field("name"), Some(&json!("Run a 5k")));
    }

    #[test]
    fn delete_removes_row() {
        let mut store = LocalStore::open_in_memory().unwrap();
        store.put(EntityTable::Goal, &sample_row("g1")).unwrap();
        store.delete(EntityTable::Goal, "g1").unwrap();
        assert!(store.get(EntityTable::Goal, "g1").unwrap().is_none());
    }

    #[test]
    fn query_since_is_stably_ordered_and_paginates() {
        let mut store = LocalStore::open_in_memory().unwrap();
        let base = Utc::now();
        for (idx, id) in ["a", "b", "c"].iter().enumerate() {
            let mut row = sample_row(id);
            row.updated_at = base;
            row.created_at = base;
            let _ = idx;
            store.put(EntityTable::Goal, &row).unwrap();
        }
        let page = store
            .query_since(EntityTable::Goal, base - chrono::Duration::seconds(1), 2, None)
            .unwrap();
        assert_eq!(page.rows.len(), 2);
        assert_eq!(page.rows[0].id, "a");
        assert_eq!(page.rows[1].id, "b");

        let (cursor_ts, cursor_id) = page.next_cursor.unwrap();
        let page2 = store
            .query_since(EntityTable::Goal, cursor_ts, 2, Some(&cursor_id))
            .unwrap();
        assert_eq!(page2.rows.len(), 1);
        assert_eq!(page2.rows[0].id, "c");
    }

    #[test]
    fn migration_backfills_version_and_device_id() {
        let conn = Connection::open_in_memory().unwrap();
        // Simulate a pre-envelope row written before migrations ran, by going straight
        // to SQL rather than through LocalStore.
        conn.execute_batch(
            "CREATE TABLE goals (id TEXT PRIMARY KEY, user_id TEXT NOT NULL, created_at TEXT NOT NULL,
             updated_at TEXT NOT NULL, deleted INTEGER NOT NULL DEFAULT 0, version INTEGER, device_id TEXT,
             fields TEXT NOT NULL DEFAULT '{}');
             INSERT INTO goals(id, user_id, created_at, updated_at, deleted, version, device_id, fields)
             VALUES ('g1','user-1','2020-01-01T00:00:00Z','2020-01-01T00:00:00Z',0,NULL,'','{}');
             CREATE TABLE sync_kv (k TEXT PRIMARY KEY, v TEXT NOT NULL);
             INSERT INTO sync_kv(k,v) VALUES ('schema_version','1');",
        )
        .unwrap();
        let store = LocalStore { conn };
        store.run_migrations(2).unwrap();
        let row = store.get(EntityTable::Goal, "g1").unwrap().unwrap();
        assert_eq!(row.version, 1);
        assert_eq!(row.device_id, None);
    }

    #[test]
    fn query_by_index_rejects_unsafe_column_names() {
        let store = LocalStore::open_in_memory().unwrap();
        let err = store.query_by_index(EntityTable::Goal, "user_id; DROP TABLE goals", "x");
        assert!(err.is_err());
    }

    #[test]
    fn sweep_tombstones_removes_only_aged_deleted_rows() {
        let mut store = LocalStore::open_in_memory().unwrap();
        let now = Utc::now();

        let mut old_tombstone = sample_row("g1");
        old_tombstone.deleted = true;
        old_tombstone.updated_at = now - chrono::Duration::days(40);
        store.put(EntityTable::Goal, &old_tombstone).unwrap();

        let mut recent_tombstone = sample_row("g2");
        recent_tombstone.deleted = true;
        recent_tombstone.updated_at = now - chrono::Duration::days(5);
        store.put(EntityTable::Goal, &recent_tombstone).unwrap();

        let live = sample_row("g3");
        store.put(EntityTable::Goal, &live).unwrap();

        let swept = store.sweep_tombstones(now, 30).unwrap();
        assert_eq!(swept, 1);
        assert!(store.get(EntityTable::Goal, "g1").unwrap().is_none());
        assert!(store.get(EntityTable::Goal, "g2").unwrap().is_some());
        assert!(store.get(EntityTable::Goal, "g3").unwrap().is_some());
    }

    #[test]
    fn kv_round_trips_pull_cursor() {
        let store = LocalStore::open_in_memory().unwrap();
        assert_eq!(store.get_kv("pull_cursor").unwrap(), None);
        store.set_kv("pull_cursor", "2026-01-01T00:00:00Z").unwrap();
        assert_eq!(store.get_kv("pull_cursor").unwrap().as_deref(), Some("2026-01-01T00:00:00Z"));
    }
}
