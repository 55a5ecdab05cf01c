use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::device::DeviceId;
use crate::envelope::{EntityRow, EntityTable};
use crate::error::{EngineError, Result};
use crate::store::LocalStore;

/// Retry ceiling: after this many failed push attempts the operation is dropped and the
/// removal reported to the status observer with the affected table name (spec.md §4.4).
pub const MAX_RETRIES: u32 = 5;

/// Debounce window bounds for `schedule_push` (spec.md §4.4, §5).
pub const DEBOUNCE_MIN_MS: i64 = 1_500;
pub const DEBOUNCE_MAX_MS: i64 = 2_000;

/// A tagged outbox operation. Modelled as a sum type over `kind` so a `Set`/`Increment`
/// record can never lack its `field`/`value`, and a `Create`/`Delete` record never
/// carries one it shouldn't (Design Notes, replacing the teacher's nullable-field
/// `Change` record in `oplog.rs`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum OpKind {
    /// Full initial row payload, minus envelope defaults.
    Create { value: Value },
    Delete,
    /// Single-field set.
    SetField { field: String, value: Value },
    /// Multi-field set.
    SetMany { fields: serde_json::Map<String, Value> },
    Increment { field: String, delta: f64 },
}

impl OpKind {
    pub fn label(&self) -> &'static str {
        match self {
            OpKind::Create { .. } => "create",
            OpKind::Delete => "delete",
            OpKind::SetField { .. } => "set",
            OpKind::SetMany { .. } => "set",
            OpKind::Increment { .. } => "increment",
        }
    }
}

/// An outbox operation record (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Operation {
    pub seq: i64,
    pub table: EntityTable,
    pub entity_id: String,
    pub kind: OpKind,
    pub timestamp: DateTime<Utc>,
    pub retries: u32,
}

impl Operation {
    /// Whether, at `now`, this operation is eligible for a push attempt: immediate for
    /// the first attempt, exponential backoff afterwards (spec.md §4.4).
    pub fn eligible_at(&self, now: DateTime<Utc>) -> bool {
        if self.retries == 0 {
            return true;
        }
        let backoff_secs = 2_i64.saturating_pow(self.retries - 1);
        (now - self.timestamp).num_seconds() >= backoff_secs
    }

    pub fn exceeded_retry_ceiling(&self) -> bool {
        self.retries >= MAX_RETRIES
    }
}

/// Append, fetch, and retire outbox operations. Generalizes the teacher's
/// `SyncEngine::{log_*, get_pending_ops, mark_ops_*}` from a single free-form `Change`
/// shape to the `Operation`/`OpKind` sum type (spec.md §3, §4.4).
pub struct OperationLog;

impl OperationLog {
    /// The single public primitive: append an outbox op *and* perform the entity
    /// mutation in the same transaction (spec.md §4.4's atomicity requirement, and the
    /// "Outbox-Entity atomicity" invariant of spec.md §3 — a committed outbox row must
    /// never exist without its matching committed entity mutation, and vice versa).
    pub fn enqueue(
        tx: &Transaction<'_>,
        table: EntityTable,
        entity_id: &str,
        kind: OpKind,
        now: DateTime<Utc>,
        device_id: &str,
    ) -> Result<i64> {
        Self::apply_entity_mutation(tx, table, entity_id, &kind, now, device_id)?;

        let value_json = match &kind {
            OpKind::Create { value } => Some(value.clone()),
            OpKind::Delete => None,
            OpKind::SetField { value, .. } => Some(value.clone()),
            OpKind::SetMany { fields } => Some(Value::Object(fields.clone())),
            OpKind::Increment { delta, .. } => Some(Value::from(*delta)),
        };
        let field = match &kind {
            OpKind::SetField { field, .. } | OpKind::Increment { field, .. } => Some(field.clone()),
            _ => None,
        };

        tx.execute(
            "INSERT INTO sync_queue (table_name, entity_id, kind, field, value, timestamp, retries)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
            params![
                table.as_str(),
                entity_id,
                kind.label(),
                field,
                value_json.map(|v| v.to_string()),
                now.to_rfc3339(),
            ],
        )?;
        Ok(tx.last_insert_rowid())
    }

    /// Applies one op's effect to the local entity row so a reader (C10) sees the
    /// mutation immediately, without waiting for a push/pull round-trip (spec.md §4.4).
    /// `set`/`increment` read-modify-write the current row's opaque `fields`; `delete`
    /// is a soft-delete (tombstone retention relies on the row staying queryable until
    /// `sweep_tombstones` reaps it).
    fn apply_entity_mutation(
        tx: &Transaction<'_>,
        table: EntityTable,
        entity_id: &str,
        kind: &OpKind,
        now: DateTime<Utc>,
        device_id: &str,
    ) -> Result<()> {
        match kind {
            OpKind::Create { value } => {
                let user_id = value.get("user_id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                let row = EntityRow::new_create(entity_id.to_string(), user_id, now, &DeviceId(device_id.to_string()), value.clone());
                LocalStore::put_tx(tx, table, &row)
            }
            OpKind::Delete => {
                if let Some(mut row) = LocalStore::get_tx(tx, table, entity_id)? {
                    row.deleted = true;
                    row.updated_at = now;
                    row.device_id = Some(device_id.to_string());
                    LocalStore::put_tx(tx, table, &row)?;
                }
                Ok(())
            }
            OpKind::SetField { field, value } => {
                let mut row = Self::row_or_blank(tx, table, entity_id, now, device_id)?;
                row.set_field(field, value.clone());
                row.updated_at = now;
                row.device_id = Some(device_id.to_string());
                LocalStore::put_tx(tx, table, &row)
            }
            OpKind::SetMany { fields } => {
                let mut row = Self::row_or_blank(tx, table, entity_id, now, device_id)?;
                for (k, v) in fields {
                    row.set_field(k, v.clone());
                }
                row.updated_at = now;
                row.device_id = Some(device_id.to_string());
                LocalStore::put_tx(tx, table, &row)
            }
            OpKind::Increment { field, delta } => {
                let mut row = Self::row_or_blank(tx, table, entity_id, now, device_id)?;
                let base = row.field(field).and_then(|v| v.as_f64()).unwrap_or(0.0);
                row.set_field(field, Value::from(base + delta));
                row.updated_at = now;
                row.device_id = Some(device_id.to_string());
                LocalStore::put_tx(tx, table, &row)
            }
        }
    }

    /// The current local row, or a freshly-minted blank one if a `set`/`increment` was
    /// somehow enqueued ahead of its `create` (defensive; the engine never does this
    /// itself, but an out-of-order replay should still converge rather than error).
    fn row_or_blank(
        tx: &Transaction<'_>,
        table: EntityTable,
        entity_id: &str,
        now: DateTime<Utc>,
        device_id: &str,
    ) -> Result<EntityRow> {
        Ok(LocalStore::get_tx(tx, table, entity_id)?.unwrap_or_else(|| EntityRow::new_create(
            entity_id.to_string(),
            String::new(),
            now,
            &DeviceId(device_id.to_string()),
            Value::Object(Default::default()),
        )))
    }

    pub fn get_pending_ops(store: &LocalStore, limit: i64) -> Result<Vec<Operation>> {
        let mut stmt = store.conn().prepare(
            "SELECT seq, table_name, entity_id, kind, field, value, timestamp, retries
             FROM sync_queue ORDER BY seq ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], Self::operation_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_all_ops(store: &LocalStore) -> Result<Vec<Operation>> {
        Self::get_pending_ops(store, i64::MAX)
    }

    pub fn pending_for_entity(
        store: &LocalStore,
        table: EntityTable,
        entity_id: &str,
    ) -> Result<Vec<Operation>> {
        let mut stmt = store.conn().prepare(
            "SELECT seq, table_name, entity_id, kind, field, value, timestamp, retries
             FROM sync_queue WHERE table_name = ?1 AND entity_id = ?2 ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map(params![table.as_str(), entity_id], Self::operation_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn remove(tx: &Transaction<'_>, seq: i64) -> Result<()> {
        tx.execute("DELETE FROM sync_queue WHERE seq = ?1", params![seq])?;
        Ok(())
    }

    /// Increment retries and refresh the timestamp after a failed push attempt
    /// (spec.md §4.4).
    pub fn record_failure(tx: &Transaction<'_>, seq: i64, now: DateTime<Utc>) -> Result<()> {
        tx.execute(
            "UPDATE sync_queue SET retries = retries + 1, timestamp = ?2 WHERE seq = ?1",
            params![seq, now.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Replace the whole outbox with a compacted sequence in one transaction
    /// (spec.md §4.5's "apply all mutations in one transaction at the end").
    pub fn replace_all(tx: &Transaction<'_>, ops: &[Operation]) -> Result<()> {
        tx.execute("DELETE FROM sync_queue", [])?;
        for op in ops {
            let value_json = match &op.kind {
                OpKind::Create { value } => Some(value.clone()),
                OpKind::Delete => None,
                OpKind::SetField { value, .. } => Some(value.clone()),
                OpKind::SetMany { fields } => Some(Value::Object(fields.clone())),
                OpKind::Increment { delta, .. } => Some(Value::from(*delta)),
            };
            let field = match &op.kind {
                OpKind::SetField { field, .. } | OpKind::Increment { field, .. } => {
                    Some(field.clone())
                }
                _ => None,
            };
            tx.execute(
                "INSERT INTO sync_queue (seq, table_name, entity_id, kind, field, value, timestamp, retries)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    op.seq,
                    op.table.as_str(),
                    op.entity_id,
                    op.kind.label(),
                    field,
                    value_json.map(|v| v.to_string()),
                    op.timestamp.to_rfc3339(),
                    op.retries,
                ],
            )?;
        }
        Ok(())
    }

    fn operation_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Operation> {
        let table_name: String = r.get(1)?;
        let kind_label: String = r.get(3)?;
        let field: Option<String> = r.get(4)?;
        let value_raw: Option<String> = r.get(5)?;
        let value: Option<Value> = value_raw
            .map(|s| serde_json::from_str(&s).unwrap_or(Value::Null));
        let timestamp: String = r.get(6)?;

        let kind = match kind_label.as_str() {
            "create" => OpKind::Create { value: value.unwrap_or(Value::Null) },
            "delete" => OpKind::Delete,
            "set" => match field {
                Some(field) => OpKind::SetField { field, value: value.unwrap_or(Value::Null) },
                None => OpKind::SetMany {
                    fields: value
                        .and_then(|v| v.as_object().cloned())
                        .unwrap_or_default(),
                },
            },
            "increment" => OpKind::Increment {
                field: field.unwrap_or_default(),
                delta: value.and_then(|v| v.as_f64()).unwrap_or(0.0),
            },
            _ => OpKind::Delete,
        };

        Ok(Operation {
            seq: r.get(0)?,
            table: EntityTable::from_str(&table_name).unwrap_or(EntityTable::Setting),
            entity_id: r.get(2)?,
            kind,
            timestamp: DateTime::parse_from_rfc3339(&timestamp)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            retries: r.get::<_, i64>(7)? as u32,
        })
    }
}

/// Owns the 1.5-2.0s debounce timer for push scheduling (spec.md §4.4). The engine owns
/// this instance (Design Notes: "module-level timers... owned by the Engine; cancelled
/// on stop; tests inject a fake clock") rather than it being a free-standing timer.
/// Because this crate has no bundled async runtime, the scheduler is *polled*: the host
/// (or the engine's own tick loop) calls `due(now)` and, when it returns `true`, runs a
/// drain. A drain already in flight sets `trailing`, ensuring at most one more drain
/// runs after the current one finishes rather than overlapping it.
pub struct PushScheduler {
    deadline_ms: Option<i64>,
    drain_in_flight: bool,
    trailing: bool,
}

impl Default for PushScheduler {
    fn default() -> Self {
        Self { deadline_ms: None, drain_in_flight: false, trailing: false }
    }
}

impl PushScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called on every enqueue. Resets the debounce timer to fire `DEBOUNCE_MAX_MS`
    /// (the upper bound absorbs a fast burst of edits) from now, unless a drain is
    /// already running, in which case it just marks a trailing drain as owed.
    pub fn schedule(&mut self, now_ms: i64) {
        if self.drain_in_flight {
            self.trailing = true;
            return;
        }
        self.deadline_ms = Some(now_ms + DEBOUNCE_MAX_MS);
    }

    /// Returns true exactly once the debounce deadline has elapsed, then clears it.
    pub fn due(&mut self, now_ms: i64) -> bool {
        if self.drain_in_flight {
            return false;
        }
        match self.deadline_ms {
            Some(deadline) if now_ms >= deadline => {
                self.deadline_ms = None;
                true
            }
            _ => false,
        }
    }

    pub fn begin_drain(&mut self) {
        self.drain_in_flight = true;
    }

    /// Called once a drain completes. If a trailing drain was requested while this one
    /// was running, immediately schedule it.
    pub fn end_drain(&mut self, now_ms: i64) {
        self.drain_in_flight = false;
        if self.trailing {
            self.trailing = false;
            self.deadline_ms = Some(now_ms + DEBOUNCE_MIN_MS);
        }
    }

    pub fn cancel(&mut self) {
        self.deadline_ms = None;
        self.trailing = false;
    }

    pub fn is_drain_in_flight(&self) -> bool {
        self.drain_in_flight
    }
}

pub fn find_op(store: &LocalStore, seq: i64) -> Result<Option<Operation>> {
    store
        .conn()
        .query_row(
            "SELECT seq, table_name, entity_id, kind, field, value, timestamp, retries
             FROM sync_queue WHERE seq = ?1",
            params![seq],
            OperationLog::operation_from_row,
        )
        .optional()
        .map_err(EngineError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn enqueue_persists_and_reads_back_create() {
        let mut store = LocalStore::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .with_tx(|tx| {
                OperationLog::enqueue(
                    tx,
                    EntityTable::Goal,
                    "g1",
                    OpKind::Create { value: json!({"name": "Run"}) },
                    now,
                    "dev-a",
                )
            })
            .unwrap();

        let ops = OperationLog::get_all_ops(&store).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].entity_id, "g1");
        assert!(matches!(ops[0].kind, OpKind::Create { .. }));

        let row = store.get(EntityTable::Goal, "g1").unwrap().unwrap();
        assert_eq!(row.field("name"), Some(&json!("Run")), "entity row must be written in the same transaction as the outbox append");
    }

    #[test]
    fn increment_roundtrips_field_and_delta() {
        let mut store = LocalStore::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .with_tx(|tx| {
                OperationLog::enqueue(
                    tx,
                    EntityTable::Habit,
                    "h1",
                    OpKind::Increment { field: "current_value".into(), delta: 3.0 },
                    now,
                    "dev-a",
                )
            })
            .unwrap();
        let ops = OperationLog::get_all_ops(&store).unwrap();
        match &ops[0].kind {
            OpKind::Increment { field, delta } => {
                assert_eq!(field, "current_value");
                assert_eq!(*delta, 3.0);
            }
            _ => panic!("expected increment"),
        }

        let row = store.get(EntityTable::Habit, "h1").unwrap().unwrap();
        assert_eq!(row.field("current_value"), Some(&json!(3.0)), "increment must read-modify-write the local row in the same transaction");
    }

    #[test]
    fn eligibility_respects_exponential_backoff() {
        let now = Utc::now();
        let mut op = Operation {
            seq: 1,
            table: EntityTable::Goal,
            entity_id: "g1".into(),
            kind: OpKind::Delete,
            timestamp: now,
            retries: 0,
        };
        assert!(op.eligible_at(now), "first attempt is immediate");

        op.retries = 3; // backoff = 2^(3-1) = 4s
        assert!(!op.eligible_at(now + chrono::Duration::seconds(3)));
        assert!(op.eligible_at(now + chrono::Duration::seconds(4)));
    }

    #[test]
    fn retry_ceiling_is_five() {
        let op = Operation {
            seq: 1,
            table: EntityTable::Goal,
            entity_id: "g1".into(),
            kind: OpKind::Delete,
            timestamp: Utc::now(),
            retries: 5,
        };
        assert!(op.exceeded_retry_ceiling());
    }

    #[test]
    fn push_scheduler_coalesces_trailing_drain() {
        let mut sched = PushScheduler::new();
        sched.schedule(0);
        assert!(!sched.due(100));
        assert!(sched.due(DEBOUNCE_MAX_MS));

        sched.begin_drain();
        // A burst of enqueues while draining collapses into exactly one trailing drain.
        sched.schedule(DEBOUNCE_MAX_MS + 10);
        sched.schedule(DEBOUNCE_MAX_MS + 20);
        assert!(!sched.due(DEBOUNCE_MAX_MS + 1000), "must not overlap in-flight drain");

        sched.end_drain(DEBOUNCE_MAX_MS + 1000);
        assert!(sched.due(DEBOUNCE_MAX_MS + 1000 + DEBOUNCE_MIN_MS));
    }
}
