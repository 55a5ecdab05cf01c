use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use crate::compactor::compact;
use crate::config::EngineConfig;
use crate::device::DeviceId;
use crate::envelope::EntityTable;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::oplog::{OpKind, Operation, OperationLog};
use crate::remote::{RemoteError, RemoteStore};
use crate::resolver::Resolver;
use crate::store::LocalStore;

const PULL_CURSOR_KEY_PREFIX: &str = "pull_cursor:";

/// Outcome of one push drain.
pub struct DrainReport {
    pub pushed: usize,
    pub dropped_tables: Vec<String>,
}

/// Runs push drains and pull reconciles against a [`RemoteStore`] (spec.md §4.6).
/// Grounded on the teacher's `SyncClient::sync_cycle`, which already threads a cursor
/// through injected push/pull closures — generalized here to the full `EntityTable`
/// enumeration, the tagged `Operation` outbox, and the split push-drain/pull-reconcile
/// shape the spec calls for instead of one combined cycle.
pub struct PushPullEngine<'a> {
    store: &'a mut LocalStore,
    remote: &'a dyn RemoteStore,
    config: &'a EngineConfig,
    device_id: DeviceId,
    events: &'a EventBus,
}

impl<'a> PushPullEngine<'a> {
    pub fn new(
        store: &'a mut LocalStore,
        remote: &'a dyn RemoteStore,
        config: &'a EngineConfig,
        device_id: DeviceId,
        events: &'a EventBus,
    ) -> Self {
        Self { store, remote, config, device_id, events }
    }

    /// One push drain: precondition is `online == true`, checked by the caller
    /// (`Engine`) before invoking this. Steps per spec.md §4.6: compact, fetch eligible
    /// ops, translate and send each, retire on success, backoff on failure.
    #[instrument(skip(self), fields(device_id = %self.device_id))]
    pub fn push_drain(&mut self, now: DateTime<Utc>) -> Result<DrainReport> {
        self.apply_compaction()?;

        let all_ops = OperationLog::get_all_ops(self.store)?;
        let eligible: Vec<Operation> = all_ops.into_iter().filter(|op| op.eligible_at(now)).collect();

        let mut pushed = 0usize;
        let mut dropped_tables = Vec::new();

        for op in eligible {
            match self.push_one(&op, now) {
                Ok(()) => {
                    self.store.with_tx(|tx| OperationLog::remove(tx, op.seq))?;
                    pushed += 1;
                    self.events.publish(EngineEvent::EntityChanged {
                        table: op.table.as_str(),
                        entity_id: op.entity_id.clone(),
                    });
                }
                Err(EngineError::RemoteStaleBasis { .. }) => {
                    // Remote wins silently: discard the op, pull the row back in.
                    self.store.with_tx(|tx| OperationLog::remove(tx, op.seq))?;
                    self.pull_single_row(op.table, &op.entity_id)?;
                }
                Err(err) if err.retry_class() == crate::error::RetryClass::AbsorbedAsSuccess => {
                    self.store.with_tx(|tx| OperationLog::remove(tx, op.seq))?;
                    pushed += 1;
                }
                Err(err) if err.retry_class() == crate::error::RetryClass::Fatal
                    || self.would_exceed_ceiling(&op) =>
                {
                    warn!(table = op.table.as_str(), entity_id = %op.entity_id, %err, "dropping op after exhausting retries");
                    self.store.with_tx(|tx| OperationLog::remove(tx, op.seq))?;
                    dropped_tables.push(op.table.as_str().to_string());
                }
                Err(err) => {
                    debug!(table = op.table.as_str(), entity_id = %op.entity_id, %err, "push attempt failed, will retry");
                    self.store.with_tx(|tx| OperationLog::record_failure(tx, op.seq, now))?;
                }
            }
        }

        if pushed > 0 {
            self.events.publish(EngineEvent::PostPush { pushed, dropped_tables: dropped_tables.clone() });
        }

        Ok(DrainReport { pushed, dropped_tables })
    }

    fn would_exceed_ceiling(&self, op: &Operation) -> bool {
        op.retries + 1 >= self.config.max_retries
    }

    fn apply_compaction(&mut self) -> Result<()> {
        let ops = OperationLog::get_all_ops(self.store)?;
        let compacted = compact(ops);
        self.store.with_tx(|tx| OperationLog::replace_all(tx, &compacted))
    }

    fn push_one(&mut self, op: &Operation, now: DateTime<Utc>) -> Result<()> {
        match &op.kind {
            OpKind::Create { value } => {
                let row = crate::envelope::EntityRow::new_create(
                    op.entity_id.clone(),
                    value
                        .get("user_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    now,
                    &self.device_id,
                    value.clone(),
                );
                match self.remote.insert(op.table, &row) {
                    Ok(()) | Err(RemoteError::DuplicateKey) => Ok(()),
                    Err(RemoteError::NotFound) => Ok(()),
                    Err(RemoteError::StaleBasis { current }) => {
                        Err(EngineError::RemoteStaleBasis { table: op.table.as_str().into(), entity_id: current.id })
                    }
                    Err(RemoteError::Transient(m)) => Err(EngineError::RemoteTransient(m)),
                    Err(RemoteError::Fatal(m)) => Err(EngineError::RemoteFatal(m)),
                }
            }
            OpKind::Delete => match self.remote.delete(op.table, &op.entity_id, now, self.device_id.as_str()) {
                Ok(()) | Err(RemoteError::NotFound) | Err(RemoteError::DuplicateKey) => Ok(()),
                Err(RemoteError::StaleBasis { current }) => {
                    Err(EngineError::RemoteStaleBasis { table: op.table.as_str().into(), entity_id: current.id })
                }
                Err(RemoteError::Transient(m)) => Err(EngineError::RemoteTransient(m)),
                Err(RemoteError::Fatal(m)) => Err(EngineError::RemoteFatal(m)),
            },
            OpKind::SetField { field, value } => {
                let mut fields = serde_json::Map::new();
                fields.insert(field.clone(), value.clone());
                self.push_set(op, &fields, now)
            }
            OpKind::SetMany { fields } => self.push_set(op, fields, now),
            OpKind::Increment { field, delta } => {
                // Read-modify-write against the current remote value, then write the
                // sum back with an expected-version guard (spec.md §4.6, §9).
                let current = self
                    .remote
                    .fetch(op.table, &op.entity_id)
                    .map_err(Self::map_remote_err)?;
                let Some(current) = current else {
                    return Err(EngineError::RemoteConflict("row missing for increment".into()));
                };
                let base = current.field(field).and_then(|v| v.as_f64()).unwrap_or(0.0);
                let mut fields = serde_json::Map::new();
                fields.insert(field.clone(), serde_json::Value::from(base + delta));
                match self.remote.update(
                    op.table,
                    &op.entity_id,
                    &fields,
                    now,
                    self.device_id.as_str(),
                    Some(current.version),
                ) {
                    Ok(()) => Ok(()),
                    Err(RemoteError::NotFound) | Err(RemoteError::DuplicateKey) => Ok(()),
                    Err(RemoteError::StaleBasis { current }) => {
                        Err(EngineError::RemoteStaleBasis { table: op.table.as_str().into(), entity_id: current.id })
                    }
                    Err(RemoteError::Transient(m)) => Err(EngineError::RemoteTransient(m)),
                    Err(RemoteError::Fatal(m)) => Err(EngineError::RemoteFatal(m)),
                }
            }
        }
    }

    fn push_set(
        &self,
        op: &Operation,
        fields: &serde_json::Map<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        // Before updating, check the remote basis: if remote is strictly newer than the
        // local row this op was computed against, discard and let the caller pull the
        // row back (spec.md §4.6 step 3).
        let local_basis = self.store.get(op.table, &op.entity_id)?;
        if let Some(local) = &local_basis {
            if let Ok(Some(remote_row)) = self.remote.fetch(op.table, &op.entity_id) {
                if remote_row.updated_at > local.updated_at {
                    return Err(EngineError::RemoteStaleBasis {
                        table: op.table.as_str().into(),
                        entity_id: op.entity_id.clone(),
                    });
                }
            }
        }

        match self.remote.update(op.table, &op.entity_id, fields, now, self.device_id.as_str(), None) {
            Ok(()) => Ok(()),
            Err(RemoteError::NotFound) | Err(RemoteError::DuplicateKey) => Ok(()),
            Err(RemoteError::StaleBasis { current }) => {
                Err(EngineError::RemoteStaleBasis { table: op.table.as_str().into(), entity_id: current.id })
            }
            Err(RemoteError::Transient(m)) => Err(EngineError::RemoteTransient(m)),
            Err(RemoteError::Fatal(m)) => Err(EngineError::RemoteFatal(m)),
        }
    }

    fn map_remote_err(err: RemoteError) -> EngineError {
        match err {
            RemoteError::DuplicateKey | RemoteError::NotFound => {
                EngineError::RemoteConflict("absorbed".into())
            }
            RemoteError::StaleBasis { current } => {
                EngineError::RemoteStaleBasis { table: String::new(), entity_id: current.id }
            }
            RemoteError::Transient(m) => EngineError::RemoteTransient(m),
            RemoteError::Fatal(m) => EngineError::RemoteFatal(m),
        }
    }

    fn pull_single_row(&mut self, table: EntityTable, entity_id: &str) -> Result<()> {
        let Some(remote_row) = self.remote.fetch(table, entity_id).map_err(Self::map_remote_err)? else {
            return Ok(());
        };
        let local = self.store.get(table, entity_id)?;
        let pending = OperationLog::pending_for_entity(self.store, table, entity_id)?;
        let outcome = Resolver::resolve(local.as_ref(), &remote_row, &pending, Utc::now());
        for conflict in &outcome.conflicts {
            self.store.append_conflict(conflict)?;
        }
        self.store.put(table, &outcome.merged)?;
        self.events.publish(EngineEvent::EntityChanged { table: table.as_str(), entity_id: entity_id.to_string() });
        Ok(())
    }

    /// Pull reconcile: cursor-based only, per the Open Questions guidance to prefer the
    /// incremental path universally over a "hydrate" snapshot (spec.md §9). Idempotent:
    /// running it twice with an unmoved cursor yields no additional writes. Each
    /// `EntityTable` keeps its own `(updated_at, id)` cursor; paging within a table
    /// advances strictly past that pair so a boundary run of equal timestamps is paged
    /// through exactly once rather than re-fetched or skipped (spec.md §4.6).
    #[instrument(skip(self), fields(device_id = %self.device_id))]
    pub fn pull_reconcile(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let mut pulled = 0usize;

        for table in EntityTable::ALL {
            let (cursor_ts, cursor_id) = self.current_cursor(table)?;
            let mut max_seen_ts = cursor_ts;
            let mut max_seen_id = cursor_id.clone();
            let mut page_cursor_ts = cursor_ts;
            let mut page_cursor_id = cursor_id.clone();

            loop {
                let page = self
                    .remote
                    .select_since(table, page_cursor_ts, page_cursor_id.as_deref(), self.config.pull_page_size)
                    .map_err(Self::map_remote_err)?;
                if page.rows.is_empty() {
                    break;
                }
                for remote_row in &page.rows {
                    self.ingest_pulled_row(table, remote_row, now)?;
                    pulled += 1;
                    if (remote_row.updated_at, remote_row.id.as_str())
                        > (max_seen_ts, max_seen_id.as_deref().unwrap_or(""))
                    {
                        max_seen_ts = remote_row.updated_at;
                        max_seen_id = Some(remote_row.id.clone());
                    }
                }
                match page.next_cursor {
                    Some((next_ts, next_id))
                        if (next_ts, next_id.as_str()) > (page_cursor_ts, page_cursor_id.as_deref().unwrap_or("")) =>
                    {
                        page_cursor_ts = next_ts;
                        page_cursor_id = Some(next_id);
                    }
                    _ => break,
                }
            }

            if (max_seen_ts, max_seen_id.as_deref().unwrap_or(""))
                > (cursor_ts, cursor_id.as_deref().unwrap_or(""))
            {
                self.store.set_kv(&cursor_kv_key(table), &encode_cursor(max_seen_ts, max_seen_id.as_deref()))?;
            }
        }

        if pulled > 0 {
            self.events.publish(EngineEvent::PostPull { pulled });
        }
        Ok(pulled)
    }

    fn ingest_pulled_row(
        &mut self,
        table: EntityTable,
        remote_row: &crate::envelope::EntityRow,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let local = self.store.get(table, &remote_row.id)?;
        let pending = OperationLog::pending_for_entity(self.store, table, &remote_row.id)?;
        let outcome = Resolver::resolve(local.as_ref(), remote_row, &pending, now);
        for conflict in &outcome.conflicts {
            self.store.append_conflict(conflict)?;
        }
        self.store.put(table, &outcome.merged)?;
        Ok(())
    }

    fn current_cursor(&self, table: EntityTable) -> Result<(DateTime<Utc>, Option<String>)> {
        match self.store.get_kv(&cursor_kv_key(table))? {
            Some(raw) => decode_cursor(&raw),
            None => Ok((DateTime::<Utc>::MIN_UTC, None)),
        }
    }
}

fn cursor_kv_key(table: EntityTable) -> String {
    format!("{PULL_CURSOR_KEY_PREFIX}{}", table.as_str())
}

/// `(updated_at, id)` packed as `"<rfc3339>|<id>"`; `|` never appears in an rfc3339
/// timestamp or a `select_since` id.
fn encode_cursor(ts: DateTime<Utc>, id: Option<&str>) -> String {
    format!("{}|{}", ts.to_rfc3339(), id.unwrap_or(""))
}

fn decode_cursor(raw: &str) -> Result<(DateTime<Utc>, Option<String>)> {
    let (ts_part, id_part) = raw.split_once('|').ok_or(EngineError::State("corrupt pull cursor"))?;
    let ts = DateTime::parse_from_rfc3339(ts_part)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| EngineError::State("corrupt pull cursor"))?;
    let id = if id_part.is_empty() { None } else { Some(id_part.to_string()) };
    Ok((ts, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EntityRow;
    use serde_json::json;
    use std::sync::Mutex;

    struct FakeRemote {
        rows: Mutex<std::collections::HashMap<(EntityTable, String), EntityRow>>,
        fail_next_update: Mutex<bool>,
    }

    impl FakeRemote {
        fn new() -> Self {
            Self { rows: Mutex::new(Default::default()), fail_next_update: Mutex::new(false) }
        }
    }

    impl RemoteStore for FakeRemote {
        fn insert(&self, table: EntityTable, row: &EntityRow) -> std::result::Result<(), RemoteError> {
            let mut rows = self.rows.lock().unwrap();
            let key = (table, row.id.clone());
            if rows.contains_key(&key) {
                return Err(RemoteError::DuplicateKey);
            }
            rows.insert(key, row.clone());
            Ok(())
        }

        fn update(
            &self,
            table: EntityTable,
            id: &str,
            fields: &serde_json::Map<String, serde_json::Value>,
            now: DateTime<Utc>,
            device_id: &str,
            _expected_version: Option<i64>,
        ) -> std::result::Result<(), RemoteError> {
            if *self.fail_next_update.lock().unwrap() {
                *self.fail_next_update.lock().unwrap() = false;
                return Err(RemoteError::Transient("boom".into()));
            }
            let mut rows = self.rows.lock().unwrap();
            let key = (table, id.to_string());
            let Some(row) = rows.get_mut(&key) else {
                return Err(RemoteError::NotFound);
            };
            for (k, v) in fields {
                row.set_field(k, v.clone());
            }
            row.updated_at = now;
            row.device_id = Some(device_id.to_string());
            row.version += 1;
            Ok(())
        }

        fn delete(
            &self,
            table: EntityTable,
            id: &str,
            now: DateTime<Utc>,
            device_id: &str,
        ) -> std::result::Result<(), RemoteError> {
            let mut rows = self.rows.lock().unwrap();
            let key = (table, id.to_string());
            let Some(row) = rows.get_mut(&key) else {
                return Err(RemoteError::NotFound);
            };
            row.deleted = true;
            row.updated_at = now;
            row.device_id = Some(device_id.to_string());
            Ok(())
        }

        fn fetch(&self, table: EntityTable, id: &str) -> std::result::Result<Option<EntityRow>, RemoteError> {
            Ok(self.rows.lock().unwrap().get(&(table, id.to_string())).cloned())
        }

        fn select_since(
            &self,
            table: EntityTable,
            cursor: DateTime<Utc>,
            after_id: Option<&str>,
            page_size: i64,
        ) -> std::result::Result<crate::remote::RemotePage, RemoteError> {
            let after_id = after_id.unwrap_or("");
            let mut rows: Vec<EntityRow> = self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|((t, _), r)| {
                    *t == table && (r.updated_at > cursor || (r.updated_at == cursor && r.id.as_str() > after_id))
                })
                .map(|(_, r)| r.clone())
                .collect();
            rows.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
            rows.truncate(page_size as usize);
            let next_cursor = rows.last().map(|r| (r.updated_at, r.id.clone()));
            Ok(crate::remote::RemotePage { rows, next_cursor })
        }
    }

    #[test]
    fn create_then_delete_pushes_nothing_after_compaction() {
        let mut store = LocalStore::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .with_tx(|tx| {
                OperationLog::enqueue(tx, EntityTable::Goal, "g1", OpKind::Create { value: json!({}) }, now, "dev-a")?;
                OperationLog::enqueue(tx, EntityTable::Goal, "g1", OpKind::Delete, now, "dev-a")
            })
            .unwrap();

        let remote = FakeRemote::new();
        let config = EngineConfig::default();
        let events = EventBus::new();
        let mut engine = PushPullEngine::new(&mut store, &remote, &config, DeviceId("dev-a".into()), &events);
        let report = engine.push_drain(now).unwrap();
        assert_eq!(report.pushed, 0);
        assert!(remote.rows.lock().unwrap().is_empty());
    }

    #[test]
    fn increment_counter_converges_s2_style() {
        let mut store = LocalStore::open_in_memory().unwrap();
        let now = Utc::now();
        let remote = FakeRemote::new();
        let mut base = EntityRow::new_create(
            "h1".into(),
            "user-1".into(),
            now,
            &DeviceId("dev-b".into()),
            json!({"current_value": 13}),
        );
        base.version = 4;
        remote.insert(EntityTable::Habit, &base).unwrap();

        store
            .with_tx(|tx| {
                OperationLog::enqueue(
                    tx,
                    EntityTable::Habit,
                    "h1",
                    OpKind::Increment { field: "current_value".into(), delta: 5.0 },
                    now,
                    "dev-a",
                )
            })
            .unwrap();

        let config = EngineConfig::default();
        let events = EventBus::new();
        let mut engine = PushPullEngine::new(&mut store, &remote, &config, DeviceId("dev-a".into()), &events);
        engine.push_drain(now).unwrap();

        let remote_row = remote.fetch(EntityTable::Habit, "h1").unwrap().unwrap();
        assert_eq!(remote_row.field("current_value"), Some(&json!(18.0)));
    }

    #[test]
    fn pull_reconcile_is_idempotent_when_cursor_unmoved() {
        let mut store = LocalStore::open_in_memory().unwrap();
        let now = Utc::now();
        let remote = FakeRemote::new();
        let row = EntityRow::new_create("g1".into(), "user-1".into(), now, &DeviceId("dev-b".into()), json!({"name": "Run"}));
        remote.insert(EntityTable::Goal, &row).unwrap();

        let config = EngineConfig::default();
        let events = EventBus::new();
        let mut engine = PushPullEngine::new(&mut store, &remote, &config, DeviceId("dev-a".into()), &events);
        let first = engine.pull_reconcile(now).unwrap();
        assert!(first >= 1);

        let second = engine.pull_reconcile(now).unwrap();
        assert_eq!(second, 0, "re-running with an unmoved cursor should pull nothing new");
    }
}
