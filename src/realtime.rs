use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use crate::envelope::{EntityRow, EntityTable};
use crate::error::Result;
use crate::events::{EngineEvent, EventBus};
use crate::oplog::OperationLog;
use crate::resolver::Resolver;
use crate::store::LocalStore;

/// Max reconnect attempts before the channel is marked unhealthy and the periodic pull
/// reconcile tick becomes the fallback (spec.md §4.8).
pub const MAX_RECONNECTS: u32 = 5;

/// Echo-protection window: a remote event for a row written locally within this long is
/// dropped outright (spec.md §4.8 step 1, §5).
pub const ECHO_WINDOW_MS: i64 = 2_000;

/// Fixed delay before a delete is actually applied while the entity is in
/// edit-in-progress state (spec.md §4.8, matching the source's delete animation).
pub const DELETE_ACK_DELAY_MS: i64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub enum RemoteEventKind {
    Insert { row: EntityRow },
    Update { row: EntityRow },
    Delete { row: EntityRow },
}

#[derive(Debug, Clone)]
pub struct RemoteEvent {
    pub table: EntityTable,
    pub entity_id: String,
    pub kind: RemoteEventKind,
}

/// Host-provided realtime channel. A single subscription per user; events are delivered
/// through `handler` one at a time, in receive order (spec.md §4.8, §5). Grounded on the
/// teacher's `ApplyDomainOp` trait as the seam between engine-internal logic and
/// host-applied domain writes, generalised here from pull-only batches to a streaming
/// push channel.
pub trait ChannelProvider: Send + Sync {
    fn subscribe(&self, user_id: &str, handler: Box<dyn Fn(RemoteEvent) + Send>) -> Result<()>;
    fn unsubscribe(&self);
}

/// Deferred remote changes for an entity currently marked "being edited" by a UI
/// surface, applied once editing ends or a TTL elapses (spec.md §4.8).
struct PendingEdit {
    deferred: Vec<RemoteEventKind>,
    marked_at_ms: i64,
}

/// Owns the realtime channel state machine and the echo/edit-in-progress protection
/// windows. Does not own the channel subscription itself — that's `ChannelProvider` —
/// but tracks connect/error/reconnect transitions reported by the host.
pub struct RealtimeIngress {
    state: Mutex<ChannelState>,
    reconnect_attempts: Mutex<u32>,
    recently_written: Mutex<HashMap<(EntityTable, String), i64>>,
    editing: Mutex<HashMap<(EntityTable, String), PendingEdit>>,
    edit_ttl_ms: i64,
}

impl RealtimeIngress {
    pub fn new(edit_ttl_ms: i64) -> Self {
        Self {
            state: Mutex::new(ChannelState::Disconnected),
            reconnect_attempts: Mutex::new(0),
            recently_written: Mutex::new(HashMap::new()),
            editing: Mutex::new(HashMap::new()),
            edit_ttl_ms,
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock().unwrap()
    }

    pub fn on_connecting(&self) {
        *self.state.lock().unwrap() = ChannelState::Connecting;
    }

    pub fn on_connected(&self) {
        *self.state.lock().unwrap() = ChannelState::Connected;
        *self.reconnect_attempts.lock().unwrap() = 0;
    }

    /// Reports a channel error. Transitions to `Reconnecting` until `MAX_RECONNECTS` is
    /// exhausted, at which point the channel is marked `Unhealthy` and stays there until
    /// the host calls `on_connected` again after a fresh subscribe (spec.md §4.8).
    pub fn on_error(&self) {
        let mut attempts = self.reconnect_attempts.lock().unwrap();
        *attempts += 1;
        let mut state = self.state.lock().unwrap();
        *state = if *attempts >= MAX_RECONNECTS { ChannelState::Unhealthy } else { ChannelState::Reconnecting };
    }

    /// Called by the push/increment/delete path right before a remote mutation is sent,
    /// so the echo of that very mutation is recognised and dropped (spec.md §4.8 step 1).
    pub fn note_local_write(&self, table: EntityTable, entity_id: &str, now_ms: i64) {
        self.recently_written.lock().unwrap().insert((table, entity_id.to_string()), now_ms);
    }

    fn is_echo(&self, table: EntityTable, entity_id: &str, now_ms: i64) -> bool {
        match self.recently_written.lock().unwrap().get(&(table, entity_id.to_string())) {
            Some(written_at) => now_ms - written_at < ECHO_WINDOW_MS,
            None => false,
        }
    }

    /// Marks an entity as being edited by a UI surface; remote events for it are
    /// deferred instead of applied immediately.
    pub fn mark_editing(&self, table: EntityTable, entity_id: &str, now_ms: i64) {
        self.editing
            .lock()
            .unwrap()
            .entry((table, entity_id.to_string()))
            .or_insert_with(|| PendingEdit { deferred: Vec::new(), marked_at_ms: now_ms });
    }

    fn is_editing(&self, table: EntityTable, entity_id: &str, now_ms: i64) -> bool {
        match self.editing.lock().unwrap().get(&(table, entity_id.to_string())) {
            Some(pending) => now_ms - pending.marked_at_ms < self.edit_ttl_ms,
            None => false,
        }
    }

    /// Entity leaves editing state: returns the deferred events to be applied, in
    /// arrival order, and clears the pending buffer.
    pub fn unmark_editing(&self, table: EntityTable, entity_id: &str) -> Vec<RemoteEventKind> {
        self.editing
            .lock()
            .unwrap()
            .remove(&(table, entity_id.to_string()))
            .map(|p| p.deferred)
            .unwrap_or_default()
    }

    /// Apply one realtime event against the local store (spec.md §4.8 steps 1-6).
    /// Returns `true` if a local mutation happened (vs. dropped/deferred).
    #[instrument(skip(self, store, events), fields(table = event.table.as_str(), entity_id = %event.entity_id))]
    pub fn apply(
        &self,
        store: &mut LocalStore,
        events: &EventBus,
        event: RemoteEvent,
        now: DateTime<Utc>,
        now_ms: i64,
    ) -> Result<bool> {
        if self.is_echo(event.table, &event.entity_id, now_ms) {
            debug!("dropping realtime event inside echo window");
            return Ok(false);
        }

        if self.is_editing(event.table, &event.entity_id, now_ms) {
            // Deletes while editing surface as a pending indicator to the UI and only
            // apply after `DELETE_ACK_DELAY_MS` or edit-end; both paths go through this
            // same deferred buffer.
            self.editing
                .lock()
                .unwrap()
                .entry((event.table, event.entity_id.clone()))
                .and_modify(|p| p.deferred.push(event.kind.clone()))
                .or_insert_with(|| PendingEdit { deferred: vec![event.kind.clone()], marked_at_ms: now_ms });
            return Ok(false);
        }

        self.apply_now(store, events, event, now)
    }

    fn apply_now(
        &self,
        store: &mut LocalStore,
        events: &EventBus,
        event: RemoteEvent,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let remote_row = match event.kind {
            RemoteEventKind::Insert { row } | RemoteEventKind::Update { row } => row,
            RemoteEventKind::Delete { row } => row,
        };

        let local = store.get(event.table, &event.entity_id)?;
        let pending = OperationLog::pending_for_entity(store, event.table, &event.entity_id)?;

        // Always go through the resolver, even with no pending ops: the `deleted` field's
        // delete-wins rule must hold against any incoming row, not just a contested one
        // (spec.md §4.8 resurrection safety, scenario S5).
        let merged = match &local {
            None => remote_row,
            Some(_) => {
                let outcome = Resolver::resolve(local.as_ref(), &remote_row, &pending, now);
                for conflict in &outcome.conflicts {
                    store.append_conflict(conflict)?;
                }
                outcome.merged
            }
        };

        store.put(event.table, &merged)?;
        events.publish(EngineEvent::RealtimeApplied { table: event.table.as_str(), entity_id: event.entity_id.clone() });
        events.publish(EngineEvent::EntityChanged { table: event.table.as_str(), entity_id: event.entity_id });
        Ok(true)
    }

    /// Drops stale echo-protection and editing-TTL entries so the maps don't grow
    /// without bound over a long-lived session.
    pub fn sweep(&self, now_ms: i64) {
        self.recently_written.lock().unwrap().retain(|_, written_at| now_ms - *written_at < ECHO_WINDOW_MS);
        let ttl = self.edit_ttl_ms;
        let stale: Vec<_> = self
            .editing
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p)| now_ms - p.marked_at_ms >= ttl)
            .map(|(k, _)| k.clone())
            .collect();
        if stale.is_empty() {
            return;
        }
        warn!(count = stale.len(), "editing TTL expired, deferred events will apply via next reconcile");
        let mut editing = self.editing.lock().unwrap();
        for key in stale {
            editing.remove(&key);
        }
    }
}
