use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::instrument;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::device::{DeviceId, DeviceIdentityStore};
use crate::envelope::{EntityRow, EntityTable};
use crate::error::Result;
use crate::events::{EngineEvent, EventBus};
use crate::network::NetworkMonitor;
use crate::oplog::{OpKind, OperationLog, PushScheduler};
use crate::push_pull::PushPullEngine;
use crate::query::QueryLayer;
use crate::realtime::{RemoteEvent, RealtimeIngress};
use crate::remote::RemoteStore;
use crate::status::{RealtimeState, SyncStatus, SyncStatusObserver};
use crate::store::LocalStore;

/// Composition root, constructed once at login (spec.md §4, §5: "constructed once at
/// login... no process-wide mutable state beyond a single `Engine` instance"). Owns the
/// local store, the identity/network/status subsystems, and the single push-debounce
/// timer. All public mutation entry points go through the outbox (C4); all reads are
/// expected to go through a [`QueryLayer`] borrowed from `store()`.
pub struct Engine {
    store: LocalStore,
    device_id: DeviceId,
    network: NetworkMonitor,
    status: SyncStatusObserver,
    events: EventBus,
    scheduler: PushScheduler,
    realtime: RealtimeIngress,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    stopped: bool,
}

impl Engine {
    #[instrument(skip(store, identity, clock))]
    pub fn new(
        mut store: LocalStore,
        identity: &dyn DeviceIdentityStore,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
        initial_online: bool,
    ) -> Result<Self> {
        let device_id = identity.get_or_create()?;
        store.run_migrations(crate::store::CURRENT_SCHEMA_VERSION)?;

        Ok(Self {
            store,
            device_id,
            network: NetworkMonitor::new(clock.clone(), initial_online),
            status: SyncStatusObserver::new(clock.clone(), config.status_min_display_ms),
            events: EventBus::new(),
            scheduler: PushScheduler::new(),
            realtime: RealtimeIngress::new(config.delete_ack_delay_ms.max(30_000)),
            clock,
            config,
            stopped: false,
        })
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn query(&self) -> QueryLayer<'_> {
        QueryLayer::new(&self.store)
    }

    pub fn events(&mut self) -> &mut EventBus {
        &mut self.events
    }

    pub fn status(&self) -> &crate::status::StatusSnapshot {
        self.status.snapshot()
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    /// Enqueue a create and schedule a push (spec.md §4.4's "single public primitive").
    pub fn enqueue_create(&mut self, table: EntityTable, entity_id: &str, value: Value) -> Result<()> {
        let now = Utc::now();
        let device_id = self.device_id.clone();
        self.store.with_tx(|tx| OperationLog::enqueue(tx, table, entity_id, OpKind::Create { value }, now, device_id.as_str()))?;
        self.after_enqueue(table, entity_id);
        Ok(())
    }

    pub fn enqueue_delete(&mut self, table: EntityTable, entity_id: &str) -> Result<()> {
        let now = Utc::now();
        let device_id = self.device_id.clone();
        self.store.with_tx(|tx| OperationLog::enqueue(tx, table, entity_id, OpKind::Delete, now, device_id.as_str()))?;
        self.after_enqueue(table, entity_id);
        Ok(())
    }

    pub fn enqueue_set_field(&mut self, table: EntityTable, entity_id: &str, field: &str, value: Value) -> Result<()> {
        let now = Utc::now();
        let device_id = self.device_id.clone();
        self.store.with_tx(|tx| {
            OperationLog::enqueue(tx, table, entity_id, OpKind::SetField { field: field.to_string(), value }, now, device_id.as_str())
        })?;
        self.after_enqueue(table, entity_id);
        Ok(())
    }

    pub fn enqueue_set_many(&mut self, table: EntityTable, entity_id: &str, fields: serde_json::Map<String, Value>) -> Result<()> {
        let now = Utc::now();
        let device_id = self.device_id.clone();
        self.store.with_tx(|tx| OperationLog::enqueue(tx, table, entity_id, OpKind::SetMany { fields }, now, device_id.as_str()))?;
        self.after_enqueue(table, entity_id);
        Ok(())
    }

    pub fn enqueue_increment(&mut self, table: EntityTable, entity_id: &str, field: &str, delta: f64) -> Result<()> {
        let now = Utc::now();
        let device_id = self.device_id.clone();
        self.store.with_tx(|tx| {
            OperationLog::enqueue(tx, table, entity_id, OpKind::Increment { field: field.to_string(), delta }, now, device_id.as_str())
        })?;
        self.after_enqueue(table, entity_id);
        Ok(())
    }

    fn after_enqueue(&mut self, table: EntityTable, entity_id: &str) {
        self.scheduler.schedule(self.clock.now_ms());
        self.realtime.note_local_write(table, entity_id, self.clock.now_ms());
        self.events.publish(EngineEvent::EntityChanged { table: table.as_str(), entity_id: entity_id.to_string() });
    }

    /// Must be called periodically by the host (spec.md §5's suspension-point model):
    /// fires a debounced push drain if one is due and the network is online, applies any
    /// queued sync-status transition, and sweeps realtime echo/edit-TTL bookkeeping.
    #[instrument(skip(self, remote))]
    pub fn tick(&mut self, remote: &dyn RemoteStore) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.network.maybe_fire_reconnect();
        self.status.poll();
        self.realtime.sweep(self.clock.now_ms());

        if !self.network.is_online() {
            self.status.set_realtime_state(RealtimeState::Disconnected);
            return Ok(());
        }

        if self.scheduler.due(self.clock.now_ms()) {
            self.run_push_drain(remote)?;
        }
        Ok(())
    }

    #[instrument(skip(self, remote))]
    fn run_push_drain(&mut self, remote: &dyn RemoteStore) -> Result<()> {
        self.scheduler.begin_drain();
        self.status.set_status(SyncStatus::Syncing);

        let now = Utc::now();
        let device_id = self.device_id.clone();
        let mut pp = PushPullEngine::new(&mut self.store, remote, &self.config, device_id, &self.events);
        let report = pp.push_drain(now);

        self.scheduler.end_drain(self.clock.now_ms());
        match report {
            Ok(report) => {
                if !report.dropped_tables.is_empty() {
                    self.status.report_dropped(&report.dropped_tables);
                } else {
                    self.status.set_status(SyncStatus::Idle);
                }
                self.status.set_last_sync_time(now);
                Ok(())
            }
            Err(err) => {
                self.status.set_status(SyncStatus::Error);
                Err(err)
            }
        }
    }

    /// Cursor-based pull reconcile (spec.md §4.6). Called on the periodic reconcile
    /// interval, on startup, and as the fallback when the realtime channel is unhealthy.
    #[instrument(skip(self, remote))]
    pub fn pull_reconcile(&mut self, remote: &dyn RemoteStore) -> Result<usize> {
        let now = Utc::now();
        let device_id = self.device_id.clone();
        let mut pp = PushPullEngine::new(&mut self.store, remote, &self.config, device_id, &self.events);
        let pulled = pp.pull_reconcile(now)?;
        self.status.set_last_sync_time(now);
        Ok(pulled)
    }

    /// Apply one realtime event (spec.md §4.8). The host calls this once per received
    /// channel message, in receive order.
    #[instrument(skip(self, event))]
    pub fn handle_realtime_event(&mut self, event: RemoteEvent) -> Result<bool> {
        let now = Utc::now();
        let now_ms = self.clock.now_ms();
        self.realtime.apply(&mut self.store, &self.events, event, now, now_ms)
    }

    pub fn on_channel_connecting(&mut self) {
        self.realtime.on_connecting();
        self.status.set_realtime_state(RealtimeState::Connecting);
    }

    pub fn on_channel_connected(&mut self) {
        self.realtime.on_connected();
        self.status.set_realtime_state(RealtimeState::Connected);
    }

    pub fn on_channel_error(&mut self) {
        self.realtime.on_error();
        self.status.set_realtime_state(match self.realtime.state() {
            crate::realtime::ChannelState::Unhealthy => RealtimeState::Unhealthy,
            _ => RealtimeState::Reconnecting,
        });
    }

    pub fn mark_entity_editing(&mut self, table: EntityTable, entity_id: &str) {
        self.realtime.mark_editing(table, entity_id, self.clock.now_ms());
    }

    pub fn unmark_entity_editing(&mut self, table: EntityTable, entity_id: &str) -> Result<()> {
        let deferred = self.realtime.unmark_editing(table, entity_id);
        let now = Utc::now();
        let now_ms = self.clock.now_ms();
        for kind in deferred {
            let event = RemoteEvent { table, entity_id: entity_id.to_string(), kind };
            self.realtime.apply(&mut self.store, &self.events, event, now, now_ms)?;
        }
        Ok(())
    }

    /// Housekeeping sweep: conflict-history pruning and tombstone hard-deletion
    /// (spec.md §3, and the retention sweep spec.md §9 recommends). Not on the tick hot
    /// path; the host runs this on its own (e.g. daily) cadence.
    pub fn run_retention_sweep(&mut self) -> Result<()> {
        let now = Utc::now();
        self.store.prune_conflict_history(now, self.config.tombstone_retention_days)?;
        self.store.sweep_tombstones(now, self.config.tombstone_retention_days)?;
        Ok(())
    }

    /// Logout: wipe local entity tables, outbox, conflict history, and the pull cursor
    /// (spec.md §6). Does not regenerate the device identity.
    pub fn logout(&mut self) -> Result<()> {
        self.store.clear_all_for_logout()?;
        self.scheduler.cancel();
        Ok(())
    }

    /// Cancels the debounce timer and marks the engine stopped; does not abort a
    /// mutation already submitted to remote (spec.md §5 "Cancellation").
    pub fn stop(&mut self) {
        self.scheduler.cancel();
        self.stopped = true;
    }

    /// Returns an upper bound on outstanding work, for `StatusSnapshot.pending_count`.
    pub fn refresh_pending_count(&mut self) -> Result<()> {
        let pending = OperationLog::get_all_ops(&self.store)?.len();
        self.status.set_pending_count(pending);
        Ok(())
    }

    pub fn get(&self, table: EntityTable, id: &str) -> Result<Option<EntityRow>> {
        self.store.get(table, id)
    }
}
