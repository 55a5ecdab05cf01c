use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use sync_engine::{DeviceId, Engine, EngineConfig, EntityRow, EntityTable, FakeClock, MemoryDeviceIdentityStore, RemoteEvent, RemoteEventKind};

fn make_engine() -> (Engine, Arc<FakeClock>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let store = sync_engine::LocalStore::open_in_memory().unwrap();
    let identity = MemoryDeviceIdentityStore::default();
    let clock = Arc::new(FakeClock::new(0));
    let engine = Engine::new(store, &identity, clock.clone(), EngineConfig::default(), true).unwrap();
    (engine, clock)
}

fn remote_row(id: &str, fields: serde_json::Value) -> EntityRow {
    EntityRow::new_create(id.to_string(), "user-1".into(), Utc::now(), &DeviceId("dev-b".into()), fields)
}

/// spec.md §8 property 11: a local write at t, echoed back at t+Δ<2s, produces no
/// second local mutation.
#[test]
fn echo_window_drops_the_realtime_echo_of_a_fresh_local_write() {
    let (mut engine, clock) = make_engine();
    engine.enqueue_set_field(EntityTable::Goal, "g1", "name", json!("Local")).unwrap();

    clock.advance_ms(1_000); // inside the 2s echo window
    let applied = engine
        .handle_realtime_event(RemoteEvent {
            table: EntityTable::Goal,
            entity_id: "g1".into(),
            kind: RemoteEventKind::Update { row: remote_row("g1", json!({"name": "Remote"})) },
        })
        .unwrap();
    assert!(!applied);
}

/// S5 / spec.md §8 property 7: once `deleted=true` has been accepted from remote, a
/// later stray update with `deleted=false` and an earlier timestamp cannot resurrect it.
#[test]
fn resurrection_is_impossible_after_delete_is_accepted() {
    let (mut engine, clock) = make_engine();
    clock.advance_ms(10_000);

    let mut deleted_row = remote_row("g1", json!({"name": "Old"}));
    deleted_row.deleted = true;
    let applied = engine
        .handle_realtime_event(RemoteEvent {
            table: EntityTable::Goal,
            entity_id: "g1".into(),
            kind: RemoteEventKind::Delete { row: deleted_row },
        })
        .unwrap();
    assert!(applied);
    assert!(engine.get(EntityTable::Goal, "g1").unwrap().unwrap().deleted);

    // A stray update arrives afterwards, older, with deleted=false.
    clock.advance_ms(10_000); // well past the echo window
    let mut stray = remote_row("g1", json!({"name": "Old"}));
    stray.deleted = false;
    stray.updated_at = Utc::now() - chrono::Duration::hours(1);
    engine
        .handle_realtime_event(RemoteEvent {
            table: EntityTable::Goal,
            entity_id: "g1".into(),
            kind: RemoteEventKind::Update { row: stray },
        })
        .unwrap();

    assert!(engine.get(EntityTable::Goal, "g1").unwrap().unwrap().deleted, "deleted must not be cleared by a stray update");
}

/// spec.md §4.8 edit-in-progress: a remote change arriving while an entity is marked as
/// being edited is deferred, then applied once editing ends.
#[test]
fn edit_in_progress_defers_remote_change_until_editing_ends() {
    let (mut engine, clock) = make_engine();
    clock.advance_ms(10_000); // clear of the echo window for a fresh id

    engine.mark_entity_editing(EntityTable::Goal, "g1");
    let applied = engine
        .handle_realtime_event(RemoteEvent {
            table: EntityTable::Goal,
            entity_id: "g1".into(),
            kind: RemoteEventKind::Insert { row: remote_row("g1", json!({"name": "Remote"})) },
        })
        .unwrap();
    assert!(!applied, "change must be deferred while the entity is being edited");
    assert!(engine.get(EntityTable::Goal, "g1").unwrap().is_none());

    engine.unmark_entity_editing(EntityTable::Goal, "g1").unwrap();
    assert_eq!(engine.get(EntityTable::Goal, "g1").unwrap().unwrap().field("name"), Some(&json!("Remote")));
}

/// Five consecutive channel errors mark realtime unhealthy (spec.md §4.8); a subsequent
/// successful connect resets the backoff state.
#[test]
fn channel_marks_unhealthy_after_five_errors_then_recovers() {
    let (mut engine, _clock) = make_engine();
    for _ in 0..5 {
        engine.on_channel_error();
    }
    assert_eq!(engine.status().realtime_state, sync_engine::RealtimeState::Unhealthy);

    engine.on_channel_connected();
    assert_eq!(engine.status().realtime_state, sync_engine::RealtimeState::Connected);
}
