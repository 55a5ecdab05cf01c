use chrono::{DateTime, Utc};

use crate::envelope::{EntityRow, EntityTable};
use crate::error::Result;
use crate::events::EngineEvent;
use crate::store::{LocalStore, Page};

/// Read-only façade over [`LocalStore`] for UI-facing reactive readers (spec.md §4.10).
/// Every read here is non-blocking from the UI's point of view: it returns whatever C1
/// holds right now, and callers re-query in response to [`EngineEvent`]s rather than
/// this layer pushing values itself — the engine owns the `EventBus` subscription.
/// Writers never go through here; they call the C4 enqueue helpers on `Engine`.
pub struct QueryLayer<'a> {
    store: &'a LocalStore,
}

impl<'a> QueryLayer<'a> {
    pub fn new(store: &'a LocalStore) -> Self {
        Self { store }
    }

    pub fn get(&self, table: EntityTable, id: &str) -> Result<Option<EntityRow>> {
        self.store.get(table, id)
    }

    pub fn by_index(&self, table: EntityTable, column: &str, value: &str) -> Result<Vec<EntityRow>> {
        self.store.query_by_index(table, column, value)
    }

    pub fn since(
        &self,
        table: EntityTable,
        cursor: DateTime<Utc>,
        page_size: i64,
        after_id: Option<&str>,
    ) -> Result<Page<EntityRow>> {
        self.store.query_since(table, cursor, page_size, after_id)
    }

    /// Whether `event` could affect a reader watching `table`/`entity_id` (or any row in
    /// `table` when `entity_id` is `None`, e.g. a list view). Readers use this to decide
    /// whether to re-query after an `EventBus` notification instead of re-querying on
    /// every single event regardless of relevance.
    pub fn event_affects(event: &EngineEvent, table: EntityTable, entity_id: Option<&str>) -> bool {
        match event {
            EngineEvent::PostPush { .. } | EngineEvent::PostPull { .. } => true,
            EngineEvent::EntityChanged { table: t, entity_id: id }
            | EngineEvent::RealtimeApplied { table: t, entity_id: id } => {
                *t == table.as_str() && entity_id.is_none_or(|wanted| wanted == id)
            }
        }
    }
}
