use chrono::{DateTime, Utc};

use crate::envelope::{EntityRow, EntityTable};

/// Outcome of a remote mutation attempt, distinguishing the idempotent-absorbed cases
/// from genuinely retriable or fatal ones (spec.md §4.6, §7).
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// `create` raced a duplicate key — already synced, treat as success.
    DuplicateKey,
    /// `delete`/`update` targeted a row the server no longer has — treat as success.
    NotFound,
    /// The row's remote `updated_at` (or `_version`) is newer than the basis this op
    /// was computed against; discard the op and pull the row back (spec.md §4.6 step 3,
    /// and the compare-and-swap hardening spec.md §9 recommends for `_version`).
    StaleBasis { current: EntityRow },
    Transient(String),
    Fatal(String),
}

/// A page of rows observed from the remote change feed or a `select_since` query.
/// `next_cursor` carries both the timestamp and the id of the last row returned, so a
/// caller paging strictly after `(updated_at, id)` never re-fetches or skips a row that
/// shares a timestamp with its neighbors.
pub struct RemotePage {
    pub rows: Vec<EntityRow>,
    pub next_cursor: Option<(DateTime<Utc>, String)>,
}

/// The remote relational store contract (spec.md §6): per-user row-level filtering,
/// `insert`/`update`/`delete`/cursor-paged `select`, `REPLICA IDENTITY FULL`-equivalent
/// full-row change events. The engine never assumes a concrete HTTP/SQL client — hosts
/// provide an implementation, the same seam the teacher's `ApplyDomainOp` trait and
/// `SyncClient::sync_cycle`'s injected `push`/`pull` closures establish for remote I/O.
pub trait RemoteStore: Send + Sync {
    fn insert(&self, table: EntityTable, row: &EntityRow) -> Result<(), RemoteError>;

    /// `expected_version` implements the compare-and-swap hardening spec.md §9
    /// recommends on top of the source's plain read-modify-write: the update is
    /// rejected with `StaleBasis` if the remote row's `_version` no longer matches.
    fn update(
        &self,
        table: EntityTable,
        id: &str,
        fields: &serde_json::Map<String, serde_json::Value>,
        now: DateTime<Utc>,
        device_id: &str,
        expected_version: Option<i64>,
    ) -> Result<(), RemoteError>;

    fn delete(
        &self,
        table: EntityTable,
        id: &str,
        now: DateTime<Utc>,
        device_id: &str,
    ) -> Result<(), RemoteError>;

    fn fetch(&self, table: EntityTable, id: &str) -> Result<Option<EntityRow>, RemoteError>;

    /// Stable `(updated_at, id)` ordered page of rows with `updated_at > cursor`, or
    /// `updated_at == cursor AND id > after_id` to fetch the remainder of a run of rows
    /// sharing the boundary timestamp (spec.md §4.6 "Egress optimisation"). Mirrors
    /// `LocalStore::query_since`'s tiebreak so paging is idempotent across runs.
    fn select_since(
        &self,
        table: EntityTable,
        cursor: DateTime<Utc>,
        after_id: Option<&str>,
        page_size: i64,
    ) -> Result<RemotePage, RemoteError>;
}
