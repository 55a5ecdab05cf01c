/// Tunable constants, constructed once at login and threaded through the `Engine`
/// rather than read from globals (Design Notes: "no process-wide mutable state beyond a
/// single `Engine` instance"). Defaults match the literal constants spec.md pins down.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Lower bound of the push debounce window, milliseconds (spec.md §4.4).
    pub debounce_min_ms: i64,
    /// Upper bound of the push debounce window, milliseconds.
    pub debounce_max_ms: i64,
    /// Retry ceiling before an op is dropped (spec.md §4.4).
    pub max_retries: u32,
    /// Echo-protection window: local writes within this long are shielded from their
    /// own realtime echo (spec.md §4.8, §5). Must be >= `debounce_max_ms` per spec.md §9.
    pub echo_window_ms: i64,
    /// Periodic pull-reconcile interval when the realtime channel is unhealthy
    /// (spec.md §4.6).
    pub periodic_reconcile_ms: i64,
    /// Minimum time a `syncing` status is displayed before flicking back (spec.md §4.9).
    pub status_min_display_ms: i64,
    /// Network reconnect stabilisation delay (spec.md §4.3, §5).
    pub reconnect_stabilisation_ms: i64,
    /// Realtime channel reconnect attempts before the channel is marked unhealthy
    /// (spec.md §4.8).
    pub max_realtime_reconnects: u32,
    /// Delete-acknowledgement delay while an entity is in edit-in-progress state
    /// (spec.md §4.8).
    pub delete_ack_delay_ms: i64,
    /// Age, in days, after which a `deleted=true` row is eligible for the hard-delete
    /// retention sweep (spec.md §3, and the sweep spec.md §9 recommends adding).
    pub tombstone_retention_days: i64,
    /// Page size used by pull reconcile's paged `select_since` calls.
    pub pull_page_size: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_min_ms: 1_500,
            debounce_max_ms: 2_000,
            max_retries: 5,
            echo_window_ms: 2_000,
            periodic_reconcile_ms: 15 * 60 * 1_000,
            status_min_display_ms: 500,
            reconnect_stabilisation_ms: 500,
            max_realtime_reconnects: 5,
            delete_ack_delay_ms: 500,
            tombstone_retention_days: 30,
            pull_page_size: 200,
        }
    }
}
