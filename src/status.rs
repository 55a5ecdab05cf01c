use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Syncing,
    Offline,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub status: SyncStatus,
    pub pending_count: usize,
    pub last_error: Option<String>,
    pub last_error_details: Option<String>,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub sync_message: Option<String>,
    pub realtime_state: RealtimeState,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            status: SyncStatus::Idle,
            pending_count: 0,
            last_error: None,
            last_error_details: None,
            last_sync_time: None,
            sync_message: None,
            realtime_state: RealtimeState::Disconnected,
        }
    }
}

/// Publishes a debounced sync status (spec.md §4.9). A `status` transition into
/// `Syncing` that ends before `status_min_display_ms` elapses is held at `Syncing` until
/// the minimum has elapsed, to prevent UI flicker; redundant identical transitions are
/// dropped outright.
pub struct SyncStatusObserver {
    clock: Arc<dyn Clock>,
    min_display_ms: i64,
    current: StatusSnapshot,
    /// When the currently-displayed status started being displayed.
    displayed_since_ms: i64,
    /// A status change that arrived before the minimum display time elapsed, queued to
    /// apply once it does.
    queued: Option<SyncStatus>,
}

impl SyncStatusObserver {
    pub fn new(clock: Arc<dyn Clock>, min_display_ms: i64) -> Self {
        let now = clock.now_ms();
        Self { clock, min_display_ms, current: StatusSnapshot::default(), displayed_since_ms: now, queued: None }
    }

    pub fn snapshot(&self) -> &StatusSnapshot {
        &self.current
    }

    /// Request a status transition. Applies immediately unless the current status has
    /// been displayed for less than `min_display_ms`, in which case it's queued and
    /// `poll` must be called once the minimum elapses.
    pub fn set_status(&mut self, status: SyncStatus) {
        if status == self.current.status {
            self.queued = None;
            return;
        }
        let elapsed = self.clock.now_ms() - self.displayed_since_ms;
        if elapsed >= self.min_display_ms {
            self.apply(status);
        } else {
            self.queued = Some(status);
        }
    }

    /// Must be called periodically (or whenever the host's timer would have fired) so a
    /// queued transition can take effect once the minimum display time elapses.
    pub fn poll(&mut self) {
        if let Some(queued) = self.queued {
            let elapsed = self.clock.now_ms() - self.displayed_since_ms;
            if elapsed >= self.min_display_ms {
                self.queued = None;
                self.apply(queued);
            }
        }
    }

    fn apply(&mut self, status: SyncStatus) {
        self.current.status = status;
        self.displayed_since_ms = self.clock.now_ms();
    }

    pub fn set_pending_count(&mut self, count: usize) {
        self.current.pending_count = count;
    }

    pub fn set_last_sync_time(&mut self, time: DateTime<Utc>) {
        self.current.last_sync_time = Some(time);
    }

    pub fn set_realtime_state(&mut self, state: RealtimeState) {
        self.current.realtime_state = state;
    }

    /// Records an op exceeding the retry ceiling (spec.md §4.4, §7 kind 6): surfaces the
    /// affected table in the status message without throwing.
    pub fn report_dropped(&mut self, tables: &[String]) {
        self.current.last_error = Some("sync_op_dropped".to_string());
        self.current.last_error_details = Some(tables.join(", "));
        self.current.sync_message = Some(format!("stopped retrying changes to: {}", tables.join(", ")));
        self.set_status(SyncStatus::Error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    #[test]
    fn redundant_identical_transition_is_dropped() {
        let clock = Arc::new(FakeClock::new(0));
        let mut observer = SyncStatusObserver::new(clock, 500);
        observer.set_status(SyncStatus::Idle);
        assert_eq!(observer.snapshot().status, SyncStatus::Idle);
    }

    #[test]
    fn flicker_is_suppressed_for_at_least_min_display() {
        let clock = Arc::new(FakeClock::new(0));
        let mut observer = SyncStatusObserver::new(clock.clone(), 500);

        observer.set_status(SyncStatus::Syncing);
        assert_eq!(observer.snapshot().status, SyncStatus::Syncing);

        // Drain finishes after only 60ms; engine asks to go back to idle.
        clock.advance_ms(60);
        observer.set_status(SyncStatus::Idle);
        assert_eq!(
            observer.snapshot().status,
            SyncStatus::Syncing,
            "must still show syncing before the minimum display elapses"
        );

        clock.advance_ms(500);
        observer.poll();
        assert_eq!(observer.snapshot().status, SyncStatus::Idle);
    }

    #[test]
    fn dropped_op_reports_table_names_without_panicking() {
        let clock = Arc::new(FakeClock::new(0));
        let mut observer = SyncStatusObserver::new(clock, 500);
        observer.report_dropped(&["goals".to_string(), "tasks".to_string()]);
        assert_eq!(observer.snapshot().status, SyncStatus::Error);
        assert!(observer.snapshot().last_error_details.as_deref().unwrap().contains("goals"));
    }
}
