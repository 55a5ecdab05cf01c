use std::sync::{Arc, Mutex};

use crate::clock::Clock;

/// Reconnect stabilisation delay: wait this long after the platform reports "online"
/// before declaring a reconnect, so a flappy connection doesn't trigger a drain storm
/// (spec.md §4.3, §5).
pub const RECONNECT_STABILISATION_MS: i64 = 500;

type Hook = Box<dyn Fn() + Send + 'static>;

struct Hooks {
    on_reconnect: Vec<Hook>,
    on_disconnect: Vec<Hook>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self { on_reconnect: Vec::new(), on_disconnect: Vec::new() }
    }
}

/// Reactive "online" boolean plus reconnect/disconnect hooks. Tolerant of mobile PWA
/// quirks: a tab becoming visible while the platform says online, after having been
/// offline, is treated as a reconnect even if the platform swallowed the `online` event
/// in the background (spec.md §4.3).
pub struct NetworkMonitor {
    clock: Arc<dyn Clock>,
    state: Mutex<MonitorState>,
    hooks: Mutex<Hooks>,
}

struct MonitorState {
    online: bool,
    was_offline: bool,
    pending_reconnect_since_ms: Option<i64>,
}

impl NetworkMonitor {
    pub fn new(clock: Arc<dyn Clock>, initial_online: bool) -> Self {
        Self {
            clock,
            state: Mutex::new(MonitorState {
                online: initial_online,
                was_offline: !initial_online,
                pending_reconnect_since_ms: None,
            }),
            hooks: Mutex::new(Hooks::default()),
        }
    }

    pub fn is_online(&self) -> bool {
        self.state.lock().unwrap().online
    }

    pub fn on_reconnect(&self, f: impl Fn() + Send + 'static) {
        self.hooks.lock().unwrap().on_reconnect.push(Box::new(f));
    }

    pub fn on_disconnect(&self, f: impl Fn() + Send + 'static) {
        self.hooks.lock().unwrap().on_disconnect.push(Box::new(f));
    }

    /// The host calls this whenever the platform's online/offline signal fires.
    pub fn notify_online_changed(&self, now_online: bool) {
        let mut state = self.state.lock().unwrap();
        if now_online == state.online {
            return;
        }
        if now_online {
            state.pending_reconnect_since_ms = Some(self.clock.now_ms());
        } else {
            state.online = false;
            state.was_offline = true;
            state.pending_reconnect_since_ms = None;
            drop(state);
            self.fire_disconnect();
            return;
        }
        drop(state);
        self.maybe_fire_reconnect();
    }

    /// The host calls this on tab/app visibility transitions. A transition to visible
    /// while the platform reports online, after a prior offline period, is treated as a
    /// reconnect (spec.md §4.3's background-event-swallowing compensation).
    pub fn notify_visibility_changed(&self, visible: bool) {
        if !visible {
            return;
        }
        let should_reconnect = {
            let state = self.state.lock().unwrap();
            state.online && state.was_offline
        };
        if should_reconnect {
            let mut state = self.state.lock().unwrap();
            state.pending_reconnect_since_ms = Some(self.clock.now_ms());
            drop(state);
            self.maybe_fire_reconnect();
        }
    }

    /// Must be polled (or called after the stabilisation delay has elapsed) for the
    /// pending reconnect to actually fire. Real hosts drive this from their own timer;
    /// tests drive it by advancing a `FakeClock` and calling this directly.
    pub fn maybe_fire_reconnect(&self) {
        let should_fire = {
            let mut state = self.state.lock().unwrap();
            match state.pending_reconnect_since_ms {
                Some(since) if self.clock.now_ms() - since >= RECONNECT_STABILISATION_MS => {
                    state.online = true;
                    state.was_offline = false;
                    state.pending_reconnect_since_ms = None;
                    true
                }
                _ => false,
            }
        };
        if should_fire {
            self.fire_reconnect();
        }
    }

    fn fire_reconnect(&self) {
        for hook in &self.hooks.lock().unwrap().on_reconnect {
            hook();
        }
    }

    fn fire_disconnect(&self) {
        for hook in &self.hooks.lock().unwrap().on_disconnect {
            hook();
        }
    }
}
