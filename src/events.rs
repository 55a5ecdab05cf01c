/// Events the engine publishes for the reactive query layer (C10) or any other
/// subscriber to react to (Design Notes: "the engine exposes an event bus...that any
/// reactive layer can subscribe to").
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    PostPush { pushed: usize, dropped_tables: Vec<String> },
    PostPull { pulled: usize },
    EntityChanged { table: &'static str, entity_id: String },
    RealtimeApplied { table: &'static str, entity_id: String },
}

type Listener = Box<dyn Fn(&EngineEvent) + Send>;

/// Minimal publish/subscribe bus. Readers outside the engine (C10) subscribe once and
/// re-query on any event that could affect their predicate; writers never touch
/// `LocalStore` directly.
#[derive(Default)]
pub struct EventBus {
    listeners: Vec<Listener>,
}

impl EventBus {
    pub fn new() -> Self {
        Self { listeners: Vec::new() }
    }

    pub fn subscribe(&mut self, listener: impl Fn(&EngineEvent) + Send + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn publish(&self, event: EngineEvent) {
        for listener in &self.listeners {
            listener(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn listeners_are_notified_on_publish() {
        let mut bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        bus.subscribe(move |_event| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(EngineEvent::PostPull { pulled: 3 });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
