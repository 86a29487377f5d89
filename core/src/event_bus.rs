//! In-process fan-out of execution events.
//!
//! Emission order is preserved per subscriber; a subscriber that lags or
//! disconnects is dropped rather than blocking the emitter. The bus keeps a
//! bounded ring of recent events for late subscribers and diagnostics.

use std::collections::VecDeque;
use std::sync::Mutex;

use pilot_protocol::ExecutionEvent;

const HISTORY_CAP: usize = 200;

pub struct EventBus {
    inner: Mutex<BusInner>,
}

struct BusInner {
    subscribers: Vec<async_channel::Sender<ExecutionEvent>>,
    history: VecDeque<ExecutionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BusInner {
                subscribers: Vec::new(),
                history: VecDeque::with_capacity(HISTORY_CAP),
            }),
        }
    }

    /// Register a subscriber. The channel is unbounded so `emit` never
    /// awaits; a dead receiver is pruned on the next emit.
    pub fn subscribe(&self) -> async_channel::Receiver<ExecutionEvent> {
        let (tx, rx) = async_channel::unbounded();
        if let Ok(mut inner) = self.inner.lock() {
            inner.subscribers.push(tx);
        }
        rx
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.history.len() == HISTORY_CAP {
            inner.history.pop_front();
        }
        inner.history.push_back(event.clone());
        inner
            .subscribers
            .retain(|tx| tx.try_send(event.clone()).is_ok());
    }

    /// The most recent events in emission order, capped at 200.
    pub fn history(&self) -> Vec<ExecutionEvent> {
        self.inner
            .lock()
            .map(|inner| inner.history.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_protocol::EventPhase;
    use pilot_protocol::EventStatus;
    use pretty_assertions::assert_eq;

    fn event(message: &str) -> ExecutionEvent {
        ExecutionEvent::new(EventPhase::Thinking, EventStatus::Progress, message)
    }

    #[test]
    fn subscribers_receive_events_in_emission_order() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        bus.emit(event("one"));
        bus.emit(event("two"));

        assert_eq!(rx.try_recv().expect("one").message, "one");
        assert_eq!(rx.try_recv().expect("two").message, "two");
    }

    #[test]
    fn dropped_subscribers_do_not_block_emission() {
        let bus = EventBus::new();
        drop(bus.subscribe());
        bus.emit(event("after drop"));
        assert_eq!(bus.history().len(), 1);
    }

    #[test]
    fn history_is_bounded() {
        let bus = EventBus::new();
        for i in 0..250 {
            bus.emit(event(&format!("e{i}")));
        }
        let history = bus.history();
        assert_eq!(history.len(), 200);
        assert_eq!(history[0].message, "e50");
        assert_eq!(history[199].message, "e249");
    }
}
