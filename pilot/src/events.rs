//! Per-run event fan-out.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::core::event::RunEvent;

/// Fire-and-forget emitter for one run's events.
///
/// A failed send (no observer attached) is logged and otherwise ignored.
/// Recent events other than screenshots are kept in a backlog so an observer
/// that attaches late can catch up.
#[derive(Clone)]
pub struct EventEmitter {
    run_id: Arc<str>,
    tx: broadcast::Sender<RunEvent>,
    backlog: Arc<Mutex<VecDeque<RunEvent>>>,
    backlog_limit: usize,
}

impl EventEmitter {
    pub fn new(run_id: &str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            run_id: Arc::from(run_id),
            tx,
            backlog: Arc::new(Mutex::new(VecDeque::new())),
            backlog_limit: capacity,
        }
    }

    pub fn emit(&self, event: RunEvent) {
        let kind = event.kind();
        let mut backlog = self.backlog.lock();
        if !matches!(event, RunEvent::Screenshot { .. }) {
            backlog.push_back(event.clone());
            while backlog.len() > self.backlog_limit {
                backlog.pop_front();
            }
        }
        match self.tx.send(event) {
            Ok(observers) => trace!(run_id = %self.run_id, kind, observers, "event sent"),
            Err(_) => debug!(run_id = %self.run_id, kind, "no observers, event dropped"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    /// Subscribe and return the backlog emitted so far, without gaps or duplicates.
    pub fn subscribe_with_backlog(&self) -> (Vec<RunEvent>, broadcast::Receiver<RunEvent>) {
        let backlog = self.backlog.lock();
        let rx = self.tx.subscribe();
        (backlog.iter().cloned().collect(), rx)
    }

    /// Forget buffered events, e.g. when the run restarts.
    pub fn clear_backlog(&self) {
        self.backlog.lock().clear();
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{drain_events, kinds};

    #[test]
    fn emit_without_observers_is_not_fatal() {
        let emitter = EventEmitter::new("run", 8);
        emitter.emit(RunEvent::status("hello"));
        assert_eq!(emitter.observer_count(), 0);
    }

    #[test]
    fn late_subscriber_gets_backlog_then_live_events() {
        let emitter = EventEmitter::new("run", 8);
        emitter.emit(RunEvent::status("one"));
        emitter.emit(RunEvent::Screenshot {
            data: "abc".into(),
        });
        emitter.emit(RunEvent::warning("two"));

        let (backlog, mut rx) = emitter.subscribe_with_backlog();
        emitter.emit(RunEvent::error("three"));

        assert_eq!(kinds(&backlog), vec!["status", "warning"]);
        assert_eq!(kinds(&drain_events(&mut rx)), vec!["error"]);
    }

    #[test]
    fn backlog_is_bounded() {
        let emitter = EventEmitter::new("run", 2);
        for i in 0..5 {
            emitter.emit(RunEvent::status(format!("{i}")));
        }
        let (backlog, _rx) = emitter.subscribe_with_backlog();
        assert_eq!(
            backlog,
            vec![RunEvent::status("3"), RunEvent::status("4")]
        );
    }
}
