//! In-process event log and cooperative cancellation.
//!
//! [`EventBus`] keeps the last [`RING_CAPACITY`] events for the
//! observability view and fans each event out to subscribers in append
//! order. Every event is mirrored to `tracing` as well.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};

pub const RING_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
    Success,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Success => "SUCCESS",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub ts: DateTime<Utc>,
    pub level: Level,
    pub source: String,
    pub message: String,
}

#[derive(Default)]
struct Inner {
    ring: VecDeque<Event>,
    subscribers: Vec<Sender<Event>>,
}

/// Shared, cloneable handle to the event log.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Inner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking subscriber must not take the log down with it.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, level: Level, source: &str, message: impl Into<String>) {
        let event = Event {
            ts: Utc::now(),
            level,
            source: source.to_string(),
            message: message.into(),
        };

        match level {
            Level::Debug => tracing::debug!(source, "{}", event.message),
            Level::Info | Level::Success => tracing::info!(source, level = %level, "{}", event.message),
            Level::Warn => tracing::warn!(source, "{}", event.message),
            Level::Error => tracing::error!(source, "{}", event.message),
        }

        let mut inner = self.lock();
        if inner.ring.len() == RING_CAPACITY {
            inner.ring.pop_front();
        }
        inner.ring.push_back(event.clone());
        // dropped receivers unsubscribe themselves
        inner.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn debug(&self, source: &str, message: impl Into<String>) {
        self.push(Level::Debug, source, message);
    }

    pub fn info(&self, source: &str, message: impl Into<String>) {
        self.push(Level::Info, source, message);
    }

    pub fn warn(&self, source: &str, message: impl Into<String>) {
        self.push(Level::Warn, source, message);
    }

    pub fn error(&self, source: &str, message: impl Into<String>) {
        self.push(Level::Error, source, message);
    }

    pub fn success(&self, source: &str, message: impl Into<String>) {
        self.push(Level::Success, source, message);
    }

    /// Receive every event pushed from now on, in append order.
    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = channel();
        self.lock().subscribers.push(tx);
        rx
    }

    /// Snapshot of the ring buffer, oldest first.
    pub fn recent(&self) -> Vec<Event> {
        self.lock().ring.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cooperative cancellation token shared between a caller and a worker.
#[derive(Clone, Default, Debug)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_caps_at_capacity() {
        let bus = EventBus::new();
        for i in 0..(RING_CAPACITY + 25) {
            bus.info("test", format!("event {}", i));
        }
        let events = bus.recent();
        assert_eq!(events.len(), RING_CAPACITY);
        assert_eq!(events[0].message, "event 25");
        assert_eq!(events[RING_CAPACITY - 1].message, format!("event {}", RING_CAPACITY + 24));
    }

    #[test]
    fn test_subscribers_see_append_order() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        bus.warn("store", "first");
        bus.success("orchestrator", "second");
        let a = rx.recv().unwrap();
        let b = rx.recv().unwrap();
        assert_eq!(a.message, "first");
        assert_eq!(a.level, Level::Warn);
        assert_eq!(b.message, "second");
        assert_eq!(b.level.to_string(), "SUCCESS");
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        drop(bus.subscribe());
        bus.info("x", "still works");
        assert_eq!(bus.len(), 1);
    }

    #[test]
    fn test_cancel_flag() {
        let flag = CancelFlag::new();
        let worker = flag.clone();
        assert!(!worker.is_cancelled());
        flag.cancel();
        assert!(worker.is_cancelled());
        flag.reset();
        assert!(!worker.is_cancelled());
    }
}
