//! Per-sensor outbound mailbox.
//!
//! Monitors `push` without ever blocking on the consumer; a collector drains
//! at its own cadence. Events from one queue come out in emission order.

use crate::event::Event;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct EventQueue {
    events: Mutex<VecDeque<Event>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn push(&self, event: Event) {
        self.events.lock().push_back(event);
    }

    /// Takes every queued event, oldest first.
    pub fn drain(&self) -> Vec<Event> {
        let mut events = self.events.lock();
        events.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

/// Drains a fixed set of per-sensor queues.
#[derive(Debug, Clone, Default)]
pub struct EventCollector {
    queues: Vec<Arc<EventQueue>>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, queue: Arc<EventQueue>) {
        self.queues.push(queue);
    }

    /// Collects pending events queue by queue. Per-sensor order is preserved,
    /// nothing is promised about the interleaving of different sensors.
    pub fn drain_all(&self) -> Vec<Event> {
        self.queues.iter().flat_map(|queue| queue.drain()).collect()
    }
}
