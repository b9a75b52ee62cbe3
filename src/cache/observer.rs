//! Diagnostics hooks for tile store state transitions.
//!
//! Observers are purely observational. The store buffers events while it holds
//! its lock and hands them over once the lock is released, so an observer may
//! call back into the store. With no observer installed, no event is built.

use std::sync::Arc;

use serde::Serialize;
use tracing::trace;

use super::key::TileKey;

/// Kind of state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheAction {
    /// A new tile entered memory
    Added,
    /// An existing tile was re-inserted (recency refreshed)
    Updated,
    /// Capacity pressure pushed a tile out of memory
    Evicted,
    /// A tile was removed explicitly
    Removed,
    /// A tile left memory because of a flush
    Flushed,
    /// A tile was purged because its owner became unreachable
    Reaped,
}

/// A single tile store transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEvent {
    pub action: CacheAction,
    #[serde(skip)]
    pub key: TileKey,
    pub byte_size: usize,
    pub metric: Option<u64>,
}

/// Receiver of tile store transitions.
pub trait CacheObserver: Send + Sync {
    fn on_event(&self, event: &CacheEvent);
}

/// Observer that forwards every event to `tracing` at trace level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl CacheObserver for TracingObserver {
    fn on_event(&self, event: &CacheEvent) {
        trace!(
            action = ?event.action,
            key = %event.key,
            bytes = event.byte_size,
            metric = ?event.metric,
            "tile store transition"
        );
    }
}

/// Events collected inside a critical section.
pub(crate) struct EventBuffer {
    events: Option<Vec<CacheEvent>>,
}

impl EventBuffer {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            events: enabled.then(Vec::new),
        }
    }

    pub(crate) fn push(
        &mut self,
        action: CacheAction,
        key: TileKey,
        byte_size: usize,
        metric: Option<u64>,
    ) {
        if let Some(events) = self.events.as_mut() {
            events.push(CacheEvent {
                action,
                key,
                byte_size,
                metric,
            });
        }
    }

    pub(crate) fn deliver(self, observer: Option<&Arc<dyn CacheObserver>>) {
        if let (Some(events), Some(observer)) = (self.events, observer) {
            for event in &events {
                observer.on_event(event);
            }
        }
    }
}
