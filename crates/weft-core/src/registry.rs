//! The stream registry: live stream id -> frame handler.
//!
//! Sharded so concurrent registration and demux lookups on different
//! streams do not contend on one lock. Shard count is a power of two; the
//! shard is picked from the stream id's low bits, which alternate with the
//! id parity and spread both local and remote streams evenly.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{Frame, WeftError};

const SHARDS: usize = 16;

/// Receives the inbound frames routed to one live stream.
pub trait FrameHandler: Send + Sync {
    /// Deliver one demultiplexed frame.
    fn handle_frame(self: Arc<Self>, frame: Frame);

    /// The connection died; fault the stream with `error`.
    ///
    /// Called at most once, after the handler has been removed from the
    /// registry.
    fn connection_terminated(self: Arc<Self>, error: WeftError);
}

pub struct StreamRegistry {
    shards: Vec<Mutex<HashMap<u32, Arc<dyn FrameHandler>>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, stream_id: u32) -> &Mutex<HashMap<u32, Arc<dyn FrameHandler>>> {
        &self.shards[(stream_id as usize) & (SHARDS - 1)]
    }

    /// Register a stream. Returns false if the id is already live.
    pub fn register(&self, stream_id: u32, handler: Arc<dyn FrameHandler>) -> bool {
        let mut shard = self.shard(stream_id).lock();
        match shard.entry(stream_id) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(handler);
                true
            }
        }
    }

    pub fn contains(&self, stream_id: u32) -> bool {
        self.shard(stream_id).lock().contains_key(&stream_id)
    }

    pub fn get(&self, stream_id: u32) -> Option<Arc<dyn FrameHandler>> {
        self.shard(stream_id).lock().get(&stream_id).cloned()
    }

    /// Remove a stream; idempotent.
    pub fn remove(&self, stream_id: u32) -> Option<Arc<dyn FrameHandler>> {
        self.shard(stream_id).lock().remove(&stream_id)
    }

    /// Drain every live stream, for connection teardown.
    ///
    /// Handlers are collected under the shard locks but returned for the
    /// caller to fault outside them, since `connection_terminated` may run
    /// arbitrary observer code.
    pub fn drain(&self) -> Vec<(u32, Arc<dyn FrameHandler>)> {
        let mut all = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock();
            all.extend(shard.drain());
        }
        all
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.lock().is_empty())
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("live", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler(AtomicUsize);

    impl FrameHandler for CountingHandler {
        fn handle_frame(self: Arc<Self>, _frame: Frame) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }

        fn connection_terminated(self: Arc<Self>, _error: WeftError) {}
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let registry = StreamRegistry::new();
        let handler = Arc::new(CountingHandler(AtomicUsize::new(0)));
        assert!(registry.register(1, handler.clone()));
        assert!(!registry.register(1, handler));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = StreamRegistry::new();
        let handler = Arc::new(CountingHandler(AtomicUsize::new(0)));
        registry.register(7, handler);
        assert!(registry.remove(7).is_some());
        assert!(registry.remove(7).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_drain_empties_all_shards() {
        let registry = StreamRegistry::new();
        for id in 1..=40 {
            registry.register(id, Arc::new(CountingHandler(AtomicUsize::new(0))));
        }
        let drained = registry.drain();
        assert_eq!(drained.len(), 40);
        assert!(registry.is_empty());
    }
}
