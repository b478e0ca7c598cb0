use crate::{stream::Stream, types::*};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
};

/// Owns every stream of one connection. Lookups take the streams lock just
/// long enough to clone the handle; callers lock the stream itself after
/// releasing the registry.
pub struct StreamCoordinator {
    next_id: AtomicU32,
    streams: Mutex<HashMap<NonZeroStreamId, Arc<Mutex<Stream>>>>,
}

impl StreamCoordinator {
    /// Client-initiated stream ids are odd, starting at 1.
    #[must_use]
    pub fn for_client() -> Self {
        Self::starting_at(1)
    }

    /// Server-initiated stream ids are even, starting at 2.
    #[must_use]
    pub fn for_server() -> Self {
        Self::starting_at(2)
    }

    fn starting_at(first: u32) -> Self {
        Self {
            next_id: AtomicU32::new(first),
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Create a locally-initiated stream under the next id. Ids advance by
    /// two and are strictly monotonic even under concurrent creation.
    pub fn allocate(&self) -> (NonZeroStreamId, Arc<Mutex<Stream>>) {
        let id = NonZeroStreamId::new(self.next_id.fetch_add(2, Ordering::SeqCst))
            .expect("stream ID wrapped");
        let stream = Arc::new(Mutex::new(Stream::new(id)));
        self.streams
            .lock()
            .expect("streams lock")
            .insert(id, stream.clone());
        (id, stream)
    }

    /// Register a peer-initiated stream under the peer's id. Returns the
    /// existing handle when the id is already known.
    pub fn insert_remote(&self, id: NonZeroStreamId) -> Arc<Mutex<Stream>> {
        self.streams
            .lock()
            .expect("streams lock")
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(Stream::new(id))))
            .clone()
    }

    #[must_use]
    pub fn get(&self, id: NonZeroStreamId) -> Option<Arc<Mutex<Stream>>> {
        self.streams.lock().expect("streams lock").get(&id).cloned()
    }

    /// Drop the registry's handle; the stream dies with its last owner.
    pub fn remove(&self, id: NonZeroStreamId) -> Option<Arc<Mutex<Stream>>> {
        self.streams.lock().expect("streams lock").remove(&id)
    }

    /// Streams above `last_stream_id`, as named by a GOAWAY frame.
    #[must_use]
    pub fn beyond(&self, last_stream_id: StreamId) -> Vec<Arc<Mutex<Stream>>> {
        self.streams
            .lock()
            .expect("streams lock")
            .iter()
            .filter(|(id, _)| id.get() > last_stream_id)
            .map(|(_, stream)| stream.clone())
            .collect()
    }

    /// Every live stream, for connection-wide teardown.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Mutex<Stream>>> {
        self.streams
            .lock()
            .expect("streams lock")
            .values()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.lock().expect("streams lock").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
