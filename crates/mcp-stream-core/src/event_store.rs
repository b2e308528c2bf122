//! Bounded in-memory event store for stream resumption.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    message::JsonRpcMessage,
    traits::{EventId, EventMessage, EventStore, EventStoreError, StreamId},
};

/// Default number of events retained per stream.
pub const DEFAULT_MAX_EVENTS_PER_STREAM: usize = 100;

#[derive(Debug, Clone)]
struct EventEntry {
    event_id: EventId,
    stream_id: StreamId,
    message: JsonRpcMessage,
}

#[derive(Debug, Default)]
struct StreamQueue {
    events: VecDeque<EventEntry>,
    /// Set once the stream has been removed from the map. Holders of a stale
    /// handle must not write through it.
    retired: bool,
}

type StreamLog = Arc<Mutex<StreamQueue>>;

/// In-memory event store keeping the last N events of every stream.
///
/// Each stream sits behind its own lock, so appends to different streams do
/// not contend. The id index has a separate lock that is always taken after a
/// stream lock, never before.
///
/// Data is lost on restart.
pub struct InMemoryEventStore {
    max_events_per_stream: usize,
    streams: RwLock<HashMap<StreamId, StreamLog>>,
    index: RwLock<HashMap<EventId, StreamId>>,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(e: PoisonError<T>) -> EventStoreError {
    EventStoreError::Internal(e.to_string())
}

impl InMemoryEventStore {
    /// Create a store with the default per-stream capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_events_per_stream(DEFAULT_MAX_EVENTS_PER_STREAM)
    }

    /// Create a store retaining at most `max_events_per_stream` events per stream (minimum 1).
    #[must_use]
    pub fn with_max_events_per_stream(max_events_per_stream: usize) -> Self {
        Self {
            max_events_per_stream: max_events_per_stream.max(1),
            streams: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
        }
    }

    /// Per-stream capacity.
    #[must_use]
    pub const fn max_events_per_stream(&self) -> usize {
        self.max_events_per_stream
    }

    fn stream(&self, stream_id: &str) -> Result<StreamLog, EventStoreError> {
        if let Some(log) = self.streams.read().map_err(poisoned)?.get(stream_id) {
            return Ok(Arc::clone(log));
        }
        let mut streams = self.streams.write().map_err(poisoned)?;
        let log = streams.entry(stream_id.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(StreamQueue {
                events: VecDeque::with_capacity(self.max_events_per_stream.min(32)),
                retired: false,
            }))
        });
        Ok(Arc::clone(log))
    }

    /// Append a message to a stream, evicting the oldest entry at capacity.
    ///
    /// # Errors
    /// Returns error only if a lock was poisoned.
    pub fn append(
        &self,
        stream_id: &str,
        message: &JsonRpcMessage,
    ) -> Result<EventId, EventStoreError> {
        loop {
            let log = self.stream(stream_id)?;
            if let Some(event_id) = self.append_to(&log, stream_id, message)? {
                return Ok(event_id);
            }
            // Removed between lookup and lock; the next lookup creates it afresh.
        }
    }

    /// Append through a stream handle. Returns `None` if the stream was retired.
    fn append_to(
        &self,
        log: &StreamLog,
        stream_id: &str,
        message: &JsonRpcMessage,
    ) -> Result<Option<EventId>, EventStoreError> {
        let mut queue = log.lock().map_err(poisoned)?;
        if queue.retired {
            return Ok(None);
        }

        let event_id = Uuid::new_v4().to_string();
        let mut index = self.index.write().map_err(poisoned)?;
        while queue.events.len() >= self.max_events_per_stream {
            let Some(oldest) = queue.events.pop_front() else {
                break;
            };
            index.remove(&oldest.event_id);
        }
        index.insert(event_id.clone(), stream_id.to_string());
        queue.events.push_back(EventEntry {
            event_id: event_id.clone(),
            stream_id: stream_id.to_string(),
            message: message.clone(),
        });

        Ok(Some(event_id))
    }

    /// Deliver the events after `last_event_id` on its stream, oldest first.
    ///
    /// Returns `Ok(None)` if the id is unknown or has been evicted. `deliver`
    /// runs while the stream is locked and must not block.
    ///
    /// # Errors
    /// Returns error only if a lock was poisoned.
    pub fn replay_after(
        &self,
        last_event_id: &str,
        deliver: &mut (dyn FnMut(EventMessage) + Send),
    ) -> Result<Option<StreamId>, EventStoreError> {
        let stream_id = self.index.read().map_err(poisoned)?.get(last_event_id).cloned();
        let Some(stream_id) = stream_id else {
            tracing::warn!(event_id = %last_event_id, "Event ID not found in store");
            return Ok(None);
        };
        let log = self.streams.read().map_err(poisoned)?.get(&stream_id).cloned();
        let Some(log) = log else {
            return Ok(None);
        };

        let queue = log.lock().map_err(poisoned)?;
        let events = &queue.events;
        // The index is read without the stream lock, so the entry may have been
        // evicted in between.
        let Some(pos) = events.iter().position(|e| e.event_id == last_event_id) else {
            tracing::warn!(event_id = %last_event_id, %stream_id, "Event evicted before replay");
            return Ok(None);
        };
        for entry in events.iter().skip(pos + 1) {
            deliver(EventMessage {
                message: entry.message.clone(),
                event_id: entry.event_id.clone(),
            });
        }
        tracing::debug!(
            event_id = %last_event_id,
            stream_id = %events[pos].stream_id,
            replayed = events.len() - pos - 1,
            "Replayed events"
        );

        Ok(Some(stream_id))
    }

    /// Drop a stream and every index entry pointing into it.
    ///
    /// # Errors
    /// Returns error only if a lock was poisoned.
    pub fn remove_stream(&self, stream_id: &str) -> Result<(), EventStoreError> {
        let Some(log) = self.streams.write().map_err(poisoned)?.remove(stream_id) else {
            return Ok(());
        };
        let mut queue = log.lock().map_err(poisoned)?;
        queue.retired = true;
        let mut index = self.index.write().map_err(poisoned)?;
        for entry in queue.events.drain(..) {
            index.remove(&entry.event_id);
        }
        Ok(())
    }

    /// Number of events currently retained on a stream.
    #[must_use]
    pub fn stream_len(&self, stream_id: &str) -> usize {
        let log = self
            .streams
            .read()
            .ok()
            .and_then(|streams| streams.get(stream_id).cloned());
        log.and_then(|log| log.lock().ok().map(|queue| queue.events.len()))
            .unwrap_or(0)
    }

    /// Number of streams with retained state.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.read().map_or(0, |streams| streams.len())
    }

    /// Whether an event id is still replayable.
    #[must_use]
    pub fn contains(&self, event_id: &str) -> bool {
        self.index
            .read()
            .is_ok_and(|index| index.contains_key(event_id))
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn store_event(
        &self,
        stream_id: &str,
        message: &JsonRpcMessage,
    ) -> Result<EventId, EventStoreError> {
        self.append(stream_id, message)
    }

    async fn replay_events_after(
        &self,
        last_event_id: &str,
        deliver: &mut (dyn FnMut(EventMessage) + Send),
    ) -> Result<Option<StreamId>, EventStoreError> {
        self.replay_after(last_event_id, deliver)
    }

    async fn forget_stream(&self, stream_id: &str) -> Result<(), EventStoreError> {
        self.remove_stream(stream_id)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use serde_json::json;

    use super::*;

    fn msg(n: i64) -> JsonRpcMessage {
        JsonRpcMessage::notification("notifications/message", Some(json!({ "n": n })))
    }

    fn collect_after(store: &InMemoryEventStore, id: &str) -> (Option<StreamId>, Vec<JsonRpcMessage>) {
        let mut seen = Vec::new();
        let stream = store
            .replay_after(id, &mut |event: EventMessage| seen.push(event.message))
            .unwrap();
        (stream, seen)
    }

    #[test]
    fn test_replay_yields_strict_suffix_in_order() {
        let store = InMemoryEventStore::new();
        let ids: Vec<_> = (1..=5).map(|n| store.append("S", &msg(n)).unwrap()).collect();

        let (stream, seen) = collect_after(&store, &ids[1]);
        assert_eq!(stream.as_deref(), Some("S"));
        assert_eq!(seen, vec![msg(3), msg(4), msg(5)]);
    }

    #[test]
    fn test_replay_after_last_event_is_empty() {
        let store = InMemoryEventStore::new();
        let last = store.append("S", &msg(1)).unwrap();

        let (stream, seen) = collect_after(&store, &last);
        assert_eq!(stream.as_deref(), Some("S"));
        assert!(seen.is_empty());
    }

    #[test]
    fn test_event_ids_are_distinct() {
        let store = InMemoryEventStore::new();
        let ids: HashSet<_> = (0..50).map(|n| store.append("S", &msg(n)).unwrap()).collect();
        assert_eq!(ids.len(), 50);
    }

    #[test]
    fn test_eviction_at_capacity() {
        let store = InMemoryEventStore::with_max_events_per_stream(2);
        let m1 = store.append("S", &msg(1)).unwrap();
        let m2 = store.append("S", &msg(2)).unwrap();
        let _m3 = store.append("S", &msg(3)).unwrap();

        assert!(!store.contains(&m1));
        assert_eq!(store.stream_len("S"), 2);

        let (stream, seen) = collect_after(&store, &m1);
        assert_eq!(stream, None);
        assert!(seen.is_empty());

        let (stream, seen) = collect_after(&store, &m2);
        assert_eq!(stream.as_deref(), Some("S"));
        assert_eq!(seen, vec![msg(3)]);
    }

    #[test]
    fn test_default_capacity_evicts_exactly_oldest() {
        let store = InMemoryEventStore::new();
        let ids: Vec<_> = (0..=100).map(|n| store.append("S", &msg(n)).unwrap()).collect();

        assert_eq!(store.stream_len("S"), DEFAULT_MAX_EVENTS_PER_STREAM);
        assert!(!store.contains(&ids[0]));
        assert!(ids[1..].iter().all(|id| store.contains(id)));
    }

    #[test]
    fn test_unknown_id_is_not_found() {
        let store = InMemoryEventStore::new();
        store.append("S", &msg(1)).unwrap();

        let (stream, seen) = collect_after(&store, "never-issued");
        assert_eq!(stream, None);
        assert!(seen.is_empty());
    }

    #[test]
    fn test_replay_stays_on_owning_stream() {
        let store = InMemoryEventStore::new();
        let a1 = store.append("A", &msg(1)).unwrap();
        store.append("B", &msg(100)).unwrap();
        store.append("A", &msg(2)).unwrap();
        store.append("B", &msg(200)).unwrap();

        let (stream, seen) = collect_after(&store, &a1);
        assert_eq!(stream.as_deref(), Some("A"));
        assert_eq!(seen, vec![msg(2)]);
    }

    #[test]
    fn test_remove_stream_forgets_ids() {
        let store = InMemoryEventStore::new();
        let a = store.append("A", &msg(1)).unwrap();
        let b = store.append("B", &msg(2)).unwrap();

        store.remove_stream("A").unwrap();
        assert!(!store.contains(&a));
        assert!(store.contains(&b));
        assert_eq!(store.stream_count(), 1);
    }

    #[test]
    fn test_stale_handle_cannot_write_after_remove() {
        let store = InMemoryEventStore::new();
        store.append("A", &msg(1)).unwrap();
        let stale = store.stream("A").unwrap();

        store.remove_stream("A").unwrap();
        assert_eq!(store.append_to(&stale, "A", &msg(2)).unwrap(), None);
        assert!(store.index.read().unwrap().is_empty());

        // A fresh append recreates the stream.
        let id = store.append("A", &msg(3)).unwrap();
        assert!(store.contains(&id));
        assert_eq!(store.stream_len("A"), 1);
    }

    #[test]
    fn test_concurrent_append_and_remove_keep_index_consistent() {
        let store = Arc::new(InMemoryEventStore::with_max_events_per_stream(5));
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for n in 0..200 {
                        store.append("S", &msg(n)).unwrap();
                    }
                })
            })
            .collect();
        let remover = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    store.remove_stream("S").unwrap();
                }
            })
        };
        for handle in writers {
            handle.join().unwrap();
        }
        remover.join().unwrap();

        // Every indexed id must point at an entry that is still queued.
        let index = store.index.read().unwrap();
        assert_eq!(index.len(), store.stream_len("S"));
        assert!(index.keys().all(|id| {
            let mut found = false;
            let log = store.streams.read().unwrap().get("S").cloned();
            if let Some(log) = log {
                found = log.lock().unwrap().events.iter().any(|e| &e.event_id == id);
            }
            found
        }));
    }

    #[test]
    fn test_concurrent_appends_keep_index_consistent() {
        let store = Arc::new(InMemoryEventStore::with_max_events_per_stream(10));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let stream = if t % 2 == 0 { "even" } else { "odd" };
                    for n in 0..100 {
                        store.append(stream, &msg(n)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.stream_len("even"), 10);
        assert_eq!(store.stream_len("odd"), 10);
        assert_eq!(store.index.read().unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_trait_object_round_trip() {
        let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        let first = tokio_test::assert_ok!(store.store_event("S", &msg(1)).await);
        tokio_test::assert_ok!(store.store_event("S", &msg(2)).await);

        let mut seen = Vec::new();
        let stream = store
            .replay_events_after(&first, &mut |event: EventMessage| seen.push(event))
            .await
            .unwrap();
        assert_eq!(stream.as_deref(), Some("S"));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].message, msg(2));
    }
}
