//! Watch hub for managing active watchers and dispatching events.
//!
//! - DashMap for concurrent watcher registration
//! - Events of one committed revision are batched into a single response per watcher
//! - Range-based watcher matching (exact key, prefix, or open-ended)
//!
//! Watcher channels are unbounded: a dropped Delete event would leave a lock waiter
//! blocked forever, so the hub never discards events for a live watcher.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::storage::{Event, EventType, ResponseHeader, Revision, WatchFilter, WatchResponse};

/// A key range specification for watching.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct WatchRange {
    pub key: Vec<u8>,
    pub range_end: Vec<u8>,
}

impl WatchRange {
    /// Check if a key falls within this watch range.
    pub fn contains(&self, key: &[u8]) -> bool {
        if key < &self.key[..] {
            return false;
        }

        if self.range_end.is_empty() {
            // Empty range_end means only watch this exact key
            key == &self.key[..]
        } else if &self.range_end[..] == b"\0" {
            // Special case: range_end == "\0" means all keys >= key
            true
        } else {
            key < &self.range_end[..]
        }
    }
}

/// A single active watcher.
pub struct Watcher {
    pub id: i64,
    pub range: WatchRange,
    pub start_revision: Revision,
    pub filters: Vec<WatchFilter>,
    pub prev_kv: bool,
    tx: mpsc::UnboundedSender<WatchResponse>,
    canceled: AtomicBool,
}

impl Watcher {
    fn accepts(&self, event: &Event) -> bool {
        if !self.range.contains(&event.kv.key) {
            return false;
        }
        if event.kv.mod_revision < self.start_revision {
            return false;
        }
        match event.event_type {
            EventType::Put => !self.filters.contains(&WatchFilter::NoPut),
            EventType::Delete => !self.filters.contains(&WatchFilter::NoDelete),
        }
    }

    fn shape(&self, event: &Event) -> Event {
        let mut event = event.clone();
        if !self.prev_kv {
            event.prev_kv = None;
        }
        event
    }

    /// Delivers the accepted subset of `events`; returns false if the receiver is gone.
    pub fn deliver(&self, events: &[Event], revision: Revision) -> bool {
        let batch: Vec<Event> = events
            .iter()
            .filter(|e| self.accepts(e))
            .map(|e| self.shape(e))
            .collect();

        if batch.is_empty() {
            return true;
        }

        self.tx
            .send(WatchResponse {
                watch_id: self.id,
                header: ResponseHeader { revision },
                events: batch,
            })
            .is_ok()
    }
}

/// The watch hub manages all active watchers and dispatches events.
pub struct WatchHub {
    /// Map of watch_id -> Watcher
    watchers: DashMap<i64, Arc<Watcher>>,

    next_watch_id: AtomicI64,

    /// Map from WatchRange -> list of watcher IDs watching that range
    key_watchers: DashMap<WatchRange, Vec<i64>>,
}

impl WatchHub {
    pub fn new() -> Arc<Self> {
        Arc::new(WatchHub {
            watchers: DashMap::new(),
            next_watch_id: AtomicI64::new(1),
            key_watchers: DashMap::new(),
        })
    }

    /// Creates a watcher without registering it, so the caller can replay history into
    /// it before live events start flowing.
    pub fn new_watcher(
        &self,
        range: WatchRange,
        start_revision: Revision,
        filters: Vec<WatchFilter>,
        prev_kv: bool,
        tx: mpsc::UnboundedSender<WatchResponse>,
    ) -> Arc<Watcher> {
        let id = self.next_watch_id.fetch_add(1, Ordering::SeqCst);
        Arc::new(Watcher {
            id,
            range,
            start_revision,
            filters,
            prev_kv,
            tx,
            canceled: AtomicBool::new(false),
        })
    }

    /// Registers a watcher so it receives subsequent notifications.
    pub fn register(&self, watcher: Arc<Watcher>) -> i64 {
        let watch_id = watcher.id;
        self.key_watchers
            .entry(watcher.range.clone())
            .or_insert_with(Vec::new)
            .push(watch_id);
        self.watchers.insert(watch_id, watcher);

        debug!(watch_id, "Watch created");
        watch_id
    }

    /// Cancels a watch by ID. Returns false if it was not registered.
    pub fn cancel_watch(&self, watch_id: i64) -> bool {
        let Some((_, watcher)) = self.watchers.remove(&watch_id) else {
            return false;
        };
        watcher.canceled.store(true, Ordering::SeqCst);

        let mut now_empty = false;
        if let Some(mut entry) = self.key_watchers.get_mut(&watcher.range) {
            entry.retain(|id| *id != watch_id);
            now_empty = entry.is_empty();
        }
        if now_empty {
            self.key_watchers
                .remove_if(&watcher.range, |_, ids| ids.is_empty());
        }

        debug!(watch_id, "Watch canceled");
        true
    }

    /// Notifies all matching watchers of the events committed at `revision`.
    pub fn notify(&self, events: &[Event], revision: Revision) {
        if events.is_empty() {
            return;
        }

        let mut targets: HashMap<i64, Arc<Watcher>> = HashMap::new();
        for entry in self.key_watchers.iter() {
            if !events.iter().any(|e| entry.key().contains(&e.kv.key)) {
                continue;
            }
            for watch_id in entry.value() {
                if let Some(watcher) = self.watchers.get(watch_id) {
                    targets.insert(*watch_id, watcher.clone());
                }
            }
        }

        let mut gone = Vec::new();
        for (watch_id, watcher) in targets {
            if watcher.canceled.load(Ordering::SeqCst) {
                continue;
            }
            if !watcher.deliver(events, revision) {
                warn!(watch_id, "Watch receiver dropped, removing watcher");
                gone.push(watch_id);
            }
        }

        for watch_id in gone {
            self.cancel_watch(watch_id);
        }
    }

    /// Drops every watcher. Their streams end, as they would on a lost connection.
    pub fn close_all(&self) {
        let ids: Vec<i64> = self.watchers.iter().map(|entry| *entry.key()).collect();
        for watch_id in ids {
            self.cancel_watch(watch_id);
        }
    }

    /// Returns the number of active watchers.
    pub fn get_watcher_count(&self) -> usize {
        self.watchers.len()
    }

    /// Returns the number of watch ranges being monitored.
    pub fn get_watch_range_count(&self) -> usize {
        self.key_watchers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{prefix_range_end, KeyValue};

    fn put_event(key: &[u8], revision: Revision) -> Event {
        Event {
            event_type: EventType::Put,
            kv: KeyValue {
                key: key.to_vec(),
                create_revision: revision,
                mod_revision: revision,
                version: 1,
                value: b"v".to_vec(),
                lease: 0,
            },
            prev_kv: None,
        }
    }

    fn delete_event(key: &[u8], revision: Revision) -> Event {
        Event {
            event_type: EventType::Delete,
            kv: KeyValue {
                key: key.to_vec(),
                mod_revision: revision,
                ..Default::default()
            },
            prev_kv: Some(put_event(key, revision - 1).kv),
        }
    }

    #[test]
    fn test_watch_range_contains() {
        let range = WatchRange {
            key: b"foo".to_vec(),
            range_end: b"fop".to_vec(),
        };

        assert!(range.contains(b"foo"));
        assert!(range.contains(b"foobar"));
        assert!(!range.contains(b"fop"));
        assert!(!range.contains(b"aaa"));
        assert!(!range.contains(b"fon"));
    }

    #[test]
    fn test_watch_range_exact_key() {
        let range = WatchRange {
            key: b"foo/".to_vec(),
            range_end: Vec::new(),
        };

        assert!(range.contains(b"foo/"));
        assert!(!range.contains(b"foo0"));
        assert!(!range.contains(b"foo"));
    }

    #[test]
    fn test_watch_range_all_keys() {
        let range = WatchRange {
            key: b"".to_vec(),
            range_end: b"\0".to_vec(),
        };

        assert!(range.contains(b"aaa"));
        assert!(range.contains(b"zzz"));
        assert!(range.contains(b""));
    }

    #[tokio::test]
    async fn test_create_and_cancel_watch() {
        let hub = WatchHub::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let watcher = hub.new_watcher(
            WatchRange {
                key: b"key".to_vec(),
                range_end: Vec::new(),
            },
            0,
            vec![],
            false,
            tx,
        );
        let watch_id = hub.register(watcher);

        assert_eq!(watch_id, 1);
        assert_eq!(hub.get_watcher_count(), 1);
        assert_eq!(hub.get_watch_range_count(), 1);

        assert!(hub.cancel_watch(watch_id));
        assert!(!hub.cancel_watch(watch_id));
        assert_eq!(hub.get_watcher_count(), 0);
        assert_eq!(hub.get_watch_range_count(), 0);
    }

    #[tokio::test]
    async fn test_notify_prefix_with_filter_and_prev_kv() {
        let hub = WatchHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let watcher = hub.new_watcher(
            WatchRange {
                key: b"svc-".to_vec(),
                range_end: prefix_range_end(b"svc-"),
            },
            0,
            vec![WatchFilter::NoPut],
            false,
            tx,
        );
        hub.register(watcher);

        hub.notify(&[put_event(b"svc-1", 5)], 5);
        hub.notify(&[delete_event(b"svc-1", 6), delete_event(b"other", 6)], 6);

        let response = rx.recv().await.unwrap();
        assert_eq!(response.header.revision, 6);
        assert_eq!(response.events.len(), 1);
        assert_eq!(response.events[0].event_type, EventType::Delete);
        assert!(response.events[0].prev_kv.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_revision_skips_older_events() {
        let hub = WatchHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let watcher = hub.new_watcher(
            WatchRange {
                key: b"k".to_vec(),
                range_end: Vec::new(),
            },
            10,
            vec![],
            true,
            tx,
        );
        hub.register(watcher);

        hub.notify(&[put_event(b"k", 9)], 9);
        hub.notify(&[delete_event(b"k", 10)], 10);

        let response = rx.recv().await.unwrap();
        assert_eq!(response.header.revision, 10);
        assert!(response.events[0].prev_kv.is_some());
    }

    #[tokio::test]
    async fn test_close_all_ends_streams() {
        let hub = WatchHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = hub.new_watcher(
            WatchRange {
                key: b"k".to_vec(),
                range_end: Vec::new(),
            },
            0,
            vec![],
            false,
            tx,
        );
        hub.register(watcher);

        hub.close_all();
        assert_eq!(hub.get_watcher_count(), 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned() {
        let hub = WatchHub::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = hub.new_watcher(
            WatchRange {
                key: b"k".to_vec(),
                range_end: Vec::new(),
            },
            0,
            vec![],
            false,
            tx,
        );
        hub.register(watcher);
        drop(rx);

        hub.notify(&[put_event(b"k", 3)], 3);
        assert_eq!(hub.get_watcher_count(), 0);
    }
}
