//! Multi-Version Concurrency Control (MVCC) keyspace.
//!
//! Every write increments the global revision counter. Keys carry etcd's metadata:
//! creation revision, last modification revision and version. A bounded history of
//! committed events is retained so watchers can start from a past revision.
//!
//! All operations inside one transaction share a single revision.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;

use tracing::{debug, info};

use crate::storage::{
    prefix_range_end, DeleteOptions, DeleteResponse, Event, EventType, KeyValue, PutOptions,
    PutResponse, RangeOptions, RangeResponse, ResponseHeader, Revision, SortOrder, SortTarget,
    StorageError, StorageResult, Txn, TxnOp, TxnOpResponse, TxnResponse,
};

/// The latest state of every key plus the recent event history.
pub struct KeySpace {
    kvs: BTreeMap<Vec<u8>, KeyValue>,

    /// Current global revision (monotonically increasing)
    current_revision: Revision,

    /// Events at or below this revision are no longer retained
    compact_revision: Revision,

    /// Committed events in revision order
    history: VecDeque<Event>,

    /// Maximum number of retained events
    history_limit: usize,
}

/// Result of applying a write: the response plus the events to dispatch.
pub struct Applied<T> {
    pub response: T,
    pub events: Vec<Event>,
}

impl KeySpace {
    pub fn new(history_limit: usize) -> Self {
        info!(history_limit, "Initializing MVCC keyspace");
        Self {
            kvs: BTreeMap::new(),
            current_revision: 1,
            compact_revision: 0,
            history: VecDeque::new(),
            history_limit,
        }
    }

    pub fn current_revision(&self) -> Revision {
        self.current_revision
    }

    pub fn compact_revision(&self) -> Revision {
        self.compact_revision
    }

    pub fn len(&self) -> usize {
        self.kvs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kvs.is_empty()
    }

    pub fn get_kv(&self, key: &[u8]) -> Option<&KeyValue> {
        self.kvs.get(key)
    }

    fn header(&self) -> ResponseHeader {
        ResponseHeader {
            revision: self.current_revision,
        }
    }

    /// Resolves a (key, prefix) pair into the half-open range `[start, end)`.
    /// An empty end means "exactly this key".
    fn key_range(key: &[u8], prefix: bool) -> (Vec<u8>, Vec<u8>) {
        if prefix {
            (key.to_vec(), prefix_range_end(key))
        } else {
            (key.to_vec(), Vec::new())
        }
    }

    fn keys_in(&self, start: &[u8], end: &[u8]) -> Vec<&KeyValue> {
        if end.is_empty() {
            return self.kvs.get(start).into_iter().collect();
        }
        let upper = if end == &[0u8][..] {
            Bound::Unbounded
        } else {
            Bound::Excluded(end.to_vec())
        };
        self.kvs
            .range((Bound::Included(start.to_vec()), upper))
            .map(|(_, kv)| kv)
            .collect()
    }

    /// Performs a range query over the latest state.
    pub fn range(&self, key: &[u8], options: &RangeOptions) -> RangeResponse {
        let (start, end) = Self::key_range(key, options.prefix);

        let mut matched: Vec<&KeyValue> = self
            .keys_in(&start, &end)
            .into_iter()
            .filter(|kv| {
                options.max_create_revision <= 0
                    || kv.create_revision <= options.max_create_revision
            })
            .collect();

        if let Some((target, order)) = options.sort {
            matched.sort_by(|a, b| {
                let ordering = match target {
                    SortTarget::Key => a.key.cmp(&b.key),
                    SortTarget::CreateRevision => a.create_revision.cmp(&b.create_revision),
                    SortTarget::ModRevision => a.mod_revision.cmp(&b.mod_revision),
                };
                match order {
                    SortOrder::Ascend => ordering,
                    SortOrder::Descend => ordering.reverse(),
                }
            });
        }

        let count = matched.len();
        let kvs: Vec<KeyValue> = if options.count_only {
            Vec::new()
        } else if options.limit > 0 {
            matched.into_iter().take(options.limit).cloned().collect()
        } else {
            matched.into_iter().cloned().collect()
        };
        let more = options.limit > 0 && count > options.limit;

        RangeResponse {
            header: self.header(),
            kvs,
            count,
            more,
        }
    }

    /// Stores a single key-value pair at a new revision.
    pub fn put(&mut self, key: &[u8], value: &[u8], options: &PutOptions) -> Applied<PutResponse> {
        let revision = self.current_revision + 1;
        let (response, event) = self.put_at(revision, key, value, options);
        self.commit(revision, vec![event.clone()]);
        Applied {
            response: PutResponse {
                header: self.header(),
                ..response
            },
            events: vec![event],
        }
    }

    /// Deletes a key (or every key under a prefix) at a new revision.
    ///
    /// Deleting nothing does not consume a revision.
    pub fn delete(&mut self, key: &[u8], options: &DeleteOptions) -> Applied<DeleteResponse> {
        let revision = self.current_revision + 1;
        let (response, events) = self.delete_at(revision, key, options);
        if !events.is_empty() {
            self.commit(revision, events.clone());
        }
        Applied {
            response: DeleteResponse {
                header: self.header(),
                ..response
            },
            events,
        }
    }

    /// Executes a compare-and-branch transaction atomically.
    ///
    /// `lease_exists` is consulted for every put in the chosen branch before anything
    /// is applied, so a transaction referencing a dead lease changes nothing.
    pub fn txn(
        &mut self,
        txn: &Txn,
        lease_exists: impl Fn(i64) -> bool,
    ) -> StorageResult<Applied<TxnResponse>> {
        let succeeded = txn
            .compares
            .iter()
            .all(|cmp| cmp.evaluate(self.kvs.get(&cmp.key)));

        let ops = if succeeded { &txn.success } else { &txn.failure };

        for op in ops {
            if let TxnOp::Put { options, .. } = op {
                if options.lease != 0 && !lease_exists(options.lease) {
                    return Err(StorageError::LeaseNotFound(options.lease));
                }
            }
        }

        let has_writes = ops.iter().any(|op| op.is_write());
        let revision = self.current_revision + 1;
        let mut responses = Vec::with_capacity(ops.len());
        let mut events = Vec::new();

        for op in ops {
            match op {
                TxnOp::Put {
                    key,
                    value,
                    options,
                } => {
                    let (response, event) = self.put_at(revision, key, value, options);
                    events.push(event);
                    responses.push(TxnOpResponse::Put(response));
                }
                TxnOp::Get { key, options } => {
                    // Reads inside a txn observe the txn's own earlier writes.
                    let mut response = self.range(key, options);
                    if has_writes {
                        response.header.revision = revision;
                    }
                    responses.push(TxnOpResponse::Get(response));
                }
                TxnOp::Delete { key, options } => {
                    let (response, deleted) = self.delete_at(revision, key, options);
                    events.extend(deleted);
                    responses.push(TxnOpResponse::Delete(response));
                }
            }
        }

        if !events.is_empty() {
            self.commit(revision, events.clone());
        }

        debug!(succeeded, revision = self.current_revision, "Transaction applied");

        Ok(Applied {
            response: TxnResponse {
                header: self.header(),
                succeeded,
                responses,
            },
            events,
        })
    }

    fn put_at(
        &mut self,
        revision: Revision,
        key: &[u8],
        value: &[u8],
        options: &PutOptions,
    ) -> (PutResponse, Event) {
        let prev_kv = self.kvs.get(key).cloned();

        let kv = KeyValue {
            key: key.to_vec(),
            create_revision: prev_kv
                .as_ref()
                .map(|kv| kv.create_revision)
                .unwrap_or(revision),
            mod_revision: revision,
            version: prev_kv.as_ref().map(|kv| kv.version + 1).unwrap_or(1),
            value: value.to_vec(),
            lease: options.lease,
        };

        self.kvs.insert(key.to_vec(), kv.clone());

        debug!(key = %String::from_utf8_lossy(key), revision, lease = options.lease, "Put key");

        let response = PutResponse {
            header: ResponseHeader { revision },
            prev_kv: if options.prev_kv { prev_kv.clone() } else { None },
        };
        let event = Event {
            event_type: EventType::Put,
            kv,
            prev_kv,
        };
        (response, event)
    }

    fn delete_at(
        &mut self,
        revision: Revision,
        key: &[u8],
        options: &DeleteOptions,
    ) -> (DeleteResponse, Vec<Event>) {
        let (start, end) = Self::key_range(key, options.prefix);
        let keys: Vec<Vec<u8>> = self
            .keys_in(&start, &end)
            .into_iter()
            .map(|kv| kv.key.clone())
            .collect();

        let mut events = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(prev) = self.kvs.remove(&key) {
                events.push(Event {
                    event_type: EventType::Delete,
                    kv: KeyValue {
                        key,
                        mod_revision: revision,
                        ..Default::default()
                    },
                    prev_kv: Some(prev),
                });
            }
        }

        if !events.is_empty() {
            debug!(deleted = events.len(), revision, "Deleted keys");
        }

        let response = DeleteResponse {
            header: ResponseHeader { revision },
            deleted: events.len(),
            prev_kvs: if options.prev_kv {
                events.iter().filter_map(|e| e.prev_kv.clone()).collect()
            } else {
                Vec::new()
            },
        };
        (response, events)
    }

    fn commit(&mut self, revision: Revision, events: Vec<Event>) {
        self.current_revision = revision;
        self.history.extend(events);

        while self.history.len() > self.history_limit {
            if let Some(evicted) = self.history.pop_front() {
                self.compact_revision = self.compact_revision.max(evicted.kv.mod_revision);
            }
        }
    }

    /// Returns every retained event at or after `start_revision`.
    ///
    /// Fails with [`StorageError::Compacted`] when part of the requested history is gone.
    pub fn events_since(&self, start_revision: Revision) -> StorageResult<Vec<Event>> {
        if start_revision > self.current_revision {
            return Ok(Vec::new());
        }
        if start_revision <= self.compact_revision {
            return Err(StorageError::Compacted {
                requested: start_revision,
                compacted: self.compact_revision,
            });
        }

        Ok(self
            .history
            .iter()
            .filter(|e| e.kv.mod_revision >= start_revision)
            .cloned()
            .collect())
    }

    /// Drops retained history up to and including `revision`.
    pub fn compact(&mut self, revision: Revision) -> StorageResult<()> {
        if revision > self.current_revision {
            return Err(StorageError::InvalidArgument(
                "Cannot compact to future revision".to_string(),
            ));
        }

        while let Some(front) = self.history.front() {
            if front.kv.mod_revision > revision {
                break;
            }
            self.history.pop_front();
        }
        self.compact_revision = self.compact_revision.max(revision);

        info!(revision, "Compacted MVCC keyspace");
        Ok(())
    }
}
