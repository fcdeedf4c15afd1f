//! Embedded in-process store implementing [`KvStore`].
//!
//! Coordinates the subsystems the way an etcd server does:
//! - MVCC keyspace (revisions, transactions, event history)
//! - Lessor (TTL leases, background expiry)
//! - Watch hub (change notifications)
//!
//! Every committed write is dispatched to watchers while the keyspace write lock is
//! still held, and new watches replay history under the read lock, so a watcher never
//! misses or duplicates an event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::storage::lessor::{LeaseExpireEvent, Lessor};
use crate::storage::mvcc::KeySpace;
use crate::storage::watch::{WatchHub, WatchRange};
use crate::storage::{
    prefix_range_end, DeleteOptions, DeleteResponse, Event, EventType, KvStore, LeaseGrantResponse,
    LeaseId, LeaseKeepAliveResponse, LeaseTimeToLiveResponse, PutOptions, PutResponse,
    RangeOptions, RangeResponse, Revision, StorageError, StorageResult, Txn, TxnResponse,
    WatchOptions, WatchStream,
};

/// Configuration for the embedded store.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryStoreConfig {
    /// How often the lessor looks for expired leases.
    pub expiry_check_interval_ms: u64,

    /// Number of committed events retained for watch catch-up.
    pub history_limit: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            expiry_check_interval_ms: 100,
            history_limit: 10_000,
        }
    }
}

/// In-process store with etcd semantics.
pub struct MemoryStore {
    keyspace: RwLock<KeySpace>,
    lessor: Arc<Lessor>,
    watch_hub: Arc<WatchHub>,
    available: AtomicBool,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MemoryStore {
    /// Creates a store with default configuration. Must be called inside a tokio runtime.
    pub fn new() -> Arc<Self> {
        Self::with_config(MemoryStoreConfig::default())
    }

    /// Creates a store and starts its lease expiry tasks.
    pub fn with_config(config: MemoryStoreConfig) -> Arc<Self> {
        let store = Arc::new(Self {
            keyspace: RwLock::new(KeySpace::new(config.history_limit)),
            lessor: Arc::new(Lessor::new()),
            watch_hub: WatchHub::new(),
            available: AtomicBool::new(true),
            background_tasks: Mutex::new(Vec::new()),
        });

        let (expire_tx, expire_rx) = mpsc::channel(1000);
        let interval = Duration::from_millis(config.expiry_check_interval_ms.max(1));

        let expiry_handle =
            tokio::spawn(store.lessor.clone().run_expiry_loop(expire_tx, interval));
        let process_handle =
            tokio::spawn(process_lease_expiries(expire_rx, Arc::downgrade(&store)));
        store
            .background_tasks
            .lock()
            .extend([expiry_handle, process_handle]);

        info!(
            history_limit = config.history_limit,
            expiry_check_interval_ms = config.expiry_check_interval_ms,
            "Memory store initialized"
        );
        store
    }

    /// Simulates losing (or regaining) the store.
    ///
    /// While unavailable every request fails with [`StorageError::Unavailable`] and all
    /// open watch streams are closed. Leases keep ticking towards expiry.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            self.watch_hub.close_all();
        }
        info!(available, "Store availability changed");
    }

    pub fn current_revision(&self) -> Revision {
        self.keyspace.read().current_revision()
    }

    /// Discards retained history up to `revision`.
    pub fn compact(&self, revision: Revision) -> StorageResult<()> {
        self.keyspace.write().compact(revision)
    }

    pub fn watcher_count(&self) -> usize {
        self.watch_hub.get_watcher_count()
    }

    pub fn lease_count(&self) -> usize {
        self.lessor.count()
    }

    pub fn key_count(&self) -> usize {
        self.keyspace.read().len()
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("store is unreachable".to_string()))
        }
    }

    /// Keeps lease attachments in sync with committed events.
    fn track_leases(&self, events: &[Event]) {
        for event in events {
            if let Some(prev) = &event.prev_kv {
                let released =
                    event.event_type == EventType::Delete || prev.lease != event.kv.lease;
                if prev.lease != 0 && released {
                    self.lessor.detach(prev.lease, &prev.key);
                }
            }
            if event.event_type == EventType::Put && event.kv.lease != 0 {
                if let Err(e) = self.lessor.attach(event.kv.lease, event.kv.key.clone()) {
                    warn!(error = %e, "Failed to attach key to lease");
                }
            }
        }
    }

    /// Deletes the keys of a lease under the keyspace write lock.
    ///
    /// With `only_if_expired` the lease is left alone if it was renewed in the meantime.
    fn remove_lease(&self, id: LeaseId, only_if_expired: bool) -> StorageResult<usize> {
        let mut keyspace = self.keyspace.write();

        let keys = if only_if_expired {
            match self.lessor.revoke_if_expired(id) {
                Some(keys) => keys,
                None => return Ok(0),
            }
        } else {
            self.lessor.revoke(id)?
        };

        // All keys of one lease go away in a single revision.
        let txn = Txn::new().and_then(keys.iter().map(|key| {
            crate::storage::TxnOp::delete(key.clone(), DeleteOptions::default())
        }));
        let applied = keyspace.txn(&txn, |_| true)?;
        self.watch_hub
            .notify(&applied.events, applied.response.header.revision);

        Ok(applied.events.len())
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        for handle in self.background_tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn put(
        &self,
        key: &[u8],
        value: &[u8],
        options: PutOptions,
    ) -> StorageResult<PutResponse> {
        self.check_available()?;
        if key.is_empty() {
            return Err(StorageError::InvalidArgument("key must not be empty".to_string()));
        }

        let mut keyspace = self.keyspace.write();
        if options.lease != 0 && !self.lessor.is_live(options.lease) {
            return Err(StorageError::LeaseNotFound(options.lease));
        }

        let applied = keyspace.put(key, value, &options);
        self.track_leases(&applied.events);
        self.watch_hub
            .notify(&applied.events, applied.response.header.revision);
        Ok(applied.response)
    }

    async fn get(&self, key: &[u8], options: RangeOptions) -> StorageResult<RangeResponse> {
        self.check_available()?;
        Ok(self.keyspace.read().range(key, &options))
    }

    async fn delete(&self, key: &[u8], options: DeleteOptions) -> StorageResult<DeleteResponse> {
        self.check_available()?;

        let mut keyspace = self.keyspace.write();
        let applied = keyspace.delete(key, &options);
        self.track_leases(&applied.events);
        self.watch_hub
            .notify(&applied.events, applied.response.header.revision);
        Ok(applied.response)
    }

    async fn txn(&self, txn: Txn) -> StorageResult<TxnResponse> {
        self.check_available()?;

        let mut keyspace = self.keyspace.write();
        let applied = keyspace.txn(&txn, |lease| self.lessor.is_live(lease))?;
        self.track_leases(&applied.events);
        self.watch_hub
            .notify(&applied.events, applied.response.header.revision);
        Ok(applied.response)
    }

    async fn grant(&self, ttl: i64) -> StorageResult<LeaseGrantResponse> {
        self.check_available()?;
        let lease = self.lessor.grant(ttl)?;
        Ok(LeaseGrantResponse {
            id: lease.id,
            ttl: lease.granted_ttl,
        })
    }

    async fn revoke(&self, id: LeaseId) -> StorageResult<()> {
        self.check_available()?;
        let deleted = self.remove_lease(id, false)?;
        info!(lease_id = id, deleted_keys = deleted, "Lease revoked with key cleanup");
        Ok(())
    }

    async fn keep_alive(&self, id: LeaseId) -> StorageResult<LeaseKeepAliveResponse> {
        self.check_available()?;
        let ttl = self.lessor.renew(id)?;
        Ok(LeaseKeepAliveResponse { id, ttl })
    }

    async fn time_to_live(&self, id: LeaseId) -> StorageResult<LeaseTimeToLiveResponse> {
        self.check_available()?;
        let (ttl, granted_ttl, keys) = self.lessor.time_to_live(id)?;
        Ok(LeaseTimeToLiveResponse {
            id,
            ttl,
            granted_ttl,
            keys,
        })
    }

    async fn watch(&self, key: &[u8], options: WatchOptions) -> StorageResult<WatchStream> {
        self.check_available()?;

        let range = WatchRange {
            key: key.to_vec(),
            range_end: if options.prefix {
                prefix_range_end(key)
            } else {
                Vec::new()
            },
        };

        let (tx, rx) = mpsc::unbounded_channel();

        // Holding the read lock keeps writers out between replay and registration.
        let keyspace = self.keyspace.read();
        let start_revision = if options.start_revision > 0 {
            options.start_revision
        } else {
            keyspace.current_revision() + 1
        };

        let watcher = self.watch_hub.new_watcher(
            range,
            start_revision,
            options.filters.clone(),
            options.prev_kv,
            tx,
        );

        if start_revision <= keyspace.current_revision() {
            let backlog = keyspace.events_since(start_revision)?;
            // Replay one response per revision, like live delivery.
            let mut start = 0;
            while start < backlog.len() {
                let revision = backlog[start].kv.mod_revision;
                let end = backlog[start..]
                    .iter()
                    .position(|e| e.kv.mod_revision != revision)
                    .map(|offset| start + offset)
                    .unwrap_or(backlog.len());
                watcher.deliver(&backlog[start..end], revision);
                start = end;
            }
        }

        let watch_id = self.watch_hub.register(watcher);
        drop(keyspace);

        debug!(watch_id, key = %String::from_utf8_lossy(key), start_revision, "Watch registered");

        let hub: Weak<WatchHub> = Arc::downgrade(&self.watch_hub);
        Ok(WatchStream::new(watch_id, rx, move |id| {
            if let Some(hub) = hub.upgrade() {
                hub.cancel_watch(id);
            }
        }))
    }
}

/// Background task that deletes the keys of expired leases.
async fn process_lease_expiries(
    mut expire_rx: mpsc::Receiver<LeaseExpireEvent>,
    store: Weak<MemoryStore>,
) {
    while let Some(event) = expire_rx.recv().await {
        let Some(store) = store.upgrade() else {
            break;
        };

        match store.remove_lease(event.lease_id, true) {
            Ok(deleted) => {
                info!(lease_id = event.lease_id, deleted_keys = deleted, "Lease expired");
            }
            Err(e) => {
                warn!(lease_id = event.lease_id, error = %e, "Failed to process lease expiry");
            }
        }
    }
}
