//! Lease-bound distributed mutex.
//!
//! Every contender for a resource writes its own key
//! `<namespace>/<resource>/<lease-id-hex>` bound to its lease. The key with the
//! smallest creation revision under the resource prefix owns the lock. A contender
//! that does not own it watches only the key created immediately before its own and
//! retries once that key is deleted, so waiters are served in arrival order and each
//! release wakes exactly one waiter.
//!
//! State machine:
//!
//! ```text
//! Idle -> Attempting -> Held -> Idle        (unlock)
//!         Attempting -> Waiting -> Attempting (contention)
//!                       Held -> Idle        (lease expiry, seen on unlock / is_owner)
//! ```

use std::future::Future;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::error::{Error, Result};
use crate::lease::LeaseHandle;
use crate::storage::{
    Compare, CompareResult, DeleteOptions, EventType, KeyValue, PutOptions, RangeOptions,
    RangeResponse, Revision, StorageError, Txn, TxnOp, TxnResponse, WatchFilter, WatchOptions,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    Idle,
    Attempting,
    Waiting,
    Held,
}

#[derive(Debug)]
struct Session {
    state: LockState,
    /// Creation revision of our key, 0 when we have none.
    revision: Revision,
}

/// Distributed mutex over one resource, bound to one lease.
pub struct Mutex {
    client: Client,
    lease: LeaseHandle,
    resource: String,
    prefix: String,
    key: String,
    session: RwLock<Session>,
}

/// Outcome of one acquisition attempt.
struct Attempt {
    revision: Revision,
    owner_revision: Revision,
}

impl Mutex {
    pub fn new(client: Client, lease: LeaseHandle, resource: impl Into<String>) -> Self {
        let resource = resource.into();
        let prefix = format!("{}/{}/", client.config().lock_namespace, resource);
        let key = format!("{}{:x}", prefix, lease.id());

        Self {
            client,
            lease,
            resource,
            prefix,
            key,
            session: RwLock::new(Session {
                state: LockState::Idle,
                revision: 0,
            }),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The key this session writes while contending.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> LockState {
        self.session.read().state
    }

    pub fn lease(&self) -> &LeaseHandle {
        &self.lease
    }

    fn set_state(&self, state: LockState) {
        self.session.write().state = state;
    }

    fn reset(&self) {
        let mut session = self.session.write();
        session.state = LockState::Idle;
        session.revision = 0;
    }

    /// Blocks until the lock is held. May wait forever under contention.
    pub async fn lock(&self) -> Result<()> {
        self.lock_until(std::future::pending::<()>()).await
    }

    /// Blocks until the lock is held or `cancel` completes.
    ///
    /// On cancellation returns [`Error::Cancelled`]; if the lease dies while waiting
    /// returns [`Error::LeaseInvalid`]. Either way this session's key is removed so it
    /// does not hold up later contenders.
    pub async fn lock_until<F: Future>(&self, cancel: F) -> Result<()> {
        if !self.lease.is_valid() {
            return Err(Error::LeaseInvalid(self.lease.id()));
        }
        if self.state() == LockState::Held {
            return Ok(());
        }

        let cancel = std::pin::pin!(cancel);
        let result = tokio::select! {
            result = self.acquire() => result,
            _ = cancel => Err(Error::Cancelled),
            _ = self.lease.expired() => Err(Error::LeaseInvalid(self.lease.id())),
        };

        if let Err(e) = &result {
            warn!(key = %self.key, error = %e, "Lock acquisition failed");
            self.abandon().await;
        }
        result
    }

    /// Acquires the lock only if nobody else holds it.
    ///
    /// Returns [`Error::Contended`] when another session owns the lock.
    pub async fn try_lock(&self) -> Result<()> {
        if !self.lease.is_valid() {
            return Err(Error::LeaseInvalid(self.lease.id()));
        }
        if self.state() == LockState::Held {
            return Ok(());
        }

        self.set_state(LockState::Attempting);
        let attempt = match self.attempt().await {
            Ok(attempt) => attempt,
            Err(e) => {
                self.reset();
                return Err(e);
            }
        };

        if attempt.owner_revision == attempt.revision {
            self.set_state(LockState::Held);
            info!(key = %self.key, revision = attempt.revision, "Lock acquired");
            return Ok(());
        }

        self.abandon().await;
        debug!(key = %self.key, "Lock is contended");
        Err(Error::Contended(self.resource.clone()))
    }

    /// Releases the lock.
    ///
    /// Fails with [`Error::NotHeld`] if the lock is not held, and with
    /// [`Error::LeaseInvalid`] if the key had already been removed by lease expiry.
    pub async fn unlock(&self) -> Result<()> {
        if self.state() != LockState::Held {
            return Err(Error::NotHeld(self.key.clone()));
        }

        let response = self.client.delete(&self.key, DeleteOptions::default()).await?;
        self.reset();

        if response.deleted == 0 {
            warn!(key = %self.key, "Lock key already gone, lease expired while held");
            return Err(Error::LeaseInvalid(self.lease.id()));
        }

        info!(key = %self.key, revision = response.header.revision, "Lock released");
        Ok(())
    }

    /// Checks with the store whether this session still owns the lock.
    pub async fn is_owner(&self) -> Result<bool> {
        let revision = {
            let session = self.session.read();
            if session.state != LockState::Held {
                return Ok(false);
            }
            session.revision
        };

        let owner = self.current_holder().await?;
        let owned = owner
            .is_some_and(|kv| kv.key == self.key.as_bytes() && kv.create_revision == revision);
        if !owned {
            info!(key = %self.key, "Lock lost");
            self.reset();
        }
        Ok(owned)
    }

    /// The key currently owning the lock, if any. Its value is the holder's identity.
    pub async fn current_holder(&self) -> Result<Option<KeyValue>> {
        let response = self
            .client
            .get(&self.prefix, RangeOptions::first_created())
            .await?;
        Ok(response.kvs.into_iter().next())
    }

    async fn acquire(&self) -> Result<()> {
        loop {
            self.set_state(LockState::Attempting);
            let attempt = self.attempt().await?;

            if attempt.owner_revision == attempt.revision {
                self.set_state(LockState::Held);
                info!(key = %self.key, revision = attempt.revision, "Lock acquired");
                return Ok(());
            }

            self.set_state(LockState::Waiting);
            self.wait_for_predecessors(attempt.revision).await?;
        }
    }

    /// Creates our key if it does not exist yet and reads the current owner, atomically.
    async fn attempt(&self) -> Result<Attempt> {
        let txn = Txn::new()
            .when([Compare::create_revision(self.key.as_str(), CompareResult::Equal, 0)])
            .and_then([
                TxnOp::put(
                    self.key.as_str(),
                    self.client.config().identity.as_str(),
                    PutOptions::with_lease(self.lease.id()),
                ),
                TxnOp::get(self.prefix.as_str(), RangeOptions::first_created()),
            ])
            .or_else([
                TxnOp::get(self.key.as_str(), RangeOptions::default()),
                TxnOp::get(self.prefix.as_str(), RangeOptions::first_created()),
            ]);

        let response = self.client.txn(txn).await?;

        let revision = if response.succeeded {
            response.header.revision
        } else {
            first_kv(range_at(&response, 0)?)?.create_revision
        };
        let owner_revision = first_kv(range_at(&response, 1)?)?.create_revision;

        self.session.write().revision = revision;
        debug!(
            key = %self.key,
            created = response.succeeded,
            revision,
            owner_revision,
            "Lock attempt"
        );

        Ok(Attempt {
            revision,
            owner_revision,
        })
    }

    /// Waits until every key created before `revision` under the prefix is gone.
    async fn wait_for_predecessors(&self, revision: Revision) -> Result<()> {
        loop {
            let response = self
                .client
                .get(&self.prefix, RangeOptions::last_created_before(revision))
                .await?;

            let Some(predecessor) = response.kvs.first() else {
                return Ok(());
            };

            debug!(
                key = %self.key,
                waiting_on = %predecessor.key_str(),
                revision = response.header.revision,
                "Waiting for predecessor"
            );
            self.wait_delete(&predecessor.key, response.header.revision)
                .await?;
        }
    }

    /// Blocks until `key` is deleted at a revision after `revision`.
    async fn wait_delete(&self, key: &[u8], revision: Revision) -> Result<()> {
        let mut stream = self
            .client
            .watch(
                key,
                WatchOptions {
                    start_revision: revision + 1,
                    filters: vec![WatchFilter::NoPut],
                    ..Default::default()
                },
            )
            .await?;

        while let Some(response) = stream.message().await {
            if response
                .events
                .iter()
                .any(|event| event.event_type == EventType::Delete)
            {
                return Ok(());
            }
        }

        Err(Error::Connection(format!(
            "watch on {} closed while waiting for lock",
            String::from_utf8_lossy(key)
        )))
    }

    /// Best-effort removal of our key after a failed or cancelled attempt.
    async fn abandon(&self) {
        self.reset();
        if let Err(e) = self.client.delete(&self.key, DeleteOptions::default()).await {
            warn!(key = %self.key, error = %e, "Failed to remove abandoned lock key");
        }
    }
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("key", &self.key)
            .field("session", &*self.session.read())
            .finish()
    }
}

fn range_at(response: &TxnResponse, index: usize) -> Result<&RangeResponse> {
    response
        .responses
        .get(index)
        .and_then(|r| r.as_range())
        .ok_or_else(|| {
            Error::Storage(StorageError::Internal(format!(
                "missing range response at index {}",
                index
            )))
        })
}

fn first_kv(range: &RangeResponse) -> Result<&KeyValue> {
    range.kvs.first().ok_or_else(|| {
        Error::Storage(StorageError::Internal(
            "lock key vanished inside transaction".to_string(),
        ))
    })
}
