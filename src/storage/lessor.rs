//! Store-side lease table with TTL tracking.
//!
//! - Priority queue (BinaryHeap) of expiry deadlines instead of scanning every lease
//! - Renewals push a fresh deadline; stale heap entries are skipped when popped
//! - Atomic lease ID assignment
//! - Attach/detach of keys so an expiring lease knows what to delete

use parking_lot::RwLock;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::storage::{LeaseId, StorageError, StorageResult};

/// A granted lease.
#[derive(Clone, Debug)]
pub struct Lease {
    pub id: LeaseId,
    pub granted_ttl: i64,
    pub expires_at: Instant,
}

impl Lease {
    /// Remaining TTL in whole seconds, rounded up.
    pub fn remaining_ttl(&self) -> i64 {
        let remaining = self.expires_at.saturating_duration_since(Instant::now());
        let millis = remaining.as_millis() as i64;
        (millis + 999) / 1000
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
struct LeaseExpiry {
    expires_at: Instant,
    lease_id: LeaseId,
}

/// Sent by the expiry loop when a lease's deadline has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseExpireEvent {
    pub lease_id: LeaseId,
}

/// Tracks leases, their deadlines and attached keys.
pub struct Lessor {
    /// All active leases: id -> Lease
    leases: RwLock<HashMap<LeaseId, Lease>>,

    /// Map of lease_id -> set of attached keys
    lease_keys: RwLock<HashMap<LeaseId, HashSet<Vec<u8>>>>,

    next_lease_id: AtomicI64,

    /// Min-heap of upcoming deadlines
    expiry_queue: RwLock<BinaryHeap<Reverse<LeaseExpiry>>>,
}

impl Default for Lessor {
    fn default() -> Self {
        Self::new()
    }
}

impl Lessor {
    pub fn new() -> Self {
        Lessor {
            leases: RwLock::new(HashMap::new()),
            lease_keys: RwLock::new(HashMap::new()),
            next_lease_id: AtomicI64::new(1),
            expiry_queue: RwLock::new(BinaryHeap::new()),
        }
    }

    /// Grants a new lease with the given TTL in seconds.
    pub fn grant(&self, ttl: i64) -> StorageResult<Lease> {
        if ttl <= 0 {
            return Err(StorageError::InvalidArgument(format!(
                "TTL must be positive, got {}",
                ttl
            )));
        }

        let lease_id = self.next_lease_id.fetch_add(1, Ordering::SeqCst);
        let expires_at = Instant::now() + Duration::from_secs(ttl as u64);

        let lease = Lease {
            id: lease_id,
            granted_ttl: ttl,
            expires_at,
        };

        self.leases.write().insert(lease_id, lease.clone());
        self.lease_keys.write().insert(lease_id, HashSet::new());
        self.expiry_queue.write().push(Reverse(LeaseExpiry {
            expires_at,
            lease_id,
        }));

        debug!(lease_id, ttl, "Lease granted");
        Ok(lease)
    }

    /// Removes a lease and returns the keys that were attached to it.
    pub fn revoke(&self, id: LeaseId) -> StorageResult<Vec<Vec<u8>>> {
        let mut leases = self.leases.write();

        if leases.remove(&id).is_none() {
            return Err(StorageError::LeaseNotFound(id));
        }

        let keys = self
            .lease_keys
            .write()
            .remove(&id)
            .map(|set| set.into_iter().collect::<Vec<_>>())
            .unwrap_or_default();

        debug!(lease_id = id, key_count = keys.len(), "Lease revoked");
        Ok(keys)
    }

    /// Renews a lease, resetting its deadline to a full TTL from now.
    ///
    /// A lease whose deadline already passed cannot be renewed, even if the expiry
    /// loop has not collected it yet.
    pub fn renew(&self, id: LeaseId) -> StorageResult<i64> {
        let mut leases = self.leases.write();

        match leases.get_mut(&id) {
            Some(lease) if !lease.is_expired() => {
                let ttl = lease.granted_ttl;
                lease.expires_at = Instant::now() + Duration::from_secs(ttl as u64);

                self.expiry_queue.write().push(Reverse(LeaseExpiry {
                    expires_at: lease.expires_at,
                    lease_id: id,
                }));

                debug!(lease_id = id, ttl, "Lease renewed");
                Ok(ttl)
            }
            _ => Err(StorageError::LeaseNotFound(id)),
        }
    }

    /// Returns true if the lease exists and has not passed its deadline.
    pub fn is_live(&self, id: LeaseId) -> bool {
        self.leases
            .read()
            .get(&id)
            .map(|lease| !lease.is_expired())
            .unwrap_or(false)
    }

    pub fn attach(&self, lease_id: LeaseId, key: Vec<u8>) -> StorageResult<()> {
        let mut lease_keys = self.lease_keys.write();
        match lease_keys.get_mut(&lease_id) {
            Some(keys) => {
                keys.insert(key);
                Ok(())
            }
            None => Err(StorageError::LeaseNotFound(lease_id)),
        }
    }

    pub fn detach(&self, lease_id: LeaseId, key: &[u8]) {
        if let Some(keys) = self.lease_keys.write().get_mut(&lease_id) {
            keys.remove(key);
        }
    }

    pub fn get(&self, id: LeaseId) -> Option<Lease> {
        self.leases.read().get(&id).cloned()
    }

    /// Remaining TTL, granted TTL and attached keys.
    pub fn time_to_live(&self, id: LeaseId) -> StorageResult<(i64, i64, Vec<Vec<u8>>)> {
        let lease = self
            .get(id)
            .filter(|lease| !lease.is_expired())
            .ok_or(StorageError::LeaseNotFound(id))?;

        let keys = self
            .lease_keys
            .read()
            .get(&id)
            .map(|set| set.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();

        Ok((lease.remaining_ttl(), lease.granted_ttl, keys))
    }

    /// Revokes the lease only if its deadline has really passed.
    ///
    /// Returns `None` when the lease is gone or was renewed in the meantime.
    pub fn revoke_if_expired(&self, id: LeaseId) -> Option<Vec<Vec<u8>>> {
        let expired = self
            .leases
            .read()
            .get(&id)
            .map(|lease| lease.is_expired())
            .unwrap_or(false);

        if expired {
            self.revoke(id).ok()
        } else {
            None
        }
    }

    /// Pops every heap entry whose deadline is at or before `now` and returns the
    /// ids of leases that are actually expired.
    fn drain_expired(&self, now: Instant) -> Vec<LeaseId> {
        let mut due = Vec::new();
        {
            let mut queue = self.expiry_queue.write();
            while let Some(Reverse(entry)) = queue.peek().copied() {
                if entry.expires_at > now {
                    break;
                }
                queue.pop();
                due.push(entry.lease_id);
            }
        }

        // Entries left behind by renewals point at a deadline the lease no longer has.
        let leases = self.leases.read();
        let mut expired = Vec::new();
        for lease_id in due {
            if let Some(lease) = leases.get(&lease_id) {
                if lease.expires_at <= now && !expired.contains(&lease_id) {
                    expired.push(lease_id);
                }
            }
        }

        expired
    }

    /// Background loop that detects expired leases and reports them.
    ///
    /// Ends when the receiving side of `expire_tx` is dropped.
    pub async fn run_expiry_loop(
        self: Arc<Self>,
        expire_tx: mpsc::Sender<LeaseExpireEvent>,
        check_interval: Duration,
    ) {
        loop {
            for lease_id in self.drain_expired(Instant::now()) {
                if let Err(e) = expire_tx.send(LeaseExpireEvent { lease_id }).await {
                    warn!(error = ?e, "Lease expiry receiver closed, stopping expiry loop");
                    return;
                }
            }

            if expire_tx.is_closed() {
                return;
            }

            tokio::time::sleep(check_interval).await;
        }
    }

    /// Returns the number of active leases.
    pub fn count(&self) -> usize {
        self.leases.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_and_revoke() {
        let lessor = Lessor::new();

        let lease = lessor.grant(30).unwrap();
        assert!(lease.id > 0);
        assert_eq!(lease.granted_ttl, 30);

        let revoked_keys = lessor.revoke(lease.id).unwrap();
        assert_eq!(revoked_keys.len(), 0);
        assert_eq!(
            lessor.revoke(lease.id).unwrap_err(),
            StorageError::LeaseNotFound(lease.id)
        );
    }

    #[test]
    fn test_grant_rejects_non_positive_ttl() {
        let lessor = Lessor::new();
        assert!(matches!(
            lessor.grant(0),
            Err(StorageError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_attach_detach() {
        let lessor = Lessor::new();

        let lease = lessor.grant(30).unwrap();
        lessor.attach(lease.id, b"key1".to_vec()).unwrap();
        lessor.attach(lease.id, b"key2".to_vec()).unwrap();

        let (_, _, keys) = lessor.time_to_live(lease.id).unwrap();
        assert_eq!(keys.len(), 2);

        lessor.detach(lease.id, b"key1");
        let (ttl, granted, keys) = lessor.time_to_live(lease.id).unwrap();
        assert_eq!(keys, vec![b"key2".to_vec()]);
        assert_eq!(granted, 30);
        assert!(ttl > 0 && ttl <= 30);
    }

    #[tokio::test]
    async fn test_renew_pushes_deadline() {
        let lessor = Lessor::new();

        let lease = lessor.grant(10).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(lessor.renew(lease.id).unwrap(), 10);
        let renewed = lessor.get(lease.id).unwrap();
        assert!(renewed.expires_at > lease.expires_at);
    }

    #[tokio::test]
    async fn test_expiry_loop_reports_expired_lease() {
        let lessor = Arc::new(Lessor::new());
        let (tx, mut rx) = mpsc::channel(10);

        let lease = lessor.grant(1).unwrap();
        lessor.attach(lease.id, b"key".to_vec()).unwrap();

        tokio::spawn(lessor.clone().run_expiry_loop(tx, Duration::from_millis(20)));

        let event = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("expiry not reported")
            .unwrap();
        assert_eq!(event.lease_id, lease.id);
        assert!(!lessor.is_live(lease.id));
        assert!(lessor.renew(lease.id).is_err());

        let keys = lessor.revoke_if_expired(lease.id).unwrap();
        assert_eq!(keys, vec![b"key".to_vec()]);
        assert_eq!(lessor.count(), 0);
    }

    #[test]
    fn test_renewed_lease_is_not_drained() {
        let lessor = Lessor::new();
        let lease = lessor.grant(5).unwrap();
        lessor.renew(lease.id).unwrap();

        // The original heap entry is now stale.
        assert!(lessor.drain_expired(lease.expires_at).is_empty());
        assert!(lessor.revoke_if_expired(lease.id).is_none());
    }
}
