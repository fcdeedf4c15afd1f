//! Client-side lease management.
//!
//! - [`LeaseManager`] grants leases and spawns one renewal task per lease
//! - The renewal task sends a keep-alive every TTL/3 and publishes each outcome on a
//!   `tokio::sync::watch` channel, so a slow or absent reader never stalls renewal
//! - [`LeaseHandle`] is the cheap, cloneable view of a lease that locks and
//!   registrations hold; it reports whether the lease is still valid
//!
//! A lease that cannot be renewed before its TTL runs out is reported as
//! [`LeaseState::Expired`]; the store deletes its keys on its own.

use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::error::{Error, Result};
use crate::storage::{LeaseId, LeaseTimeToLiveResponse};

/// Lifecycle of a lease as observed by its owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseState {
    /// Keep-alives are being acknowledged.
    Renewing,
    /// The last keep-alive failed; the lease may be dying.
    Degraded,
    /// Renewal was stopped without revoking; the lease lives until its deadline.
    Suspended,
    /// The store no longer knows the lease, or its deadline passed unrenewed.
    Expired,
    /// The owner revoked the lease.
    Revoked,
}

/// Latest known status of a lease.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseStatus {
    pub state: LeaseState,
    /// TTL in seconds granted by the last acknowledgement.
    pub ttl: i64,
    /// When the lease runs out unless renewed. `None` if unknown.
    pub deadline: Option<Instant>,
}

impl LeaseStatus {
    /// Status after the store granted or renewed the lease for `ttl` seconds in
    /// response to a request sent at `sent_at`.
    fn renewed(sent_at: Instant, ttl: i64) -> Self {
        Self {
            state: LeaseState::Renewing,
            ttl,
            deadline: Some(sent_at + Duration::from_secs(ttl.max(0) as u64)),
        }
    }

    pub fn is_valid(&self) -> bool {
        let alive = matches!(
            self.state,
            LeaseState::Renewing | LeaseState::Degraded | LeaseState::Suspended
        );
        alive && !self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Interval between keep-alives for a lease with the given TTL.
pub fn renewal_interval(ttl: i64) -> Duration {
    Duration::from_millis(((ttl.max(1) as u64) * 1000 / 3).max(1))
}

/// Read-only view of a lease, handed to locks and registrations.
#[derive(Clone, Debug)]
pub struct LeaseHandle {
    id: LeaseId,
    ttl: i64,
    status: watch::Receiver<LeaseStatus>,
}

impl LeaseHandle {
    /// Wraps a lease whose renewal is managed elsewhere. It is treated as valid for as
    /// long as the id is non-zero.
    pub fn unmanaged(id: LeaseId, ttl: i64) -> Self {
        let (_tx, status) = watch::channel(LeaseStatus {
            state: LeaseState::Renewing,
            ttl,
            deadline: None,
        });
        Self { id, ttl, status }
    }

    pub fn id(&self) -> LeaseId {
        self.id
    }

    pub fn ttl(&self) -> i64 {
        self.ttl
    }

    pub fn status(&self) -> LeaseStatus {
        *self.status.borrow()
    }

    pub fn is_valid(&self) -> bool {
        self.id != 0 && self.status().is_valid()
    }

    /// Resolves once the lease is no longer valid.
    ///
    /// Never resolves for an unmanaged lease.
    pub async fn expired(&self) {
        let mut status = self.status.clone();
        loop {
            let current = *status.borrow_and_update();
            if self.id == 0 || !current.is_valid() {
                return;
            }

            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        // No further updates will come; only the deadline remains.
                        sleep_until_deadline(current.deadline).await;
                        return;
                    }
                }
                _ = sleep_until_deadline(current.deadline) => return,
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Owner of a lease and its renewal task.
///
/// Dropping the handle stops renewal; the lease then expires after its TTL.
pub struct RenewalHandle {
    id: LeaseId,
    ttl: i64,
    client: Client,
    status: watch::Sender<LeaseStatus>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RenewalHandle {
    pub fn id(&self) -> LeaseId {
        self.id
    }

    pub fn ttl(&self) -> i64 {
        self.ttl
    }

    pub fn status(&self) -> LeaseStatus {
        *self.status.borrow()
    }

    /// A view of the lease for a lock or registration.
    pub fn handle(&self) -> LeaseHandle {
        LeaseHandle {
            id: self.id,
            ttl: self.ttl,
            status: self.status.subscribe(),
        }
    }

    async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Stops renewal without revoking; the lease expires once its deadline passes.
    pub async fn suspend(&mut self) {
        self.stop().await;
        self.status.send_modify(|status| {
            if matches!(status.state, LeaseState::Renewing | LeaseState::Degraded) {
                status.state = LeaseState::Suspended;
            }
        });
        info!(lease_id = self.id, "Lease renewal suspended");
    }

    /// Stops renewal and revokes the lease, deleting every key bound to it.
    pub async fn revoke(mut self) -> Result<()> {
        self.stop().await;
        LeaseManager::new(self.client.clone()).revoke(self.id).await?;
        self.status.send_modify(|status| status.state = LeaseState::Revoked);
        Ok(())
    }
}

impl Drop for RenewalHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl std::fmt::Debug for RenewalHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalHandle")
            .field("id", &self.id)
            .field("ttl", &self.ttl)
            .field("status", &self.status())
            .finish()
    }
}

/// Grants, renews and revokes leases.
#[derive(Clone, Debug)]
pub struct LeaseManager {
    client: Client,
}

impl LeaseManager {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Requests a new lease with the given TTL in seconds.
    pub async fn acquire(&self, ttl: i64) -> Result<LeaseId> {
        if ttl <= 0 {
            return Err(Error::InvalidArgument(format!(
                "lease TTL must be positive, got {}",
                ttl
            )));
        }

        let response = self.client.grant(ttl).await?;
        info!(lease_id = response.id, ttl = response.ttl, "Lease acquired");
        Ok(response.id)
    }

    /// Starts keeping the lease alive in a background task.
    ///
    /// The lease is assumed to have been granted just now. Prefer [`LeaseManager::grant`],
    /// which measures the TTL from when the grant request was sent.
    pub fn start_renewal(&self, id: LeaseId, ttl: i64) -> RenewalHandle {
        self.start_renewal_at(id, ttl, Instant::now())
    }

    /// Starts keeping alive a lease whose grant request was sent at `granted_at`.
    ///
    /// The first keep-alive goes out one renewal interval after `granted_at`, and the
    /// lease is reported valid until `granted_at + ttl` at the latest.
    pub fn start_renewal_at(&self, id: LeaseId, ttl: i64, granted_at: Instant) -> RenewalHandle {
        let (status_tx, _) = watch::channel(LeaseStatus::renewed(granted_at, ttl));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(run_renewal(
            self.client.clone(),
            id,
            ttl,
            granted_at,
            status_tx.clone(),
            shutdown_rx,
        ));

        debug!(
            lease_id = id,
            ttl,
            interval_ms = renewal_interval(ttl).as_millis() as u64,
            "Lease renewal started"
        );

        RenewalHandle {
            id,
            ttl,
            client: self.client.clone(),
            status: status_tx,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    /// Acquires a lease and starts renewing it.
    pub async fn grant(&self, ttl: i64) -> Result<RenewalHandle> {
        let granted_at = Instant::now();
        let id = self.acquire(ttl).await?;
        Ok(self.start_renewal_at(id, ttl, granted_at))
    }

    /// Revokes a lease. Revoking an unknown or expired lease succeeds.
    pub async fn revoke(&self, id: LeaseId) -> Result<()> {
        if id == 0 {
            return Ok(());
        }
        match self.client.revoke(id).await {
            Ok(()) => {
                info!(lease_id = id, "Lease revoked");
                Ok(())
            }
            Err(Error::LeaseInvalid(_)) => {
                debug!(lease_id = id, "Lease already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn time_to_live(&self, id: LeaseId) -> Result<LeaseTimeToLiveResponse> {
        self.client.time_to_live(id).await
    }
}

/// Background renewal loop for one lease.
async fn run_renewal(
    client: Client,
    id: LeaseId,
    ttl: i64,
    granted_at: Instant,
    status: watch::Sender<LeaseStatus>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let interval = renewal_interval(ttl);
    // The grant itself counts as the first renewal.
    let mut ticker = tokio::time::interval_at(granted_at + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!(lease_id = id, "Lease renewal stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        let sent_at = Instant::now();
        match client.keep_alive(id).await {
            Ok(ack) => {
                status.send_replace(LeaseStatus::renewed(sent_at, ack.ttl));
                debug!(lease_id = id, ttl = ack.ttl, "Lease keep-alive acknowledged");
            }
            Err(Error::LeaseInvalid(_)) => {
                status.send_modify(|s| s.state = LeaseState::Expired);
                warn!(lease_id = id, "Lease no longer exists in the store, stopping renewal");
                return;
            }
            Err(e) => {
                let past_deadline = status
                    .borrow()
                    .deadline
                    .is_some_and(|deadline| Instant::now() >= deadline);
                if past_deadline {
                    status.send_modify(|s| s.state = LeaseState::Expired);
                    warn!(lease_id = id, error = %e, "Lease deadline passed without renewal");
                    return;
                }
                status.send_modify(|s| s.state = LeaseState::Degraded);
                warn!(lease_id = id, error = %e, "Lease keep-alive failed, retrying");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{KvStore, MemoryStore, MemoryStoreConfig, PutOptions, RangeOptions};
    use std::sync::Arc;

    fn setup() -> (Arc<MemoryStore>, LeaseManager) {
        let store = MemoryStore::with_config(MemoryStoreConfig {
            expiry_check_interval_ms: 20,
            ..Default::default()
        });
        let client = Client::with_defaults(store.clone());
        (store, LeaseManager::new(client))
    }

    #[test]
    fn test_renewal_interval_is_a_third_of_ttl() {
        assert_eq!(renewal_interval(3), Duration::from_secs(1));
        assert_eq!(renewal_interval(1), Duration::from_millis(333));
        assert_eq!(renewal_interval(0), Duration::from_millis(333));
    }

    #[tokio::test]
    async fn test_acquire_rejects_bad_ttl() {
        let (_store, leases) = setup();
        let err = leases.acquire(0).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_renewal_keeps_lease_alive_past_ttl() {
        let (store, leases) = setup();
        let renewal = leases.grant(1).await.unwrap();
        store
            .put(b"k", b"v", PutOptions::with_lease(renewal.id()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert!(renewal.handle().is_valid());
        assert_eq!(renewal.status().state, LeaseState::Renewing);
        let kvs = store.get(b"k", RangeOptions::default()).await.unwrap().kvs;
        assert_eq!(kvs.len(), 1);
    }

    #[tokio::test]
    async fn test_deadline_counts_from_grant_request() {
        let (_store, leases) = setup();
        let granted_at = Instant::now();
        let renewal = leases.grant(10).await.unwrap();

        let deadline = renewal.status().deadline.unwrap();
        assert!(deadline <= granted_at + Duration::from_secs(10) + Duration::from_millis(500));
        assert!(deadline >= granted_at + Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_late_renewal_start_renews_immediately() {
        let (store, leases) = setup();
        let granted_at = Instant::now();
        let id = leases.acquire(1).await.unwrap();
        store
            .put(b"late", b"v", PutOptions::with_lease(id))
            .await
            .unwrap();

        // Most of the TTL is gone before renewal is handed the lease.
        tokio::time::sleep(Duration::from_millis(700)).await;
        let renewal = leases.start_renewal_at(id, 1, granted_at);
        assert_eq!(
            renewal.status().deadline,
            Some(granted_at + Duration::from_secs(1))
        );

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(renewal.status().state, LeaseState::Renewing);
        let kvs = store.get(b"late", RangeOptions::default()).await.unwrap().kvs;
        assert_eq!(kvs.len(), 1);
    }

    #[tokio::test]
    async fn test_suspended_lease_expires() {
        let (store, leases) = setup();
        let mut renewal = leases.grant(1).await.unwrap();
        let handle = renewal.handle();

        renewal.suspend().await;
        assert_eq!(handle.status().state, LeaseState::Suspended);
        assert!(handle.is_valid());

        tokio::time::timeout(Duration::from_secs(3), handle.expired())
            .await
            .expect("suspended lease never expired");
        assert!(!handle.is_valid());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent() {
        let (store, leases) = setup();
        let renewal = leases.grant(10).await.unwrap();
        let id = renewal.id();
        let handle = renewal.handle();

        renewal.revoke().await.unwrap();
        assert_eq!(handle.status().state, LeaseState::Revoked);
        assert!(!handle.is_valid());
        assert_eq!(store.lease_count(), 0);

        leases.revoke(id).await.unwrap();
        leases.revoke(0).await.unwrap();
    }

    #[tokio::test]
    async fn test_renewal_detects_forgotten_lease() {
        let (store, leases) = setup();
        let renewal = leases.grant(1).await.unwrap();
        let handle = renewal.handle();

        // Revoked behind the owner's back.
        store.revoke(renewal.id()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle.expired())
            .await
            .expect("lost lease not detected");
        assert_eq!(handle.status().state, LeaseState::Expired);
    }

    #[tokio::test]
    async fn test_store_outage_degrades_then_expires() {
        let (store, leases) = setup();
        let renewal = leases.grant(1).await.unwrap();
        let handle = renewal.handle();

        store.set_available(false);
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(handle.status().state, LeaseState::Degraded);

        tokio::time::timeout(Duration::from_secs(3), handle.expired())
            .await
            .expect("lease never reported expired");
        assert!(!handle.is_valid());
        drop(renewal);
    }

    #[tokio::test]
    async fn test_unmanaged_handle() {
        let handle = LeaseHandle::unmanaged(7, 30);
        assert!(handle.is_valid());
        assert_eq!(handle.id(), 7);
        assert!(!LeaseHandle::unmanaged(0, 30).is_valid());
    }

    #[tokio::test]
    async fn test_time_to_live() {
        let (_store, leases) = setup();
        let renewal = leases.grant(10).await.unwrap();
        let ttl = leases.time_to_live(renewal.id()).await.unwrap();
        assert_eq!(ttl.granted_ttl, 10);
        assert!(ttl.ttl > 0);
    }
}
