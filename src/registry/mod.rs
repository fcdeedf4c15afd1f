//! Service registration bound to leases.
//!
//! Each registered instance is written as `<name>-<uuid>` with its address as value,
//! under a lease of its own that a background task keeps alive. When the process dies
//! the leases run out and the store deletes the records.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::client::Client;
use crate::error::{Error, Result};
use crate::lease::{LeaseHandle, LeaseManager, LeaseStatus, RenewalHandle};
use crate::storage::{LeaseId, PutOptions};

/// Something that can be registered for discovery.
pub trait Service {
    fn name(&self) -> &str;
    fn addr(&self) -> &str;
}

/// A plain (name, address) service description.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub name: String,
    pub addr: String,
}

impl ServiceInstance {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
        }
    }
}

impl Service for ServiceInstance {
    fn name(&self) -> &str {
        &self.name
    }

    fn addr(&self) -> &str {
        &self.addr
    }
}

/// Common prefix of every record registered under `name`.
pub fn record_prefix(name: &str) -> String {
    format!("{}-", name)
}

/// A fresh record key for one instance of `name`.
pub fn record_key(name: &str) -> String {
    format!("{}{}", record_prefix(name), Uuid::new_v4())
}

/// Returns the instance id if `key` is a record of exactly `name`.
///
/// `svc-extra-<uuid>` is not a record of `svc`.
pub fn instance_id<'a>(name: &str, key: &'a str) -> Option<&'a str> {
    let suffix = key.strip_prefix(name)?.strip_prefix('-')?;
    (suffix.len() == 36 && Uuid::parse_str(suffix).is_ok()).then_some(suffix)
}

/// One live registration.
pub struct Registration {
    key: String,
    service: ServiceInstance,
    renewal: RenewalHandle,
}

impl Registration {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn service(&self) -> &ServiceInstance {
        &self.service
    }

    pub fn lease_id(&self) -> LeaseId {
        self.renewal.id()
    }

    pub fn lease(&self) -> LeaseHandle {
        self.renewal.handle()
    }

    pub fn status(&self) -> LeaseStatus {
        self.renewal.status()
    }

    /// Stops renewing without revoking; the record disappears once the lease expires.
    pub async fn suspend(&mut self) {
        self.renewal.suspend().await;
    }

    async fn revoke(self) -> Result<()> {
        let key = self.key;
        self.renewal.revoke().await?;
        info!(key = %key, "Service deregistered");
        Ok(())
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("key", &self.key)
            .field("service", &self.service)
            .field("lease_id", &self.renewal.id())
            .finish()
    }
}

/// Registers services and keeps their records alive.
pub struct Registry {
    client: Client,
    leases: LeaseManager,
    registrations: Vec<Registration>,
}

impl Registry {
    pub fn new(client: Client) -> Self {
        Self {
            leases: LeaseManager::new(client.clone()),
            client,
            registrations: Vec::new(),
        }
    }

    /// Registers one instance and returns its record key.
    ///
    /// Either the record exists bound to a renewed lease afterwards, or nothing is left
    /// behind: a failed write revokes the freshly granted lease.
    pub async fn register(&mut self, service: &impl Service) -> Result<String> {
        let (name, addr) = (service.name(), service.addr());
        if name.is_empty() || addr.is_empty() {
            return Err(Error::InvalidArgument(
                "service name and address must not be empty".to_string(),
            ));
        }

        let ttl = self.client.config().service_ttl;
        // The lease is renewed from the grant onward, including while the record is written.
        let renewal = self.leases.grant(ttl).await?;
        let lease_id = renewal.id();
        let key = record_key(name);

        if let Err(e) = self
            .client
            .put(&key, addr, PutOptions::with_lease(lease_id))
            .await
        {
            warn!(key = %key, lease_id, error = %e, "Registration failed, revoking lease");
            if let Err(revoke_err) = renewal.revoke().await {
                warn!(
                    lease_id,
                    error = %revoke_err,
                    "Failed to revoke lease of failed registration"
                );
            }
            return Err(e);
        }

        info!(key = %key, addr, lease_id, ttl, "Service registered");

        self.registrations.push(Registration {
            key: key.clone(),
            service: ServiceInstance::new(name, addr),
            renewal,
        });
        Ok(key)
    }

    pub fn registrations(&self) -> &[Registration] {
        &self.registrations
    }

    pub fn registrations_mut(&mut self) -> &mut [Registration] {
        &mut self.registrations
    }

    /// Removes one instance by its record key.
    pub async fn deregister_instance(&mut self, key: &str) -> Result<()> {
        let index = self
            .registrations
            .iter()
            .position(|r| r.key == key)
            .ok_or_else(|| Error::NotHeld(key.to_string()))?;

        self.registrations.remove(index).revoke().await
    }

    /// Revokes every registration and releases the client.
    ///
    /// All leases are revoked even if one fails; the first error is returned.
    pub async fn deregister(self) -> Result<()> {
        if self.registrations.is_empty() {
            return Err(Error::NotHeld("no registered services".to_string()));
        }

        let mut first_error = None;
        for registration in self.registrations {
            if let Err(e) = registration.revoke().await {
                warn!(error = %e, "Failed to revoke registration");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("registrations", &self.registrations)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use crate::lease::LeaseState;
    use crate::storage::{
        DeleteOptions, DeleteResponse, KvStore, LeaseGrantResponse, LeaseKeepAliveResponse,
        LeaseTimeToLiveResponse, MemoryStore, PutResponse, RangeOptions, RangeResponse,
        StorageError, StorageResult, Txn, TxnResponse, WatchOptions, WatchStream,
    };
    use crate::storage::MemoryStoreConfig;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    /// How a [`FaultyPuts`] store treats writes.
    enum PutFault {
        Reject,
        Delay(Duration),
    }

    /// Delegates to a memory store, except that every put is rejected or delayed.
    struct FaultyPuts(Arc<MemoryStore>, PutFault);

    #[async_trait]
    impl KvStore for FaultyPuts {
        async fn put(
            &self,
            key: &[u8],
            value: &[u8],
            options: PutOptions,
        ) -> StorageResult<PutResponse> {
            match self.1 {
                PutFault::Reject => Err(StorageError::Unavailable("put rejected".to_string())),
                PutFault::Delay(delay) => {
                    tokio::time::sleep(delay).await;
                    self.0.put(key, value, options).await
                }
            }
        }
        async fn get(&self, key: &[u8], options: RangeOptions) -> StorageResult<RangeResponse> {
            self.0.get(key, options).await
        }
        async fn delete(
            &self,
            key: &[u8],
            options: DeleteOptions,
        ) -> StorageResult<DeleteResponse> {
            self.0.delete(key, options).await
        }
        async fn txn(&self, txn: Txn) -> StorageResult<TxnResponse> {
            self.0.txn(txn).await
        }
        async fn grant(&self, ttl: i64) -> StorageResult<LeaseGrantResponse> {
            self.0.grant(ttl).await
        }
        async fn revoke(&self, id: LeaseId) -> StorageResult<()> {
            self.0.revoke(id).await
        }
        async fn keep_alive(&self, id: LeaseId) -> StorageResult<LeaseKeepAliveResponse> {
            self.0.keep_alive(id).await
        }
        async fn time_to_live(&self, id: LeaseId) -> StorageResult<LeaseTimeToLiveResponse> {
            self.0.time_to_live(id).await
        }
        async fn watch(&self, key: &[u8], options: WatchOptions) -> StorageResult<WatchStream> {
            self.0.watch(key, options).await
        }
    }

    #[test]
    fn test_instance_id() {
        let key = record_key("svc");
        assert!(key.starts_with("svc-"));
        assert!(instance_id("svc", &key).is_some());

        let other = record_key("svc-extra");
        assert!(instance_id("svc", &other).is_none());
        assert!(instance_id("svc", "svc-").is_none());
        assert!(instance_id("svc", "svcx-1234").is_none());
    }

    #[tokio::test]
    async fn test_register_writes_leased_record() {
        let store = MemoryStore::new();
        let client = Client::with_defaults(store.clone());
        let mut registry = Registry::new(client.clone());

        let key = registry
            .register(&ServiceInstance::new("order_service", "10.0.0.1:80"))
            .await
            .unwrap();

        let kvs = client.get(&key, RangeOptions::default()).await.unwrap().kvs;
        assert_eq!(kvs.len(), 1);
        assert_eq!(kvs[0].value_str(), "10.0.0.1:80");
        assert_eq!(kvs[0].lease, registry.registrations()[0].lease_id());

        let ttl = client.time_to_live(kvs[0].lease).await.unwrap();
        assert_eq!(ttl.granted_ttl, 5);
    }

    #[tokio::test]
    async fn test_each_registration_has_its_own_lease() {
        let store = MemoryStore::new();
        let mut registry = Registry::new(Client::with_defaults(store.clone()));

        let svc = ServiceInstance::new("svc", "host:1");
        let first = registry.register(&svc).await.unwrap();
        let second = registry.register(&svc).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(store.lease_count(), 2);

        registry.deregister_instance(&first).await.unwrap();
        assert_eq!(store.key_count(), 1);
        assert!(matches!(
            registry.deregister_instance(&first).await,
            Err(Error::NotHeld(_))
        ));
    }

    #[tokio::test]
    async fn test_register_rejects_empty_fields() {
        let mut registry = Registry::new(Client::with_defaults(MemoryStore::new()));
        let err = registry
            .register(&ServiceInstance::new("", "host:1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_failed_put_revokes_lease() {
        let store = MemoryStore::new();
        let client = Client::new(
            Arc::new(FaultyPuts(store.clone(), PutFault::Reject)),
            ClientConfig::default(),
        )
        .unwrap();
        let mut registry = Registry::new(client);

        let err = registry
            .register(&ServiceInstance::new("svc", "host:1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        assert_eq!(store.lease_count(), 0);
        assert!(registry.registrations().is_empty());
    }

    #[tokio::test]
    async fn test_slow_put_does_not_outlive_lease() {
        let store = MemoryStore::with_config(MemoryStoreConfig {
            expiry_check_interval_ms: 20,
            ..Default::default()
        });
        let config = ClientConfig {
            service_ttl: 3,
            ..Default::default()
        };
        let client = Client::new(
            Arc::new(FaultyPuts(
                store.clone(),
                PutFault::Delay(Duration::from_millis(2500)),
            )),
            config,
        )
        .unwrap();
        let mut registry = Registry::new(client);

        let key = registry
            .register(&ServiceInstance::new("svc", "host:1"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;

        let registration = &registry.registrations()[0];
        assert_eq!(registration.status().state, LeaseState::Renewing);
        assert!(registration.lease().is_valid());
        assert_eq!(store.lease_count(), 1);
        let kvs = store.get(key.as_bytes(), RangeOptions::default()).await.unwrap().kvs;
        assert_eq!(kvs.len(), 1);
    }

    #[tokio::test]
    async fn test_deregister_removes_everything() {
        let store = MemoryStore::new();
        let mut registry = Registry::new(Client::with_defaults(store.clone()));

        registry
            .register(&ServiceInstance::new("svc", "host:1"))
            .await
            .unwrap();
        registry
            .register(&ServiceInstance::new("svc", "host:2"))
            .await
            .unwrap();

        registry.deregister().await.unwrap();
        assert_eq!(store.key_count(), 0);
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_deregister_without_registrations() {
        let registry = Registry::new(Client::with_defaults(MemoryStore::new()));
        assert!(matches!(registry.deregister().await, Err(Error::NotHeld(_))));
    }
}
