//! Client handle shared by every coordination primitive.
//!
//! A [`Client`] wraps a [`KvStore`] together with its [`ClientConfig`]. It is cheap to
//! clone and is passed explicitly to the lease manager, locks, registries and
//! discovery. Every non-waiting store call is bounded by the configured request timeout
//! and store errors are mapped into [`crate::Error`].

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::storage::{
    DeleteOptions, DeleteResponse, KvStore, LeaseGrantResponse, LeaseId, LeaseKeepAliveResponse,
    LeaseTimeToLiveResponse, PutOptions, PutResponse, RangeOptions, RangeResponse, StorageResult,
    Txn, TxnResponse, WatchOptions, WatchStream,
};

/// Client-side configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// Upper bound on every store request in milliseconds (0 disables the bound).
    pub request_timeout_ms: u64,

    /// Prefix under which lock keys are written.
    pub lock_namespace: String,

    /// Lease TTL in seconds for service registrations.
    pub service_ttl: i64,

    /// Value written into lock keys to identify the holder.
    pub identity: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5000,
            lock_namespace: "locks".to_string(),
            service_ttl: 5,
            identity: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl ClientConfig {
    /// Loads a configuration from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| {
            Error::InvalidArgument(format!("cannot read config {}: {}", path.display(), e))
        })?;
        let config: ClientConfig = serde_json::from_slice(&data).map_err(|e| {
            Error::InvalidArgument(format!("cannot parse config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lock_namespace.is_empty() || self.lock_namespace.ends_with('/') {
            return Err(Error::InvalidArgument(format!(
                "lock_namespace must be non-empty without a trailing '/', got {:?}",
                self.lock_namespace
            )));
        }
        if self.service_ttl <= 0 {
            return Err(Error::InvalidArgument(format!(
                "service_ttl must be positive, got {}",
                self.service_ttl
            )));
        }
        if self.identity.is_empty() {
            return Err(Error::InvalidArgument("identity must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }
}

/// Handle to the store used by all coordination primitives.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn KvStore>,
    config: Arc<ClientConfig>,
}

impl Client {
    pub fn new(store: Arc<dyn KvStore>, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        debug!(
            identity = %config.identity,
            lock_namespace = %config.lock_namespace,
            request_timeout_ms = config.request_timeout_ms,
            "Client created"
        );
        Ok(Self {
            store,
            config: Arc::new(config),
        })
    }

    pub fn with_defaults(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            config: Arc::new(ClientConfig::default()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Runs one store request under the configured timeout.
    async fn call<T>(
        &self,
        op: &'static str,
        request: impl Future<Output = StorageResult<T>>,
    ) -> Result<T> {
        let Some(limit) = self.config.request_timeout() else {
            return request.await.map_err(Error::from);
        };

        match tokio::time::timeout(limit, request).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => {
                warn!(op, timeout_ms = self.config.request_timeout_ms, "Store request timed out");
                Err(Error::Connection(format!(
                    "{} timed out after {}ms",
                    op, self.config.request_timeout_ms
                )))
            }
        }
    }

    pub async fn put(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        options: PutOptions,
    ) -> Result<PutResponse> {
        self.call("put", self.store.put(key.as_ref(), value.as_ref(), options))
            .await
    }

    pub async fn get(&self, key: impl AsRef<[u8]>, options: RangeOptions) -> Result<RangeResponse> {
        self.call("get", self.store.get(key.as_ref(), options)).await
    }

    pub async fn delete(
        &self,
        key: impl AsRef<[u8]>,
        options: DeleteOptions,
    ) -> Result<DeleteResponse> {
        self.call("delete", self.store.delete(key.as_ref(), options))
            .await
    }

    pub async fn txn(&self, txn: Txn) -> Result<TxnResponse> {
        self.call("txn", self.store.txn(txn)).await
    }

    pub async fn grant(&self, ttl: i64) -> Result<LeaseGrantResponse> {
        self.call("lease_grant", self.store.grant(ttl)).await
    }

    pub async fn revoke(&self, id: LeaseId) -> Result<()> {
        self.call("lease_revoke", self.store.revoke(id)).await
    }

    pub async fn keep_alive(&self, id: LeaseId) -> Result<LeaseKeepAliveResponse> {
        self.call("lease_keep_alive", self.store.keep_alive(id))
            .await
    }

    pub async fn time_to_live(&self, id: LeaseId) -> Result<LeaseTimeToLiveResponse> {
        self.call("lease_time_to_live", self.store.time_to_live(id))
            .await
    }

    /// Opens a watch. Only establishing the subscription is bounded by the timeout.
    pub async fn watch(&self, key: impl AsRef<[u8]>, options: WatchOptions) -> Result<WatchStream> {
        self.call("watch", self.store.watch(key.as_ref(), options))
            .await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("config", &self.config).finish()
    }
}
