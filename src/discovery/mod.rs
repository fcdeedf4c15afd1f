//! Service discovery over registration records.
//!
//! Resolution reads every `<name>-<uuid>` record and picks one address uniformly at
//! random. [`ServiceWatch`] follows the set of live instances, starting right after the
//! revision of its initial read so no change is missed in between.

use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use std::task::{Context, Poll};

use rand::Rng;
use tokio_stream::Stream;
use tracing::{debug, info};

use crate::client::Client;
use crate::error::{Error, Result};
use crate::registry::{instance_id, record_prefix};
use crate::storage::{Event, EventType, KeyValue, RangeOptions, Revision, WatchOptions, WatchStream};

/// A change in the set of live instances of a service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceChange {
    Added { key: String, addr: String },
    /// Carries the address the instance had before it went away.
    Removed { key: String, addr: String },
}

impl ServiceChange {
    pub fn addr(&self) -> &str {
        match self {
            ServiceChange::Added { addr, .. } | ServiceChange::Removed { addr, .. } => addr,
        }
    }
}

/// Resolves service names to live addresses.
#[derive(Clone, Debug)]
pub struct Discovery {
    client: Client,
}

impl Discovery {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn instances(&self, name: &str) -> Result<(Vec<KeyValue>, Revision)> {
        if name.is_empty() {
            return Err(Error::InvalidArgument(
                "service name must not be empty".to_string(),
            ));
        }

        let response = self
            .client
            .get(record_prefix(name), RangeOptions::prefix())
            .await?;

        let instances = response
            .kvs
            .into_iter()
            .filter(|kv| instance_id(name, &kv.key_str()).is_some())
            .collect();
        Ok((instances, response.header.revision))
    }

    /// Addresses of every live instance, in key order. Empty if there are none.
    pub async fn resolve_all(&self, name: &str) -> Result<Vec<String>> {
        let (instances, _) = self.instances(name).await?;
        Ok(instances.iter().map(|kv| kv.value_str()).collect())
    }

    /// Picks one live instance at random.
    pub async fn resolve(&self, name: &str) -> Result<String> {
        let addrs = self.resolve_all(name).await?;
        if addrs.is_empty() {
            return Err(Error::NotFound(format!("service {}", name)));
        }

        let index = rand::thread_rng().gen_range(0..addrs.len());
        debug!(
            service = name,
            candidates = addrs.len(),
            chosen = %addrs[index],
            "Resolved service"
        );
        Ok(addrs[index].clone())
    }

    /// Follows additions and removals of instances of `name`.
    pub async fn watch(&self, name: &str) -> Result<ServiceWatch> {
        let (instances, revision) = self.instances(name).await?;

        let stream = self
            .client
            .watch(
                record_prefix(name),
                WatchOptions {
                    prefix: true,
                    start_revision: revision + 1,
                    prev_kv: true,
                    ..Default::default()
                },
            )
            .await?;

        info!(service = name, instances = instances.len(), revision, "Watching service");

        Ok(ServiceWatch {
            name: name.to_string(),
            live: instances
                .iter()
                .map(|kv| (kv.key_str(), kv.value_str()))
                .collect(),
            pending: VecDeque::new(),
            stream,
        })
    }
}

/// Stream of [`ServiceChange`]s for one service.
///
/// Instances present when the watch was opened are reported by [`addresses`] but not
/// replayed as changes. The stream ends if the store connection is lost. Dropping it
/// cancels the store subscription.
///
/// [`addresses`]: ServiceWatch::addresses
pub struct ServiceWatch {
    name: String,
    live: BTreeMap<String, String>,
    pending: VecDeque<ServiceChange>,
    stream: WatchStream,
}

impl ServiceWatch {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Addresses of the instances currently known to be live, in key order.
    pub fn addresses(&self) -> Vec<String> {
        self.live.values().cloned().collect()
    }

    /// Waits for the next change; `None` once the watch has ended.
    pub async fn next_change(&mut self) -> Option<ServiceChange> {
        std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }

    pub fn cancel(self) {}

    fn apply(&mut self, event: Event) {
        let key = event.kv.key_str();
        if instance_id(&self.name, &key).is_none() {
            return;
        }

        match event.event_type {
            EventType::Put => {
                let addr = event.kv.value_str();
                match self.live.insert(key.clone(), addr.clone()) {
                    Some(previous) if previous == addr => {}
                    Some(previous) => {
                        self.pending.push_back(ServiceChange::Removed {
                            key: key.clone(),
                            addr: previous,
                        });
                        self.pending.push_back(ServiceChange::Added { key, addr });
                    }
                    None => self.pending.push_back(ServiceChange::Added { key, addr }),
                }
            }
            EventType::Delete => {
                let addr = self
                    .live
                    .remove(&key)
                    .or_else(|| event.prev_kv.map(|kv| kv.value_str()));
                if let Some(addr) = addr {
                    self.pending.push_back(ServiceChange::Removed { key, addr });
                }
            }
        }
    }
}

impl Stream for ServiceWatch {
    type Item = ServiceChange;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(change) = self.pending.pop_front() {
                return Poll::Ready(Some(change));
            }

            match Pin::new(&mut self.stream).poll_next(cx) {
                Poll::Ready(Some(response)) => {
                    for event in response.events {
                        self.apply(event);
                    }
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl std::fmt::Debug for ServiceWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceWatch")
            .field("name", &self.name)
            .field("live", &self.live)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{record_key, Registry, ServiceInstance};
    use crate::storage::{MemoryStore, PutOptions};
    use std::collections::HashSet;
    use std::time::Duration;

    #[tokio::test]
    async fn test_resolve_not_found() {
        let discovery = Discovery::new(Client::with_defaults(MemoryStore::new()));
        let err = discovery.resolve("missing").await.unwrap_err();
        assert_eq!(err, Error::NotFound("service missing".to_string()));
        assert!(discovery.resolve_all("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_ignores_other_services_sharing_a_prefix() {
        let client = Client::with_defaults(MemoryStore::new());
        client
            .put(record_key("svc-extra"), "other:1", PutOptions::default())
            .await
            .unwrap();
        client
            .put(record_key("svc"), "host:1", PutOptions::default())
            .await
            .unwrap();

        let discovery = Discovery::new(client);
        assert_eq!(discovery.resolve_all("svc").await.unwrap(), vec!["host:1"]);
        assert_eq!(discovery.resolve("svc").await.unwrap(), "host:1");
    }

    #[tokio::test]
    async fn test_resolve_picks_every_instance() {
        let client = Client::with_defaults(MemoryStore::new());
        let mut registry = Registry::new(client.clone());
        registry
            .register(&ServiceInstance::new("svc", "host:1"))
            .await
            .unwrap();
        registry
            .register(&ServiceInstance::new("svc", "host:2"))
            .await
            .unwrap();

        let discovery = Discovery::new(client);
        let mut seen = HashSet::new();
        for _ in 0..200 {
            seen.insert(discovery.resolve("svc").await.unwrap());
        }
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn test_watch_reports_changes() {
        let client = Client::with_defaults(MemoryStore::new());
        let mut registry = Registry::new(client.clone());
        registry
            .register(&ServiceInstance::new("svc", "host:1"))
            .await
            .unwrap();

        let discovery = Discovery::new(client.clone());
        let mut watch = discovery.watch("svc").await.unwrap();
        assert_eq!(watch.addresses(), vec!["host:1"]);

        let key = registry
            .register(&ServiceInstance::new("svc", "host:2"))
            .await
            .unwrap();
        let change = tokio::time::timeout(Duration::from_secs(1), watch.next_change())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            change,
            ServiceChange::Added {
                key: key.clone(),
                addr: "host:2".to_string()
            }
        );

        registry.deregister_instance(&key).await.unwrap();
        let change = tokio::time::timeout(Duration::from_secs(1), watch.next_change())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            change,
            ServiceChange::Removed {
                key,
                addr: "host:2".to_string()
            }
        );
        assert_eq!(watch.addresses(), vec!["host:1"]);
    }

    #[tokio::test]
    async fn test_cancel_releases_subscription() {
        let store = MemoryStore::new();
        let discovery = Discovery::new(Client::with_defaults(store.clone()));

        let watch = discovery.watch("svc").await.unwrap();
        assert_eq!(store.watcher_count(), 1);
        watch.cancel();
        assert_eq!(store.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_watch_ends_when_store_is_lost() {
        let store = MemoryStore::new();
        let discovery = Discovery::new(Client::with_defaults(store.clone()));
        let mut watch = discovery.watch("svc").await.unwrap();

        store.set_available(false);
        assert!(watch.next_change().await.is_none());
    }
}
