//! # leaselock: lease-based distributed locks and service registry
//!
//! leaselock builds coordination primitives on top of an etcd-style key-value store
//! (ordered keys, compare-and-branch transactions, revisions, TTL leases, watches):
//!
//! - **Lease management**: grant a lease and keep it alive from a background task
//! - **Distributed mutex**: lease-bound lock keys ordered by creation revision, with
//!   waiters woken one at a time by watching their predecessor
//! - **Service registration**: instance records that vanish when their lease expires
//! - **Service discovery**: random resolution and change streams over live instances
//!
//! The store is reached through the [`storage::KvStore`] trait. [`MemoryStore`] is an
//! embedded implementation with etcd semantics.
//!
//! # Usage
//!
//! ```no_run
//! use leaselock::{Client, LeaseManager, MemoryStore, Mutex};
//!
//! # async fn demo() -> leaselock::Result<()> {
//! let client = Client::with_defaults(MemoryStore::new());
//! let renewal = LeaseManager::new(client.clone()).grant(5).await?;
//!
//! let lock = Mutex::new(client, renewal.handle(), "billing");
//! lock.lock().await?;
//! // critical section
//! lock.unlock().await?;
//! renewal.revoke().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod discovery;
pub mod error;
pub mod lease;
pub mod lock;
pub mod registry;
pub mod storage;

pub use client::{Client, ClientConfig};
pub use discovery::{Discovery, ServiceChange, ServiceWatch};
pub use error::{Error, ErrorKind, Result};
pub use lease::{LeaseHandle, LeaseManager, LeaseState, LeaseStatus, RenewalHandle};
pub use lock::{LockState, Mutex};
pub use registry::{Registration, Registry, Service, ServiceInstance};
pub use storage::{KvStore, MemoryStore, MemoryStoreConfig};
