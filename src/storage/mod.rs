//! The key-value store interface the coordination primitives are built on.
//!
//! Everything above this module talks to the store through [`KvStore`], which mirrors the
//! subset of the etcd v3 API the lock and registry need:
//!
//! - **KV**: put / range / delete with MVCC metadata on every key
//! - **Txn**: atomic compare-and-branch over create/mod revision, version, value and lease
//! - **Lease**: grant / revoke / keep-alive / time-to-live
//! - **Watch**: key or prefix subscriptions that can start at a past revision
//!
//! [`MemoryStore`] is an embedded, in-process implementation of the interface.

pub mod lessor;
pub mod memory;
pub mod mvcc;
pub mod watch;

pub use memory::{MemoryStore, MemoryStoreConfig};

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::Stream;

/// Lease identifier assigned by the store. Zero means "no lease".
pub type LeaseId = i64;

/// Store-wide revision counter value.
pub type Revision = i64;

/// Store-level errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Lease not found: {0}")]
    LeaseNotFound(LeaseId),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Required revision {requested} has been compacted (compact revision {compacted})")]
    Compacted { requested: Revision, compacted: Revision },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A key-value pair with MVCC metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Vec<u8>,

    /// The revision when this key was created
    pub create_revision: Revision,

    /// The revision when this key was last modified
    pub mod_revision: Revision,

    /// Number of modifications since creation
    pub version: i64,

    pub value: Vec<u8>,

    /// Attached lease (0 if none)
    pub lease: LeaseId,
}

impl KeyValue {
    pub fn key_str(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }

    pub fn value_str(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

/// Event type for watch notifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Put,
    Delete,
}

/// A single change to a key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub event_type: EventType,

    /// For deletes only `key` and `mod_revision` are meaningful.
    pub kv: KeyValue,

    pub prev_kv: Option<KeyValue>,
}

/// Metadata attached to every response.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Store revision at the time the request was served.
    pub revision: Revision,
}

/// Returns the exclusive end of the range covering every key that starts with `prefix`.
///
/// Follows etcd: increment the last byte that is not 0xff and truncate after it.
/// A prefix made only of 0xff bytes (or an empty prefix) maps to `"\0"`, meaning
/// "to the end of the keyspace".
pub fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xff {
            *last += 1;
            return end;
        }
        end.pop();
    }
    vec![0]
}

/// Sort target for range requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortTarget {
    Key,
    CreateRevision,
    ModRevision,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortOrder {
    Ascend,
    Descend,
}

#[derive(Clone, Debug, Default)]
pub struct PutOptions {
    pub lease: LeaseId,
    pub prev_kv: bool,
}

impl PutOptions {
    pub fn with_lease(lease: LeaseId) -> Self {
        Self {
            lease,
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RangeOptions {
    /// Treat the key as a prefix.
    pub prefix: bool,
    /// Maximum number of keys returned (0 = unlimited).
    pub limit: usize,
    pub sort: Option<(SortTarget, SortOrder)>,
    /// Only keys created at or below this revision (0 = no bound).
    pub max_create_revision: Revision,
    pub count_only: bool,
}

impl RangeOptions {
    pub fn prefix() -> Self {
        Self {
            prefix: true,
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_sort(mut self, target: SortTarget, order: SortOrder) -> Self {
        self.sort = Some((target, order));
        self
    }

    pub fn with_max_create_revision(mut self, revision: Revision) -> Self {
        self.max_create_revision = revision;
        self
    }

    /// The oldest key under the prefix.
    pub fn first_created() -> Self {
        Self::prefix()
            .with_sort(SortTarget::CreateRevision, SortOrder::Ascend)
            .with_limit(1)
    }

    /// The newest key under the prefix created strictly before `revision`.
    pub fn last_created_before(revision: Revision) -> Self {
        Self::prefix()
            .with_max_create_revision(revision - 1)
            .with_sort(SortTarget::CreateRevision, SortOrder::Descend)
            .with_limit(1)
    }
}

#[derive(Clone, Debug, Default)]
pub struct DeleteOptions {
    pub prefix: bool,
    pub prev_kv: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PutResponse {
    pub header: ResponseHeader,
    pub prev_kv: Option<KeyValue>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeResponse {
    pub header: ResponseHeader,
    pub kvs: Vec<KeyValue>,
    /// Number of matching keys before the limit was applied
    pub count: usize,
    pub more: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteResponse {
    pub header: ResponseHeader,
    pub deleted: usize,
    pub prev_kvs: Vec<KeyValue>,
}

/// Comparison operator used in transaction guards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareResult {
    Equal,
    Greater,
    Less,
    NotEqual,
}

impl CompareResult {
    fn holds<T: PartialOrd + ?Sized>(self, actual: &T, target: &T) -> bool {
        match self {
            CompareResult::Equal => actual == target,
            CompareResult::Greater => actual > target,
            CompareResult::Less => actual < target,
            CompareResult::NotEqual => actual != target,
        }
    }
}

/// What a [`Compare`] inspects. A missing key reads as zero / empty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompareTarget {
    Version(i64),
    CreateRevision(Revision),
    ModRevision(Revision),
    Value(Vec<u8>),
    Lease(LeaseId),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Compare {
    pub key: Vec<u8>,
    pub result: CompareResult,
    pub target: CompareTarget,
}

impl Compare {
    pub fn create_revision(
        key: impl Into<Vec<u8>>,
        result: CompareResult,
        revision: Revision,
    ) -> Self {
        Self {
            key: key.into(),
            result,
            target: CompareTarget::CreateRevision(revision),
        }
    }

    pub fn mod_revision(
        key: impl Into<Vec<u8>>,
        result: CompareResult,
        revision: Revision,
    ) -> Self {
        Self {
            key: key.into(),
            result,
            target: CompareTarget::ModRevision(revision),
        }
    }

    pub fn version(key: impl Into<Vec<u8>>, result: CompareResult, version: i64) -> Self {
        Self {
            key: key.into(),
            result,
            target: CompareTarget::Version(version),
        }
    }

    pub fn value(
        key: impl Into<Vec<u8>>,
        result: CompareResult,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            key: key.into(),
            result,
            target: CompareTarget::Value(value.into()),
        }
    }

    pub fn lease(key: impl Into<Vec<u8>>, result: CompareResult, lease: LeaseId) -> Self {
        Self {
            key: key.into(),
            result,
            target: CompareTarget::Lease(lease),
        }
    }

    /// Evaluates the comparison against the current state of the key.
    pub fn evaluate(&self, kv: Option<&KeyValue>) -> bool {
        match &self.target {
            CompareTarget::Version(target) => {
                let actual = kv.map(|kv| kv.version).unwrap_or(0);
                self.result.holds(&actual, target)
            }
            CompareTarget::CreateRevision(target) => {
                let actual = kv.map(|kv| kv.create_revision).unwrap_or(0);
                self.result.holds(&actual, target)
            }
            CompareTarget::ModRevision(target) => {
                let actual = kv.map(|kv| kv.mod_revision).unwrap_or(0);
                self.result.holds(&actual, target)
            }
            CompareTarget::Value(target) => {
                let actual = kv.map(|kv| kv.value.as_slice()).unwrap_or(&[]);
                self.result.holds(actual, target.as_slice())
            }
            CompareTarget::Lease(target) => {
                let actual = kv.map(|kv| kv.lease).unwrap_or(0);
                self.result.holds(&actual, target)
            }
        }
    }
}

/// One operation inside a transaction branch.
#[derive(Clone, Debug)]
pub enum TxnOp {
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        options: PutOptions,
    },
    Get {
        key: Vec<u8>,
        options: RangeOptions,
    },
    Delete {
        key: Vec<u8>,
        options: DeleteOptions,
    },
}

impl TxnOp {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, options: PutOptions) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
            options,
        }
    }

    pub fn get(key: impl Into<Vec<u8>>, options: RangeOptions) -> Self {
        TxnOp::Get {
            key: key.into(),
            options,
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>, options: DeleteOptions) -> Self {
        TxnOp::Delete {
            key: key.into(),
            options,
        }
    }

    fn is_write(&self) -> bool {
        !matches!(self, TxnOp::Get { .. })
    }
}

/// Compare-and-branch transaction: `if compares { success } else { failure }`.
#[derive(Clone, Debug, Default)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub success: Vec<TxnOp>,
    pub failure: Vec<TxnOp>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compares: impl IntoIterator<Item = Compare>) -> Self {
        self.compares.extend(compares);
        self
    }

    pub fn and_then(mut self, ops: impl IntoIterator<Item = TxnOp>) -> Self {
        self.success.extend(ops);
        self
    }

    pub fn or_else(mut self, ops: impl IntoIterator<Item = TxnOp>) -> Self {
        self.failure.extend(ops);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxnOpResponse {
    Put(PutResponse),
    Get(RangeResponse),
    Delete(DeleteResponse),
}

impl TxnOpResponse {
    pub fn as_range(&self) -> Option<&RangeResponse> {
        match self {
            TxnOpResponse::Get(r) => Some(r),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxnResponse {
    pub header: ResponseHeader,
    /// Whether the compares held and the success branch ran.
    pub succeeded: bool,
    pub responses: Vec<TxnOpResponse>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseGrantResponse {
    pub id: LeaseId,
    pub ttl: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseKeepAliveResponse {
    pub id: LeaseId,
    /// Renewed TTL in seconds.
    pub ttl: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseTimeToLiveResponse {
    pub id: LeaseId,
    /// Remaining seconds.
    pub ttl: i64,
    pub granted_ttl: i64,
    pub keys: Vec<Vec<u8>>,
}

/// Filter types for watch events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchFilter {
    /// Do not emit delete events.
    NoDelete,
    /// Do not emit put events.
    NoPut,
}

#[derive(Clone, Debug, Default)]
pub struct WatchOptions {
    pub prefix: bool,
    /// Deliver events at or after this revision (0 = only future events).
    pub start_revision: Revision,
    pub prev_kv: bool,
    pub filters: Vec<WatchFilter>,
}

/// A batch of events delivered to one watcher.
#[derive(Clone, Debug)]
pub struct WatchResponse {
    pub watch_id: i64,
    pub header: ResponseHeader,
    pub events: Vec<Event>,
}

type CancelFn = Box<dyn FnOnce(i64) + Send + Sync>;

/// Receiving half of a watch subscription.
///
/// The stream ends when the store drops the subscription (for example because the
/// connection was lost). Dropping the stream cancels the subscription in the store.
pub struct WatchStream {
    watch_id: i64,
    rx: mpsc::UnboundedReceiver<WatchResponse>,
    on_cancel: Option<CancelFn>,
}

impl WatchStream {
    pub fn new(
        watch_id: i64,
        rx: mpsc::UnboundedReceiver<WatchResponse>,
        on_cancel: impl FnOnce(i64) + Send + Sync + 'static,
    ) -> Self {
        Self {
            watch_id,
            rx,
            on_cancel: Some(Box::new(on_cancel)),
        }
    }

    pub fn watch_id(&self) -> i64 {
        self.watch_id
    }

    /// Waits for the next response; `None` once the subscription is closed.
    pub async fn message(&mut self) -> Option<WatchResponse> {
        self.rx.recv().await
    }

    /// Cancels the subscription.
    pub fn cancel(self) {}
}

impl Stream for WatchStream {
    type Item = WatchResponse;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        if let Some(cancel) = self.on_cancel.take() {
            cancel(self.watch_id);
        }
    }
}

impl std::fmt::Debug for WatchStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchStream")
            .field("watch_id", &self.watch_id)
            .finish()
    }
}

/// The consistent key-value store the coordination primitives depend on.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn put(
        &self,
        key: &[u8],
        value: &[u8],
        options: PutOptions,
    ) -> StorageResult<PutResponse>;

    async fn get(&self, key: &[u8], options: RangeOptions) -> StorageResult<RangeResponse>;

    async fn delete(&self, key: &[u8], options: DeleteOptions) -> StorageResult<DeleteResponse>;

    async fn txn(&self, txn: Txn) -> StorageResult<TxnResponse>;

    async fn grant(&self, ttl: i64) -> StorageResult<LeaseGrantResponse>;

    async fn revoke(&self, id: LeaseId) -> StorageResult<()>;

    /// Sends one keep-alive for the lease and returns the acknowledgement.
    async fn keep_alive(&self, id: LeaseId) -> StorageResult<LeaseKeepAliveResponse>;

    async fn time_to_live(&self, id: LeaseId) -> StorageResult<LeaseTimeToLiveResponse>;

    async fn watch(&self, key: &[u8], options: WatchOptions) -> StorageResult<WatchStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_range_end() {
        assert_eq!(prefix_range_end(b"foo"), b"fop".to_vec());
        assert_eq!(prefix_range_end(b"a\xff"), b"b".to_vec());
        assert_eq!(prefix_range_end(b"\xff\xff"), vec![0]);
        assert_eq!(prefix_range_end(b""), vec![0]);
    }

    #[test]
    fn test_compare_missing_key_reads_as_zero() {
        let cmp = Compare::create_revision("lock", CompareResult::Equal, 0);
        assert!(cmp.evaluate(None));

        let kv = KeyValue {
            key: b"lock".to_vec(),
            create_revision: 7,
            mod_revision: 7,
            version: 1,
            value: b"v".to_vec(),
            lease: 3,
        };
        assert!(!cmp.evaluate(Some(&kv)));
        assert!(Compare::lease("lock", CompareResult::Equal, 3).evaluate(Some(&kv)));
        assert!(Compare::value("lock", CompareResult::Greater, "a").evaluate(Some(&kv)));
        assert!(Compare::mod_revision("lock", CompareResult::Less, 8).evaluate(Some(&kv)));
    }

    #[tokio::test]
    async fn test_watch_stream_cancels_on_drop() {
        use std::sync::atomic::{AtomicI64, Ordering};
        use std::sync::Arc;

        let cancelled = Arc::new(AtomicI64::new(0));
        let (_tx, rx) = mpsc::unbounded_channel();
        let flag = cancelled.clone();
        let stream = WatchStream::new(42, rx, move |id| flag.store(id, Ordering::SeqCst));

        stream.cancel();
        assert_eq!(cancelled.load(Ordering::SeqCst), 42);
    }
}
