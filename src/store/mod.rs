use {
    std::{error::Error as StdError, future::Future, time::Duration},
    thiserror::Error,
};

///
/// etcd-backed lock store.
///
pub mod etcd;

///
/// In-process lock store, mostly useful for tests and single-node setups.
///
pub mod memory;

pub use {etcd::EtcdStore, memory::MemoryStore};

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(#[source] BoxError),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store rejected the request: {0}")]
    Rejected(#[source] BoxError),
}

impl StoreError {
    pub fn unavailable(err: impl Into<BoxError>) -> Self {
        Self::Unavailable(err.into())
    }

    pub fn rejected(err: impl Into<BoxError>) -> Self {
        Self::Rejected(err.into())
    }

    ///
    /// Transient errors are caused by outside forces (network partition, slow store) and are worth retrying.
    ///
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

///
/// The three atomic primitives a shared key-value store must offer to back a lock.
///
/// Implementations must perform each operation atomically on the store side:
/// a lock is never released with a read-then-delete, it always goes through [`LockStore::compare_and_delete`].
///
#[async_trait::async_trait]
pub trait LockStore: Send + Sync + 'static {
    ///
    /// Creates `key = value` with the given time-to-live only if `key` is absent.
    ///
    /// Returns `true` if the entry was created, `false` if another value already occupies the key.
    ///
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    ///
    /// Resets the expiry of an existing entry.
    ///
    /// Returns `false` if the key no longer exists.
    ///
    async fn refresh_ttl(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    ///
    /// Deletes `key` only if its current value equals `expected`.
    ///
    /// Returns `false` on mismatch or if the key is absent.
    ///
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    ///
    /// Round trip to the store, used as a health check.
    ///
    async fn ping(&self) -> Result<(), StoreError>;
}

///
/// Bounds a store call so a slow or partitioned store cannot hang the caller.
///
pub async fn with_timeout<T, Fut>(timeout: Duration, fut: Fut) -> Result<T, StoreError>
where
    Fut: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}
