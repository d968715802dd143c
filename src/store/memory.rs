use {
    super::{LockStore, StoreError},
    std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc, Mutex, MutexGuard, PoisonError,
        },
        time::Duration,
    },
    tokio::time::Instant,
};

struct Entry {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    entries: Mutex<HashMap<String, Entry>>,
    unavailable: AtomicBool,
    latency: Mutex<Option<Duration>>,
    refresh_count: AtomicU64,
}

///
/// In-process [`LockStore`] with the same atomicity as a networked store.
///
/// Expiry is evaluated lazily against [`tokio::time::Instant`], so it follows paused/advanced time in tests.
/// Cloning is cheap and clones share the same entries.
///
/// The store can be made unavailable or slow to simulate a partitioned store.
///
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    ///
    /// When `false`, every call fails with [`StoreError::Unavailable`]. Entries keep expiring meanwhile.
    ///
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::Release);
    }

    ///
    /// Adds an artificial delay before every call.
    ///
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self
            .inner
            .latency
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = latency;
    }

    ///
    /// Current live value of `key`.
    ///
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.entries()
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone())
    }

    ///
    /// Remaining time-to-live of `key`.
    ///
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries()
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.expires_at - now)
    }

    ///
    /// Unconditionally overwrites `key`, as if another holder took it over.
    ///
    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>, ttl: Duration) {
        self.entries().insert(
            key.into(),
            Entry {
                value: value.into(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    ///
    /// Unconditionally removes `key`.
    ///
    pub fn remove(&self, key: &str) {
        self.entries().remove(key);
    }

    ///
    /// Number of refresh calls that reached the store, successful or not.
    ///
    pub fn refresh_count(&self) -> u64 {
        self.inner.refresh_count.load(Ordering::Acquire)
    }

    async fn enter(&self) -> Result<(), StoreError> {
        let latency = *self
            .inner
            .latency
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.inner.unavailable.load(Ordering::Acquire) {
            return Err(StoreError::unavailable("memory store is unavailable"));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl LockStore for MemoryStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.enter().await?;
        let now = Instant::now();
        let mut entries = self.entries();
        if entries.get(key).is_some_and(|entry| entry.expires_at > now) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn refresh_ttl(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.inner.refresh_count.fetch_add(1, Ordering::AcqRel);
        self.enter().await?;
        let now = Instant::now();
        let mut entries = self.entries();
        let live = entries.get(key).is_some_and(|entry| entry.expires_at > now);
        if !live {
            entries.remove(key);
            return Ok(false);
        }
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = now + ttl;
        }
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.enter().await?;
        let now = Instant::now();
        let mut entries = self.entries();
        let owned = entries
            .get(key)
            .is_some_and(|entry| entry.expires_at > now && entry.value == expected);
        if owned {
            entries.remove(key);
        }
        Ok(owned)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.enter().await
    }
}
