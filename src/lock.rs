use {
    crate::{
        config::LockConfig,
        error::LockError,
        retry::{retry_with_backoff, Backoff, BackoffPolicy, RetryError},
        store::{with_timeout, LockStore, StoreError},
        token::{AlphanumericTokens, TokenGenerator},
    },
    std::{future::Future, sync::Arc, time::Duration},
    tokio::{
        sync::{oneshot, watch},
        task::JoinHandle,
        time::Instant,
    },
    tracing::{debug, error, info, info_span, trace, warn, Instrument, Span},
};

// Jiffy is interval between system timer interrupts, typically 10ms for linux systems.
const AT_LEAST_10_JIFFIES: Duration = Duration::from_millis(100);

///
/// Creates "managed" locks over a shared [`LockStore`].
///
/// A managed lock's lease is refreshed by a background renewer task until the lock is released or dropped.
///
/// You can clone [`LockManager`] to share it across tasks, it is really cheap to do so.
///
/// Examples
///
/// ```
/// use rust_kv_lock::{config::LockConfig, lock::LockManager, store::MemoryStore};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let lock_man = LockManager::new(MemoryStore::new(), LockConfig::default()).expect("valid config");
///
/// let managed_lock = lock_man.try_lock("test").await.expect("failed to lock");
/// // Do something exclusive
/// assert!(managed_lock.release().await.expect("store reachable"));
/// # });
/// ```
///
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn LockStore>,
    tokens: Arc<dyn TokenGenerator>,
    config: Arc<LockConfig>,
    span: Span,
}

impl LockManager {
    pub fn new(store: impl LockStore, config: LockConfig) -> Result<Self, LockError> {
        Self::with_store(Arc::new(store), config)
    }

    pub fn with_store(store: Arc<dyn LockStore>, config: LockConfig) -> Result<Self, LockError> {
        config.validate()?;
        Ok(Self {
            store,
            tokens: Arc::new(AlphanumericTokens::new(config.token_len)),
            config: Arc::new(config),
            span: Span::none(),
        })
    }

    ///
    /// Replaces the generator of ownership tokens.
    ///
    pub fn with_token_generator(mut self, tokens: impl TokenGenerator) -> Self {
        self.tokens = Arc::new(tokens);
        self
    }

    ///
    /// Parent span of every lock created by this manager, including their renewer tasks.
    ///
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LockStore> {
        &self.store
    }

    pub async fn ping(&self) -> Result<(), LockError> {
        with_timeout(self.config.set_timeout(), self.store.ping()).await?;
        Ok(())
    }

    ///
    /// Blocks until the lock is acquired, using the configured ttl and retry interval.
    ///
    /// See [`LockManager::lock_with`].
    ///
    pub async fn lock(&self, name: impl AsRef<str>) -> ManagedLock {
        let (ttl, retry_interval) = (self.config.ttl(), self.config.retry_interval());
        self.acquire_blocking(name.as_ref(), ttl, retry_interval)
            .await
    }

    ///
    /// Blocks until the lock is acquired.
    ///
    /// While another token holds the key, the acquisition sleeps `retry_interval` between attempts.
    /// Store errors are retried forever after a short fixed wait.
    /// The only way to give up is to drop the returned future, e.g. with [`tokio::time::timeout`].
    ///
    /// Fails only if `ttl` is not compatible with the configured renewal margin.
    ///
    pub async fn lock_with(
        &self,
        name: impl AsRef<str>,
        ttl: Duration,
        retry_interval: Duration,
    ) -> Result<ManagedLock, LockError> {
        self.check_ttl(ttl)?;
        Ok(self
            .acquire_blocking(name.as_ref(), ttl, retry_interval)
            .await)
    }

    ///
    /// Tries to acquire the lock under the configured backoff policy.
    ///
    /// See [`LockManager::try_lock_with`].
    ///
    pub async fn try_lock(&self, name: impl AsRef<str>) -> Result<ManagedLock, LockError> {
        let policy = self.config.backoff.policy();
        self.try_lock_with(name, self.config.ttl(), &policy).await
    }

    ///
    /// Tries to acquire the lock, retrying with exponential backoff until `policy` runs out of time.
    ///
    /// Both contention and transient store errors are retried under the same budget.
    /// Once the budget is exhausted, fails with [`LockError::AcquireTimeout`].
    /// A non-transient store error aborts immediately with [`LockError::StoreUnavailable`].
    ///
    pub async fn try_lock_with(
        &self,
        name: impl AsRef<str>,
        ttl: Duration,
        policy: &BackoffPolicy,
    ) -> Result<ManagedLock, LockError> {
        let key = name.as_ref();
        self.check_ttl(ttl)?;
        let token = self.tokens.generate();
        trace!("Trying to lock {key}...");
        let result = retry_with_backoff(policy, || {
            let token = token.as_str();
            async move {
                let issued_at = Instant::now();
                match self.set_if_absent(key, token, ttl).await {
                    Ok(true) => Ok(issued_at),
                    Ok(false) => {
                        debug!("{key} locked, try again later");
                        Err(Backoff::transient(LockError::LockHeld {
                            key: key.to_string(),
                        }))
                    }
                    Err(e) if e.is_transient() => {
                        warn!("lock {key} failed, retrying: {e}");
                        Err(Backoff::transient(e.into()))
                    }
                    Err(e) => {
                        error!("lock {key} failed due to non-transient state: {e}");
                        Err(Backoff::permanent(e.into()))
                    }
                }
            }
        })
        .await;

        match result {
            Ok(issued_at) => Ok(self.spawn_managed_lock(key, token, ttl, issued_at)),
            Err(RetryError::Exhausted {
                last,
                attempts,
                elapsed,
            }) => {
                warn!("gave up locking {key} after {attempts} attempts in {elapsed:?}: {last}");
                self.abandon(key, &token).await;
                Err(LockError::AcquireTimeout {
                    key: key.to_string(),
                    attempts,
                    elapsed,
                })
            }
            Err(RetryError::Permanent(e)) => {
                self.abandon(key, &token).await;
                Err(e)
            }
        }
    }

    ///
    /// A set that timed out on our side may still have been applied by the store,
    /// leaving the key under this acquisition's token with nobody renewing or releasing it.
    ///
    async fn abandon(&self, key: &str, token: &str) {
        let result = with_timeout(
            self.config.release_timeout(),
            self.store.compare_and_delete(key, token),
        )
        .await;
        match result {
            Ok(true) => warn!("removed {key} left behind by a timed out lock attempt"),
            Ok(false) => {}
            Err(e) => debug!("could not clean up {key} after giving up: {e}"),
        }
    }

    ///
    /// Runs `fut` while holding the lock, then releases it.
    ///
    /// The lock is acquired with [`LockManager::lock`].
    /// If the lease is lost while `fut` runs, `fut` is cancelled and [`LockError::RenewalLost`] is returned.
    ///
    pub async fn with_lock<T, Fut>(&self, name: impl AsRef<str>, fut: Fut) -> Result<T, LockError>
    where
        Fut: Future<Output = T>,
    {
        let managed_lock = self.lock(name).await;
        let result = managed_lock.scope(fut).await;
        let key = managed_lock.key().to_string();
        match managed_lock.release().await {
            Ok(true) => {}
            Ok(false) => warn!("lock {key} expired before the end of its scope"),
            Err(e) => error!("failed to release lock {key}, it will expire on its own: {e}"),
        }
        result
    }

    async fn acquire_blocking(
        &self,
        key: &str,
        ttl: Duration,
        retry_interval: Duration,
    ) -> ManagedLock {
        let token = self.tokens.generate();
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            let issued_at = Instant::now();
            let result = self.set_if_absent(key, &token, ttl).await;
            match result {
                Ok(true) => return self.spawn_managed_lock(key, token, ttl, issued_at),
                Ok(false) => {
                    debug!("{key} locked, try again later");
                    tokio::time::sleep(retry_interval).await;
                }
                Err(e) => {
                    warn!("try lock {key} error (attempt {attempt}): {e}");
                    tokio::time::sleep(self.config.error_wait()).await;
                }
            }
        }
    }

    async fn set_if_absent(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        with_timeout(
            self.config.set_timeout(),
            self.store.set_if_absent(key, token, ttl),
        )
        .await
    }

    fn check_ttl(&self, ttl: Duration) -> Result<(), LockError> {
        let config = LockConfig {
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            ..(*self.config).clone()
        };
        config.validate()
    }

    fn lock_span(&self, key: &str) -> Span {
        if self.span.is_none() {
            info_span!("kv_lock", key)
        } else {
            info_span!(parent: &self.span, "kv_lock", key)
        }
    }

    ///
    /// `acquired_at` is when the winning set was issued: the store applied it no earlier,
    /// so the lease cannot expire before `acquired_at + ttl`.
    ///
    fn spawn_managed_lock(
        &self,
        key: &str,
        token: String,
        ttl: Duration,
        acquired_at: Instant,
    ) -> ManagedLock {
        let span = self.lock_span(key);
        let (stop_tx, stop_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(RenewalState::Active);
        let renewer = Renewer {
            store: Arc::clone(&self.store),
            key: key.to_string(),
            ttl,
            interval: ttl.saturating_sub(self.config.renewal_margin()),
            refresh_timeout: self.config.refresh_timeout(),
            state_tx,
        };
        let renewer = tokio::spawn(renewer.run(acquired_at, stop_rx).instrument(span.clone()));
        span.in_scope(|| info!("acquired lock {key} with ttl {ttl:?}"));
        ManagedLock {
            key: key.to_string(),
            token,
            ttl,
            store: Arc::clone(&self.store),
            release_timeout: self.config.release_timeout(),
            stop_tx: Some(stop_tx),
            renewer: Some(renewer),
            state_rx,
            released: false,
            span,
        }
    }
}

///
/// Lifecycle of the renewer task attached to a [`ManagedLock`].
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalState {
    ///
    /// The lease is refreshed periodically.
    ///
    Active,
    ///
    /// The renewer observed the stop signal, no further refresh will be issued.
    ///
    Stopped,
    ///
    /// A refresh failed or found the key gone: the lease is abandoned.
    ///
    Failed,
}

struct Renewer {
    store: Arc<dyn LockStore>,
    key: String,
    ttl: Duration,
    interval: Duration,
    refresh_timeout: Duration,
    state_tx: watch::Sender<RenewalState>,
}

impl Renewer {
    async fn run(self, acquired_at: Instant, mut stop_rx: oneshot::Receiver<()>) -> RenewalState {
        let key = self.key.as_str();
        let mut last_refresh = acquired_at;
        let mut next_renewal = last_refresh + self.interval;
        let state = loop {
            tokio::select! {
                biased;
                // Also resolves when the lock handle is gone.
                _ = &mut stop_rx => {
                    debug!("got exit signal, renewal of {key} exits");
                    break RenewalState::Stopped;
                }
                _ = tokio::time::sleep_until(next_renewal) => {}
            }

            let since_last_refresh = last_refresh.elapsed();
            if since_last_refresh > self.interval {
                let dt = since_last_refresh - self.interval;
                if dt >= AT_LEAST_10_JIFFIES {
                    warn!("refresh of {key} is {dt:?} late");
                }
            }
            let issued_at = Instant::now();
            let result = with_timeout(
                self.refresh_timeout,
                self.store.refresh_ttl(key, self.ttl),
            )
            .await;
            match result {
                Ok(true) => {
                    trace!(
                        "refreshed {key} with ttl {:?} after {since_last_refresh:?}",
                        self.ttl
                    );
                    last_refresh = issued_at;
                    next_renewal = last_refresh + self.interval;
                }
                Ok(false) => {
                    error!("lock {key} expired before it could be refreshed, lease lost");
                    break RenewalState::Failed;
                }
                Err(e) => {
                    error!("failed to refresh lock {key}, lease abandoned: {e}");
                    break RenewalState::Failed;
                }
            }
        };
        self.state_tx.send_replace(state);
        state
    }
}

///
/// Resolves once the renewer of a lock failed to refresh its lease.
///
#[derive(Clone)]
pub struct RenewalFailedNotify {
    inner: watch::Receiver<RenewalState>,
}

impl RenewalFailedNotify {
    ///
    /// Waits until the renewal fails. Never resolves if the renewer stops normally.
    ///
    pub async fn recv(mut self) {
        let failed = self
            .inner
            .wait_for(|state| *state == RenewalState::Failed)
            .await
            .is_ok();
        if !failed {
            std::future::pending::<()>().await;
        }
    }
}

///
/// A held lock: its key, the ownership token stored under it, and the renewer keeping its lease alive.
///
/// Release it with [`ManagedLock::release`]. Dropping it instead stops the renewer and, when a tokio runtime
/// is available, releases the key in the background.
///
pub struct ManagedLock {
    key: String,
    token: String,
    ttl: Duration,
    store: Arc<dyn LockStore>,
    release_timeout: Duration,
    stop_tx: Option<oneshot::Sender<()>>,
    renewer: Option<JoinHandle<RenewalState>>,
    state_rx: watch::Receiver<RenewalState>,
    released: bool,
    span: Span,
}

impl std::fmt::Debug for ManagedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedLock")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl ManagedLock {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn renewal_state(&self) -> RenewalState {
        *self.state_rx.borrow()
    }

    pub fn is_renewing(&self) -> bool {
        self.renewal_state() == RenewalState::Active
    }

    ///
    /// Fails with [`LockError::RenewalLost`] once the renewer gave up on the lease.
    ///
    pub fn check_renewal(&self) -> Result<(), LockError> {
        match self.renewal_state() {
            RenewalState::Failed => Err(LockError::RenewalLost {
                key: self.key.clone(),
            }),
            _ => Ok(()),
        }
    }

    pub fn renewal_failed_notify(&self) -> RenewalFailedNotify {
        RenewalFailedNotify {
            inner: self.state_rx.clone(),
        }
    }

    ///
    /// Runs `fut` as long as the lease is renewed.
    ///
    /// If the renewal fails, `fut` is dropped and [`LockError::RenewalLost`] is returned.
    ///
    pub async fn scope<T, Fut>(&self, fut: Fut) -> Result<T, LockError>
    where
        Fut: Future<Output = T>,
    {
        self.check_renewal()?;
        let failed = self.renewal_failed_notify();
        tokio::select! {
            out = fut => Ok(out),
            _ = failed.recv() => Err(LockError::RenewalLost {
                key: self.key.clone(),
            }),
        }
    }

    ///
    /// Stops the renewer, waits for it to exit, then deletes the key if it still holds this lock's token.
    ///
    /// Returns `false` if the key no longer held the token: the lease expired and someone else may own it.
    /// Store errors are returned as is, the delete is attempted only once.
    ///
    pub async fn release(mut self) -> Result<bool, LockError> {
        let span = self.span.clone();
        async move {
            self.stop_renewer().await;
            let result = with_timeout(
                self.release_timeout,
                self.store.compare_and_delete(&self.key, &self.token),
            )
            .await;
            // Until here, a cancelled release leaves the delete to `Drop`.
            self.released = true;
            match result {
                Ok(true) => {
                    info!("released lock {}", self.key);
                    Ok(true)
                }
                Ok(false) => {
                    warn!("lock {} was no longer held by this token", self.key);
                    Ok(false)
                }
                Err(e) => {
                    error!("failed to release lock {}: {e}", self.key);
                    Err(LockError::from(e))
                }
            }
        }
        .instrument(span)
        .await
    }

    ///
    /// Same as [`ManagedLock::release`], but a lost ownership is reported as [`LockError::ReleaseMismatch`].
    ///
    pub async fn release_checked(self) -> Result<(), LockError> {
        let key = self.key.clone();
        if self.release().await? {
            Ok(())
        } else {
            Err(LockError::ReleaseMismatch { key })
        }
    }

    async fn stop_renewer(&mut self) -> Option<RenewalState> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        // Kept in place while joining so a cancelled release still lets `Drop` join it.
        let joined = self.renewer.as_mut()?.await;
        self.renewer = None;
        match joined {
            Ok(state) => Some(state),
            Err(e) => {
                error!("renewer of lock {} failed: {e:?}", self.key);
                None
            }
        }
    }
}

impl Drop for ManagedLock {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        let renewer = self.renewer.take();
        if self.released {
            return;
        }
        let rt = match tokio::runtime::Handle::try_current() {
            Ok(rt) => rt,
            Err(_) => {
                if let Some(renewer) = renewer {
                    renewer.abort();
                }
                warn!(
                    "lock {} dropped outside of a runtime, it will expire after {:?}",
                    self.key, self.ttl
                );
                return;
            }
        };
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        let release_timeout = self.release_timeout;
        let cleanup = async move {
            if let Some(renewer) = renewer {
                let _ = renewer.await;
            }
            match with_timeout(release_timeout, store.compare_and_delete(&key, &token)).await {
                Ok(true) => info!("released dropped lock {key}"),
                Ok(false) => debug!("dropped lock {key} was no longer held"),
                Err(e) => {
                    warn!("failed to release dropped lock {key}, it will expire on its own: {e}")
                }
            }
        };
        rt.spawn(cleanup.instrument(self.span.clone()));
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::store::MemoryStore};

    fn test_config() -> LockConfig {
        LockConfig {
            ttl_ms: 3_000,
            renewal_margin_ms: 1_000,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn renewer_should_refresh_at_ttl_minus_margin() {
        let store = MemoryStore::new();
        let lock_man = LockManager::new(store.clone(), test_config()).expect("valid config");

        let managed_lock = lock_man.try_lock("k").await.expect("lock");
        assert_eq!(store.refresh_count(), 0);

        tokio::time::sleep(Duration::from_millis(1_990)).await;
        assert_eq!(store.refresh_count(), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.refresh_count(), 1);
        assert_eq!(store.ttl("k"), Some(Duration::from_millis(2_990)));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.refresh_count(), 2);
        assert!(managed_lock.is_renewing());
    }

    #[tokio::test(start_paused = true)]
    async fn release_should_join_renewer_before_deleting() {
        let store = MemoryStore::new();
        let lock_man = LockManager::new(store.clone(), test_config()).expect("valid config");
        let managed_lock = lock_man.try_lock("k").await.expect("lock");
        let state_rx = managed_lock.state_rx.clone();

        // Land in the middle of a slow refresh.
        store.set_latency(Some(Duration::from_millis(500)));
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(store.refresh_count(), 1);

        assert!(managed_lock.release().await.expect("release"));
        assert_eq!(*state_rx.borrow(), RenewalState::Stopped);
        assert_eq!(store.get("k"), None);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.refresh_count(), 1);
        assert_eq!(store.get("k"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn renewer_should_keep_lease_on_slow_store() {
        let store = MemoryStore::new();
        store.set_latency(Some(Duration::from_millis(900)));
        let lock_man = LockManager::new(store.clone(), LockConfig::default()).expect("valid config");

        let managed_lock = lock_man.try_lock("k").await.expect("lock");
        let token = managed_lock.token().to_string();

        for _ in 0..120 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert_eq!(store.get("k").as_deref(), Some(token.as_str()));
        }
        // issued at 29s, 58s, 87s, 116s
        assert_eq!(store.refresh_count(), 4);
        assert!(managed_lock.is_renewing());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_release_should_leave_delete_to_drop() {
        let store = MemoryStore::new();
        let lock_man = LockManager::new(store.clone(), test_config()).expect("valid config");
        let managed_lock = lock_man.try_lock("k").await.expect("lock");

        store.set_latency(Some(Duration::from_millis(500)));
        let result = tokio::time::timeout(Duration::from_millis(100), managed_lock.release()).await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.get("k"), None);
        assert_eq!(store.refresh_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn renewer_should_fail_when_key_disappears() {
        let store = MemoryStore::new();
        let lock_man = LockManager::new(store.clone(), test_config()).expect("valid config");
        let managed_lock = lock_man.try_lock("k").await.expect("lock");

        store.remove("k");
        managed_lock.renewal_failed_notify().recv().await;

        assert_eq!(managed_lock.renewal_state(), RenewalState::Failed);
        assert!(matches!(
            managed_lock.check_renewal(),
            Err(LockError::RenewalLost { .. })
        ));
        assert!(!managed_lock.release().await.expect("release"));
    }

    #[tokio::test(start_paused = true)]
    async fn scope_should_cancel_future_when_lease_is_lost() {
        let store = MemoryStore::new();
        let lock_man = LockManager::new(store.clone(), test_config()).expect("valid config");
        let managed_lock = lock_man.try_lock("k").await.expect("lock");

        store.remove("k");
        let result = managed_lock
            .scope(async {
                tokio::time::sleep(Duration::from_secs(20)).await;
            })
            .await;

        assert!(matches!(result, Err(LockError::RenewalLost { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_managed_lock_should_release_key() {
        let store = MemoryStore::new();
        let lock_man = LockManager::new(store.clone(), test_config()).expect("valid config");
        let managed_lock = lock_man.try_lock("k").await.expect("lock");
        assert!(store.get("k").is_some());

        drop(managed_lock);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(store.get("k"), None);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.refresh_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lock_with_should_reject_ttl_within_renewal_margin() {
        let lock_man = LockManager::new(MemoryStore::new(), test_config()).expect("valid config");
        let result = lock_man
            .lock_with("k", Duration::from_millis(500), Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(LockError::InvalidConfig(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_should_come_from_the_configured_generator() {
        let store = MemoryStore::new();
        let lock_man = LockManager::new(store.clone(), test_config())
            .expect("valid config")
            .with_token_generator(|| "my-token".to_string());

        let managed_lock = lock_man.lock("k").await;

        assert_eq!(managed_lock.token(), "my-token");
        assert_eq!(store.get("k").as_deref(), Some("my-token"));
    }
}
