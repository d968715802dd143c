use {crate::store::StoreError, std::time::Duration, thiserror::Error};

///
/// Kind of a [`LockError`], for callers that branch on the failure rather than its message.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockErrorKind {
    StoreUnavailable,
    LockHeld,
    RenewalLost,
    AcquireTimeout,
    ReleaseMismatch,
    InvalidConfig,
}

#[derive(Debug, Error)]
pub enum LockError {
    ///
    /// The store could not be reached, timed out or refused the request.
    ///
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    ///
    /// The key is owned by another token. Drives retry loops and is never returned by the acquire calls.
    ///
    #[error("lock `{key}` is held by another owner")]
    LockHeld { key: String },
    ///
    /// The renewer could not refresh the lease: the key expired or the store failed.
    ///
    #[error("lease on lock `{key}` was lost during renewal")]
    RenewalLost { key: String },
    ///
    /// Bounded acquisition spent its whole retry budget.
    ///
    #[error("failed to acquire lock `{key}` after {attempts} attempts in {elapsed:?}")]
    AcquireTimeout {
        key: String,
        attempts: u32,
        elapsed: Duration,
    },
    ///
    /// The key no longer holds this lock's token: it expired and may have been taken over.
    ///
    #[error("lock `{key}` is no longer owned by this token")]
    ReleaseMismatch { key: String },
    #[error("invalid lock configuration: {0}")]
    InvalidConfig(String),
}

impl LockError {
    pub fn kind(&self) -> LockErrorKind {
        match self {
            Self::StoreUnavailable(_) => LockErrorKind::StoreUnavailable,
            Self::LockHeld { .. } => LockErrorKind::LockHeld,
            Self::RenewalLost { .. } => LockErrorKind::RenewalLost,
            Self::AcquireTimeout { .. } => LockErrorKind::AcquireTimeout,
            Self::ReleaseMismatch { .. } => LockErrorKind::ReleaseMismatch,
            Self::InvalidConfig(_) => LockErrorKind::InvalidConfig,
        }
    }

    ///
    /// Contention and lease expiry are expected outcomes of a lease-based lock, not faults.
    ///
    pub fn is_benign(&self) -> bool {
        matches!(
            self.kind(),
            LockErrorKind::LockHeld | LockErrorKind::ReleaseMismatch
        )
    }
}
