///
/// Lock settings, loadable from environment variables and config files.
///
pub mod config;

///
/// Error kinds of lock operations.
///
pub mod error;

///
/// Provides an API over "managed" lock
///
/// A managed lock is a key in a shared store owned through a random token, whose lease is renewed in the
/// background until the lock is released.
///
pub mod lock;

///
/// Process-wide logging setup.
///
pub mod logging;

///
/// Utility function to manage various transient errors.
pub mod retry;

///
/// Key-value stores able to back a lock.
///
pub mod store;

///
/// Ownership token generation.
pub mod token;

pub use {
    config::LockConfig,
    error::{LockError, LockErrorKind},
    lock::{LockManager, ManagedLock, RenewalState},
    store::{LockStore, StoreError},
};
