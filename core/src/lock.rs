//! Distributed mutual exclusion with lease renewal.
//!
//! The service uses two locks: a service-start lock that elects the ticket
//! producer for the process lifetime, and a producer lock that serializes
//! individual mints across the fleet. Both go through this trait so the
//! backend (etcd lease transactions or a Redis quorum) is swappable in
//! configuration and replaceable with an in-memory fake in tests.

use crate::error::LockError;
use async_trait::async_trait;
use std::time::Duration;

/// Lease TTL granted for every held lock. A crashed holder frees its locks
/// within one TTL; live holders re-assert the lease every `DEFAULT_TTL / 2`.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

/// A lease-backed distributed lock.
///
/// `acquire` is a try-lock with bounded wait: `Ok(true)` means the caller
/// now exclusively holds the name, `Ok(false)` means another holder owns it
/// (contention is informational, not an error), and `Err` is reserved for
/// transport failures. While held, the implementation renews the lease in
/// the background until `release`.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try to take `name`, waiting at most `timeout` for the backend.
    ///
    /// # Errors
    ///
    /// [`LockError::AlreadyHeld`] if this instance already holds `name`
    /// (callers must not double-acquire), or [`LockError::Transport`] on a
    /// backend failure.
    async fn acquire(&self, name: &str, timeout: Duration) -> Result<bool, LockError>;

    /// Re-assert the lease behind a held lock.
    ///
    /// Returns `Ok(false)` when the lease has already expired; the entry is
    /// forgotten and the caller must re-acquire.
    ///
    /// # Errors
    ///
    /// [`LockError::Transport`] on a backend failure.
    async fn refresh(&self, name: &str, timeout: Duration) -> Result<bool, LockError>;

    /// Release a held lock: stop the renewer, delete the key, revoke the
    /// lease. Releasing a lock this instance does not hold is a no-op.
    ///
    /// # Errors
    ///
    /// [`LockError::Transport`] on a backend failure.
    async fn release(&self, name: &str) -> Result<(), LockError>;

    /// Release every lock this instance holds. Failures are logged by the
    /// implementation; release-all is best-effort shutdown hygiene.
    async fn release_all(&self);

    /// Release everything and tear down the backend client.
    async fn close(&self);
}
