//! etcd-backed distributed lock for voteflow.
//!
//! Acquisition is a single transactional compare-and-set against the etcd
//! cluster: create `/locks/<name>` iff it has never been created, bound to a
//! fresh lease with a 10 second TTL. Losing the transaction means someone
//! else holds the lock; that is `Ok(false)`, not an error. While a lock is
//! held, a background task re-asserts the lease every `TTL / 2` and stops
//! silently the moment the lease is gone, so a crashed holder frees its
//! locks within one TTL.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, ConnectOptions, LeaseClient, PutOptions, Txn, TxnOp};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};
use voteflow_core::lock::{DistributedLock, DEFAULT_TTL};
use voteflow_core::LockError;

/// Key prefix shared with every other replica.
fn lock_key(name: &str) -> String {
    format!("/locks/{name}")
}

/// State kept per held lock.
struct LockEntry {
    lease_id: i64,
    key: String,
    keepalive: JoinHandle<()>,
}

/// Lease-backed lock over an etcd cluster.
pub struct EtcdLock {
    client: Client,
    locks: Mutex<HashMap<String, LockEntry>>,
}

impl EtcdLock {
    /// Connect to the etcd cluster.
    ///
    /// # Errors
    ///
    /// [`LockError::Transport`] when no endpoint is reachable within
    /// `dial_timeout`.
    pub async fn connect<S: AsRef<str>>(
        endpoints: &[S],
        dial_timeout: Duration,
    ) -> Result<Self, LockError> {
        let options = ConnectOptions::new().with_connect_timeout(dial_timeout);
        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(|e| LockError::Transport(format!("etcd connect failed: {e}")))?;
        info!(endpoints = endpoints.len(), "etcd lock client connected");
        Ok(Self {
            client,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Best-effort lease revocation for acquisition paths that lost the race
    /// or hit an error after the grant.
    async fn revoke_quietly(&self, lease_id: i64) {
        let mut lease = self.client.lease_client();
        if let Err(error) = lease.revoke(lease_id).await {
            debug!(lease_id, %error, "lease revoke after failed acquire");
        }
    }

    /// Remove and dismantle one held-lock entry: stop the renewer, delete
    /// the key, revoke the lease.
    async fn release_entry(&self, name: &str, entry: LockEntry) -> Result<(), LockError> {
        entry.keepalive.abort();

        let mut kv = self.client.kv_client();
        kv.delete(entry.key.as_str(), None)
            .await
            .map_err(|e| LockError::Transport(format!("lock key delete failed: {e}")))?;

        let mut lease = self.client.lease_client();
        lease
            .revoke(entry.lease_id)
            .await
            .map_err(|e| LockError::Transport(format!("lease revoke failed: {e}")))?;

        debug!(lock = name, lease_id = entry.lease_id, "lock released");
        Ok(())
    }
}

/// Background lease renewal: one keep-alive every `TTL / 2` until the lease
/// disappears or the task is aborted by `release`.
async fn keep_alive_loop(mut lease: LeaseClient, lease_id: i64, name: String) {
    let (mut keeper, mut stream) = match lease.keep_alive(lease_id).await {
        Ok(pair) => pair,
        Err(error) => {
            warn!(lock = %name, lease_id, %error, "keep-alive channel setup failed");
            return;
        }
    };

    let mut ticker = interval(DEFAULT_TTL / 2);
    // The first tick completes immediately; that early keep-alive is harmless.
    loop {
        ticker.tick().await;
        if let Err(error) = keeper.keep_alive().await {
            debug!(lock = %name, lease_id, %error, "keep-alive send failed, renewer stopping");
            return;
        }
        match stream.message().await {
            Ok(Some(response)) if response.ttl() > 0 => {}
            Ok(_) => {
                debug!(lock = %name, lease_id, "lease expired, renewer stopping");
                return;
            }
            Err(error) => {
                debug!(lock = %name, lease_id, %error, "keep-alive stream failed, renewer stopping");
                return;
            }
        }
    }
}

#[async_trait]
impl DistributedLock for EtcdLock {
    async fn acquire(&self, name: &str, wait: Duration) -> Result<bool, LockError> {
        let mut locks = self.locks.lock().await;
        if locks.contains_key(name) {
            return Err(LockError::AlreadyHeld(name.to_string()));
        }

        let key = lock_key(name);
        let mut lease = self.client.lease_client();
        let grant = timeout(wait, lease.grant(DEFAULT_TTL.as_secs() as i64, None))
            .await
            .map_err(|_| LockError::Transport("lease grant timed out".to_string()))?
            .map_err(|e| LockError::Transport(format!("lease grant failed: {e}")))?;
        let lease_id = grant.id();

        // Create iff the key has never been created, bound to our lease.
        let txn = Txn::new()
            .when(vec![Compare::create_revision(
                key.as_str(),
                CompareOp::Equal,
                0,
            )])
            .and_then(vec![TxnOp::put(
                key.as_str(),
                Vec::<u8>::new(),
                Some(PutOptions::new().with_lease(lease_id)),
            )]);

        let mut kv = self.client.kv_client();
        let response = match timeout(wait, kv.txn(txn)).await {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => {
                self.revoke_quietly(lease_id).await;
                return Err(LockError::Transport(format!("lock transaction failed: {error}")));
            }
            Err(_) => {
                self.revoke_quietly(lease_id).await;
                return Err(LockError::Transport("lock transaction timed out".to_string()));
            }
        };

        if !response.succeeded() {
            // Held by someone else. Contention is not an error.
            self.revoke_quietly(lease_id).await;
            return Ok(false);
        }

        let keepalive = tokio::spawn(keep_alive_loop(
            self.client.lease_client(),
            lease_id,
            name.to_string(),
        ));
        locks.insert(
            name.to_string(),
            LockEntry {
                lease_id,
                key,
                keepalive,
            },
        );
        debug!(lock = name, lease_id, "lock acquired");
        Ok(true)
    }

    async fn refresh(&self, name: &str, wait: Duration) -> Result<bool, LockError> {
        let mut locks = self.locks.lock().await;
        let lease_id = locks
            .get(name)
            .map(|entry| entry.lease_id)
            .ok_or_else(|| LockError::NotHeld(name.to_string()))?;

        let mut lease = self.client.lease_client();
        let outcome = timeout(wait, async {
            let (mut keeper, mut stream) = lease.keep_alive(lease_id).await?;
            keeper.keep_alive().await?;
            stream.message().await
        })
        .await;

        match outcome {
            Ok(Ok(Some(response))) if response.ttl() > 0 => Ok(true),
            Ok(Ok(_)) => {
                // Lease already gone; forget the entry so the caller can
                // re-acquire.
                if let Some(entry) = locks.remove(name) {
                    entry.keepalive.abort();
                }
                Ok(false)
            }
            Ok(Err(error)) => Err(LockError::Transport(format!("lease refresh failed: {error}"))),
            Err(_) => Err(LockError::Transport("lease refresh timed out".to_string())),
        }
    }

    async fn release(&self, name: &str) -> Result<(), LockError> {
        let entry = {
            let mut locks = self.locks.lock().await;
            locks.remove(name)
        };
        match entry {
            Some(entry) => self.release_entry(name, entry).await,
            // Releasing a lock we do not hold is a no-op.
            None => Ok(()),
        }
    }

    async fn release_all(&self) {
        let entries: Vec<(String, LockEntry)> = {
            let mut locks = self.locks.lock().await;
            locks.drain().collect()
        };
        for (name, entry) in entries {
            if let Err(error) = self.release_entry(&name, entry).await {
                warn!(lock = %name, %error, "release during shutdown failed");
            }
        }
    }

    async fn close(&self) {
        self.release_all().await;
        // The client tears down its channels on drop.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_live_under_the_locks_prefix() {
        assert_eq!(lock_key("ticket:producer:lock"), "/locks/ticket:producer:lock");
    }
}
