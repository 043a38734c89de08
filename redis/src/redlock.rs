//! Quorum lock over independent Redis nodes.
//!
//! Alternative lock backend for deployments without an etcd cluster,
//! selected with `lock.backend: redlock`. Acquisition writes
//! `name -> token` with NX+PX on every node and counts; the lock is held
//! when a majority accepted it before the TTL ate the validity window.
//! Refresh and release only touch keys that still carry this instance's
//! token, guarded by small compare-scripts so another holder's lock is
//! never extended or deleted.

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{Client, Script};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};
use voteflow_core::{DistributedLock, LockError};

/// Extend the TTL iff the key still carries our token.
const REFRESH_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Delete the key iff it still carries our token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Delay between failed acquisition rounds.
const RETRY_PAUSE: Duration = Duration::from_millis(100);

/// Majority threshold for a cluster of `size` nodes.
pub(crate) const fn quorum(size: usize) -> usize {
    size / 2 + 1
}

/// Quorum lock across N independent Redis nodes.
pub struct RedLock {
    nodes: Vec<ConnectionManager>,
    addresses: Vec<String>,
    locks: Mutex<HashMap<String, String>>,
    retries: u32,
    refresh_script: Script,
    release_script: Script,
}

impl RedLock {
    /// Connect to every lock node. Any unreachable node fails construction;
    /// a degraded cluster at boot would silently weaken the quorum.
    ///
    /// # Errors
    ///
    /// [`LockError::Transport`] naming the node that refused the connection.
    pub async fn connect(
        addresses: &[String],
        password: &str,
        db: i64,
        retries: u32,
        response_timeout: Duration,
    ) -> Result<Self, LockError> {
        if addresses.is_empty() {
            return Err(LockError::Transport(
                "redlock requires at least one lock node".to_string(),
            ));
        }

        let mut nodes = Vec::with_capacity(addresses.len());
        for address in addresses {
            let url = crate::connection_url(address, password, db);
            let client = Client::open(url.as_str())
                .map_err(|e| LockError::Transport(format!("lock node {address}: {e}")))?;
            let config = ConnectionManagerConfig::new()
                .set_connection_timeout(response_timeout)
                .set_response_timeout(response_timeout);
            let conn = ConnectionManager::new_with_config(client, config)
                .await
                .map_err(|e| LockError::Transport(format!("lock node {address}: {e}")))?;
            nodes.push(conn);
        }

        Ok(Self {
            nodes,
            addresses: addresses.to_vec(),
            locks: Mutex::new(HashMap::new()),
            retries,
            refresh_script: Script::new(REFRESH_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        })
    }

    /// Delete `name` on every node where it still carries `token`.
    async fn unlock_all(&self, name: &str, token: &str) {
        for (node, address) in self.nodes.iter().zip(&self.addresses) {
            let mut conn = node.clone();
            let result: Result<i64, _> = self
                .release_script
                .key(name)
                .arg(token)
                .invoke_async(&mut conn)
                .await;
            if let Err(error) = result {
                warn!(lock = name, node = %address, %error, "lock release on node failed");
            }
        }
    }
}

#[async_trait]
impl DistributedLock for RedLock {
    async fn acquire(&self, name: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut locks = self.locks.lock().await;
        if locks.contains_key(name) {
            return Err(LockError::AlreadyHeld(name.to_string()));
        }

        let token = format!("{:032x}", rand::random::<u128>());
        let ttl_ms = ttl.as_millis() as u64;

        for round in 0..self.retries.max(1) {
            let started = Instant::now();
            let mut accepted = 0usize;

            for (node, address) in self.nodes.iter().zip(&self.addresses) {
                let mut conn = node.clone();
                let outcome: Result<Option<String>, _> = redis::cmd("SET")
                    .arg(name)
                    .arg(&token)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async(&mut conn)
                    .await;
                match outcome {
                    Ok(Some(_)) => accepted += 1,
                    Ok(None) => {}
                    Err(error) => {
                        warn!(lock = name, node = %address, %error, "lock set on node failed");
                    }
                }
            }

            let validity = ttl.checked_sub(started.elapsed());
            if accepted >= quorum(self.nodes.len()) && validity.is_some() {
                locks.insert(name.to_string(), token);
                debug!(lock = name, round, "quorum lock acquired");
                return Ok(true);
            }

            // No quorum: roll back the partial acquisitions before retrying.
            self.unlock_all(name, &token).await;
            sleep(RETRY_PAUSE).await;
        }

        Ok(false)
    }

    async fn refresh(&self, name: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut locks = self.locks.lock().await;
        let token = locks
            .get(name)
            .cloned()
            .ok_or_else(|| LockError::NotHeld(name.to_string()))?;

        let ttl_ms = ttl.as_millis() as u64;
        let mut extended = 0usize;
        for (node, address) in self.nodes.iter().zip(&self.addresses) {
            let mut conn = node.clone();
            let outcome: Result<i64, _> = self
                .refresh_script
                .key(name)
                .arg(&token)
                .arg(ttl_ms)
                .invoke_async(&mut conn)
                .await;
            match outcome {
                Ok(1) => extended += 1,
                Ok(_) => {}
                Err(error) => {
                    warn!(lock = name, node = %address, %error, "lock refresh on node failed");
                }
            }
        }

        if extended >= quorum(self.nodes.len()) {
            Ok(true)
        } else {
            // Quorum lost; the entry is stale.
            locks.remove(name);
            Ok(false)
        }
    }

    async fn release(&self, name: &str) -> Result<(), LockError> {
        let token = {
            let mut locks = self.locks.lock().await;
            locks.remove(name)
        };
        if let Some(token) = token {
            self.unlock_all(name, &token).await;
        }
        Ok(())
    }

    async fn release_all(&self) {
        let held: Vec<(String, String)> = {
            let mut locks = self.locks.lock().await;
            locks.drain().collect()
        };
        for (name, token) in held {
            self.unlock_all(&name, &token).await;
        }
    }

    async fn close(&self) {
        self.release_all().await;
    }
}
