//! TTL locks built from compare-and-swap
//!
//! The lock for `<key>` is the value at `<key>/Lock`: `"UNLOCKED"`,
//! `"READ"` or `"WRITE"`. Acquire swaps `UNLOCKED` for the wanted type (or
//! creates the key if it is missing), release swaps it back. Both retry
//! with linear backoff until their deadline.
//!
//! Write locks also maintain `<key>/Version`, bumped on every release, as a
//! generation counter for the locked subtree.

use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::Instant;

use crate::agency::client::{AgencyClient, CasCondition};

pub const LOCK_UNLOCKED: &str = "UNLOCKED";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Read,
    Write,
}

impl LockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockType::Read => "READ",
            LockType::Write => "WRITE",
        }
    }

    fn value(&self) -> Value {
        json!(self.as_str())
    }
}

impl std::fmt::Display for LockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn lock_key(key: &str) -> String {
    format!("{}/Lock", key.trim_end_matches('/'))
}

fn version_key(key: &str) -> String {
    format!("{}/Version", key.trim_end_matches('/'))
}

impl AgencyClient {
    fn lock_defaults(&self, ttl: Duration, timeout: Duration) -> (Duration, Duration) {
        let default = self.config().lock_timeout();
        (
            if ttl.is_zero() { default } else { ttl },
            if timeout.is_zero() { default } else { timeout },
        )
    }

    async fn backoff(&self, sleep_time: &mut Duration, deadline: Instant) -> bool {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep((*sleep_time).min(deadline - now)).await;
        *sleep_time = (*sleep_time + self.config().initial_sleep_time()).min(self.config().max_sleep_time());
        true
    }

    /// Acquire the lock on `key`. Zero `ttl`/`timeout` use the configured
    /// lock timeout. Returns false if the deadline passed first.
    pub async fn lock(&self, key: &str, ttl: Duration, timeout: Duration, lock_type: LockType) -> bool {
        let (ttl, timeout) = self.lock_defaults(ttl, timeout);
        let deadline = Instant::now() + timeout;
        let mut sleep_time = self.config().initial_sleep_time();
        let lock_key = lock_key(key);
        let desired = lock_type.value();
        let unlocked = CasCondition::prev_value(&json!(LOCK_UNLOCKED));

        loop {
            match self.cas_value(&lock_key, &unlocked, &desired, ttl, timeout).await {
                Ok(result) if result.successful() => {
                    tracing::debug!("Acquired {} lock on {}", lock_type, key);
                    return true;
                }
                Ok(result) if result.is_not_found() => {
                    match self
                        .cas_value(&lock_key, &CasCondition::must_not_exist(), &desired, ttl, timeout)
                        .await
                    {
                        Ok(created) if created.successful() => {
                            tracing::debug!("Acquired {} lock on {} (created)", lock_type, key);
                            return true;
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!("Creating lock {} failed: {}", lock_key, e),
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Locking {} failed: {}", lock_key, e),
            }

            if !self.backoff(&mut sleep_time, deadline).await {
                tracing::warn!("Timed out acquiring {} lock on {} after {:?}", lock_type, key, timeout);
                return false;
            }
        }
    }

    /// Release a lock held as `lock_type`
    pub async fn unlock(&self, key: &str, lock_type: LockType, timeout: Duration) -> bool {
        let (_, timeout) = self.lock_defaults(Duration::ZERO, timeout);
        let deadline = Instant::now() + timeout;
        let mut sleep_time = self.config().initial_sleep_time();
        let lock_key = lock_key(key);
        let held = CasCondition::prev_value(&lock_type.value());
        let unlocked = json!(LOCK_UNLOCKED);

        loop {
            match self.cas_value(&lock_key, &held, &unlocked, Duration::ZERO, timeout).await {
                Ok(result) if result.successful() => {
                    tracing::debug!("Released {} lock on {}", lock_type, key);
                    return true;
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Unlocking {} failed: {}", lock_key, e),
            }

            if !self.backoff(&mut sleep_time, deadline).await {
                tracing::warn!("Timed out releasing {} lock on {} after {:?}", lock_type, key, timeout);
                return false;
            }
        }
    }

    pub async fn lock_read(&self, key: &str, ttl: Duration, timeout: Duration) -> bool {
        self.lock(key, ttl, timeout, LockType::Read).await
    }

    pub async fn lock_write(&self, key: &str, ttl: Duration, timeout: Duration) -> bool {
        self.lock(key, ttl, timeout, LockType::Write).await
    }

    pub async fn unlock_read(&self, key: &str, timeout: Duration) -> bool {
        self.unlock(key, LockType::Read, timeout).await
    }

    pub async fn unlock_write(&self, key: &str, timeout: Duration) -> bool {
        self.unlock(key, LockType::Write, timeout).await
    }

    /// Acquire a lock bound to a [`LockScope`]; `None` if not acquired
    pub async fn lock_scoped(
        &self,
        key: &str,
        lock_type: LockType,
        ttl: Duration,
        timeout: Duration,
    ) -> Option<LockScope> {
        if !self.lock(key, ttl, timeout, lock_type).await {
            return None;
        }

        let mut scope = LockScope {
            client: self.clone(),
            key: key.to_string(),
            lock_type,
            version: 0,
            held: true,
        };
        if !scope.fetch_version().await {
            tracing::warn!("Could not read lock version of {}", key);
        }
        Some(scope)
    }

    pub async fn lock_read_scoped(&self, key: &str, ttl: Duration, timeout: Duration) -> Option<LockScope> {
        self.lock_scoped(key, LockType::Read, ttl, timeout).await
    }

    pub async fn lock_write_scoped(&self, key: &str, ttl: Duration, timeout: Duration) -> Option<LockScope> {
        self.lock_scoped(key, LockType::Write, ttl, timeout).await
    }
}

/// A held Agency lock.
///
/// Call [`release`](Self::release) when the critical section ends. If the
/// scope is dropped while still held, the release is spawned onto the
/// current tokio runtime instead; either way it happens once.
#[derive(Debug)]
pub struct LockScope {
    client: AgencyClient,
    key: String,
    lock_type: LockType,
    version: u64,
    held: bool,
}

impl LockScope {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn lock_type(&self) -> LockType {
        self.lock_type
    }

    /// `<key>/Version` as read on acquire (write locks only, 0 if absent)
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_locked(&self) -> bool {
        self.held
    }

    async fn fetch_version(&mut self) -> bool {
        if self.lock_type != LockType::Write {
            return true;
        }
        match self.client.get_values(&version_key(&self.key), false).await {
            Ok(result) if result.successful() => {
                self.version = result
                    .values
                    .values()
                    .next()
                    .and_then(|entry| entry.as_u64())
                    .unwrap_or(0);
                true
            }
            Ok(result) => result.is_not_found(),
            Err(_) => false,
        }
    }

    /// Bump the version (if a write lock) and unlock
    pub async fn release(mut self) -> bool {
        self.held = false;
        release_lock(&self.client, &self.key, self.lock_type, self.version).await
    }
}

impl Drop for LockScope {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;

        let client = self.client.clone();
        let key = std::mem::take(&mut self.key);
        let (lock_type, version) = (self.lock_type, self.version);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    release_lock(&client, &key, lock_type, version).await;
                });
            }
            Err(_) => tracing::error!("Lock {} dropped outside a runtime, held until its TTL", key),
        }
    }
}

async fn release_lock(client: &AgencyClient, key: &str, lock_type: LockType, version: u64) -> bool {
    if lock_type == LockType::Write {
        let version_key = version_key(key);
        let (condition, next) = if version == 0 {
            (CasCondition::must_not_exist(), 1)
        } else {
            (CasCondition::prev_value(&json!(version)), version + 1)
        };
        match client
            .cas_value(&version_key, &condition, &json!(next), Duration::ZERO, Duration::ZERO)
            .await
        {
            Ok(result) if result.successful() => {}
            Ok(result) => tracing::warn!("Bumping {} failed: {}", version_key, result.error_details()),
            Err(e) => tracing::warn!("Bumping {} failed: {}", version_key, e),
        }
    }
    client.unlock(key, lock_type, Duration::ZERO).await
}
