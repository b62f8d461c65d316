//! Agency endpoint pool
//!
//! Tracks the known replica addresses. Each endpoint spec owns
//! `num_connections` slots that are leased exclusively to one request at a
//! time. The slot order is the preference order: a slot that served a
//! request successfully moves to the front.
//!
//! The state sits behind a single `RwLock` that is never held across I/O.
//! Waiting for a free slot parks on a `Notify` instead of polling.

use std::collections::HashSet;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::Notify;

use crate::agency::transport::Transport;
use crate::common::{Error, Result};

/// Canonicalize an endpoint spec to `tcp://host:port` or `ssl://host:port`
pub fn normalize_endpoint(spec: &str) -> Result<String> {
    let spec = spec.trim().trim_end_matches('/');
    let (scheme, rest) = match spec.split_once("://") {
        Some(("tcp", rest)) | Some(("http", rest)) => ("tcp", rest),
        Some(("ssl", rest)) | Some(("https", rest)) => ("ssl", rest),
        Some(_) => return Err(Error::InvalidEndpoint(spec.to_string())),
        None => ("tcp", spec),
    };

    if rest.is_empty() || rest.contains('/') {
        return Err(Error::InvalidEndpoint(spec.to_string()));
    }
    match rest.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
        _ => return Err(Error::InvalidEndpoint(spec.to_string())),
    }

    Ok(format!("{}://{}", scheme, rest))
}

/// HTTP base URL for an endpoint spec
pub fn endpoint_base_url(spec: &str) -> Result<String> {
    if let Some(rest) = spec.strip_prefix("tcp://") {
        Ok(format!("http://{}", rest))
    } else if let Some(rest) = spec.strip_prefix("ssl://") {
        Ok(format!("https://{}", rest))
    } else {
        Err(Error::InvalidEndpoint(spec.to_string()))
    }
}

#[derive(Debug, Clone)]
struct EndpointSlot {
    id: u64,
    spec: String,
    busy: bool,
}

#[derive(Debug, Default)]
struct PoolState {
    slots: Vec<EndpointSlot>,
    next_id: u64,
}

impl PoolState {
    fn find_idle(&self, preferred: Option<&str>, exclude: &HashSet<u64>) -> Option<usize> {
        let matches = |slot: &EndpointSlot| {
            !slot.busy && preferred.map_or(true, |spec| slot.spec == spec)
        };
        self.slots
            .iter()
            .position(|slot| matches(slot) && !exclude.contains(&slot.id))
            .or_else(|| self.slots.iter().position(matches))
    }

    fn has_candidate(&self, preferred: Option<&str>) -> bool {
        match preferred {
            Some(spec) => self.slots.iter().any(|slot| slot.spec == spec),
            None => !self.slots.is_empty(),
        }
    }
}

/// Pool of leasable connection slots to Agency replicas
#[derive(Debug)]
pub struct EndpointPool {
    state: RwLock<PoolState>,
    released: Notify,
    num_connections: usize,
}

impl EndpointPool {
    pub fn new(num_connections: usize) -> Self {
        Self {
            state: RwLock::new(PoolState::default()),
            released: Notify::new(),
            num_connections: num_connections.max(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, PoolState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, PoolState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add an endpoint spec. Returns false if it was already known.
    pub fn add_endpoint(&self, spec: &str, to_front: bool) -> Result<bool> {
        let spec = normalize_endpoint(spec)?;
        let mut state = self.write();
        if state.slots.iter().any(|slot| slot.spec == spec) {
            return Ok(false);
        }

        for _ in 0..self.num_connections {
            let slot = EndpointSlot {
                id: state.next_id,
                spec: spec.clone(),
                busy: false,
            };
            state.next_id += 1;
            if to_front {
                state.slots.insert(0, slot);
            } else {
                state.slots.push(slot);
            }
        }
        drop(state);

        tracing::info!("Added agency endpoint {}", spec);
        self.released.notify_waiters();
        Ok(true)
    }

    pub fn has_endpoint(&self, spec: &str) -> bool {
        match normalize_endpoint(spec) {
            Ok(spec) => self.read().slots.iter().any(|slot| slot.spec == spec),
            Err(_) => false,
        }
    }

    /// Spec of every slot, in preference order
    pub fn specs(&self) -> Vec<String> {
        self.read().slots.iter().map(|slot| slot.spec.clone()).collect()
    }

    /// Distinct specs, in order of first appearance
    pub fn unique_specs(&self) -> Vec<String> {
        let state = self.read();
        let mut seen = HashSet::new();
        state
            .slots
            .iter()
            .filter(|slot| seen.insert(slot.spec.as_str()))
            .map(|slot| slot.spec.clone())
            .collect()
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.read().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().slots.is_empty()
    }

    pub fn busy_count(&self) -> usize {
        self.read().slots.iter().filter(|slot| slot.busy).count()
    }

    /// Lease an idle slot, waiting until one is free.
    ///
    /// With `preferred` set only slots of that spec qualify. Fails when no
    /// slot could ever qualify, since waiting would never end.
    pub async fn pop_endpoint(&self, preferred: Option<&str>) -> Result<EndpointLease<'_>> {
        self.pop_endpoint_excluding(preferred, &HashSet::new()).await
    }

    /// Like [`pop_endpoint`](Self::pop_endpoint), but skips the slot ids in
    /// `exclude` while any other qualifying slot is idle.
    pub async fn pop_endpoint_excluding(
        &self,
        preferred: Option<&str>,
        exclude: &HashSet<u64>,
    ) -> Result<EndpointLease<'_>> {
        loop {
            let released = self.released.notified();
            {
                let mut state = self.write();
                if let Some(pos) = state.find_idle(preferred, exclude) {
                    let slot = &mut state.slots[pos];
                    slot.busy = true;
                    return Ok(EndpointLease {
                        pool: self,
                        id: slot.id,
                        spec: slot.spec.clone(),
                        returned: false,
                    });
                }
                if !state.has_candidate(preferred) {
                    return Err(Error::UnknownEndpoint(
                        preferred.unwrap_or("<no endpoints>").to_string(),
                    ));
                }
            }
            released.await;
        }
    }

    /// Return a leased slot. A successful slot becomes the preferred one.
    pub fn requeue_endpoint(&self, id: u64, was_successful: bool) {
        let mut state = self.write();
        if let Some(pos) = state.slots.iter().position(|slot| slot.id == id) {
            state.slots[pos].busy = false;
            if was_successful && pos != 0 {
                let slot = state.slots.remove(pos);
                state.slots.insert(0, slot);
            }
        }
        drop(state);
        self.released.notify_waiters();
    }

    /// Try each endpoint until one connects; sleeps and starts over otherwise.
    ///
    /// Returns false only when the pool has no endpoints at all.
    pub async fn try_connect_any(
        &self,
        transport: &dyn Transport,
        timeout: Duration,
        retry_interval: Duration,
    ) -> bool {
        loop {
            let candidates = self.unique_specs();
            if candidates.is_empty() {
                return false;
            }

            for spec in candidates {
                match transport.connect(&spec, timeout).await {
                    Ok(()) => {
                        tracing::debug!("Connected to agency endpoint {}", spec);
                        return true;
                    }
                    Err(e) if e.is_retryable() => {
                        tracing::warn!("Cannot connect to agency endpoint {}: {}", spec, e)
                    }
                    Err(e) => tracing::error!("Agency endpoint {} unusable: {}", spec, e),
                }
            }

            tokio::time::sleep(retry_interval).await;
        }
    }

    /// Disconnect every endpoint, keeping the slots
    pub async fn disconnect(&self, transport: &dyn Transport) {
        for spec in self.unique_specs() {
            transport.disconnect(&spec).await;
        }
    }

    /// Disconnect, wait for all leases to come back, then drop every slot
    pub async fn cleanup(&self, transport: &dyn Transport) {
        self.disconnect(transport).await;
        loop {
            let released = self.released.notified();
            if self.busy_count() == 0 {
                break;
            }
            released.await;
        }
        self.write().slots.clear();
        tracing::info!("Agency endpoint pool cleaned up");
    }
}

/// Exclusive lease on one pool slot.
///
/// Hand it back with [`release`](Self::release). A lease dropped without
/// release (for instance when the request future is cancelled) goes back
/// as unsuccessful.
#[derive(Debug)]
pub struct EndpointLease<'a> {
    pool: &'a EndpointPool,
    id: u64,
    spec: String,
    returned: bool,
}

impl EndpointLease<'_> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn spec(&self) -> &str {
        &self.spec
    }

    pub fn release(mut self, was_successful: bool) {
        self.returned = true;
        self.pool.requeue_endpoint(self.id, was_successful);
    }
}

impl Drop for EndpointLease<'_> {
    fn drop(&mut self) {
        if !self.returned {
            self.pool.requeue_endpoint(self.id, false);
        }
    }
}
