//! Default namespace bootstrap
//!
//! Any number of processes may race to initialize a fresh Agency. The one
//! that creates `Init` (create-only, short TTL) writes the default tree and
//! then sets `InitDone`; everybody else waits for `InitDone` to appear.

use serde_json::{json, Value};
use std::time::Duration;

use crate::agency::client::{AgencyClient, CasCondition};
use crate::agency::result::ERROR_NOT_FILE;
use crate::common::Result;

pub const INIT_KEY: &str = "Init";
pub const INIT_DONE_KEY: &str = "InitDone";
pub const INIT_LOCK_TTL: Duration = Duration::from_secs(10);

/// The namespace a fresh cluster starts with
pub fn default_structure() -> Value {
    json!({
        "Current": {
            "Collections": {},
            "Coordinators": {},
            "Databases": {},
            "DBServers": {},
            "Lock": "UNLOCKED",
            "NewServers": {},
            "ServersRegistered": { "Version": 1 },
            "ShardsCopied": {},
            "Version": 1
        },
        "Launchers": {},
        "Plan": {
            "Collections": { "_system": {} },
            "Coordinators": {},
            "Databases": { "_system": { "id": "1", "name": "_system" } },
            "DBServers": {},
            "Lock": "UNLOCKED",
            "Version": 1
        },
        "Sync": {
            "Commands": {},
            "HeartbeatIntervalMs": 1000,
            "LatestID": 1,
            "Problems": {},
            "ServerStates": {},
            "UserVersion": 1
        },
        "Target": {
            "Collections": { "_system": {} },
            "Coordinators": {},
            "Databases": { "_system": { "id": "1", "name": "_system" } },
            "DBServers": {},
            "Lock": "UNLOCKED",
            "MapIDToEndpoint": {},
            "MapLocalToID": {},
            "Version": 1
        }
    })
}

impl AgencyClient {
    pub async fn has_initialized_structure(&self) -> bool {
        self.exists(INIT_DONE_KEY).await
    }

    /// Wait until the default namespace exists, creating it if this process
    /// wins the race. Only returns once `InitDone` is visible.
    pub async fn ensure_structure_initialized(&self) -> bool {
        loop {
            if self.has_initialized_structure().await {
                return true;
            }

            match self.try_initialize_structure().await {
                Ok(true) => {
                    tracing::info!("Agency structure initialized under {}", self.prefix());
                    continue;
                }
                Ok(false) => tracing::debug!("Agency structure is being initialized elsewhere"),
                Err(e) => tracing::warn!("Initializing agency structure failed: {}", e),
            }

            tokio::time::sleep(self.config().init_retry_interval()).await;
        }
    }

    /// One bootstrap attempt. `Ok(false)` if another process holds `Init`.
    pub async fn try_initialize_structure(&self) -> Result<bool> {
        let init = self
            .cas_value(
                INIT_KEY,
                &CasCondition::must_not_exist(),
                &json!(true),
                INIT_LOCK_TTL,
                Duration::ZERO,
            )
            .await?;
        if !init.successful() {
            return Ok(false);
        }

        tracing::info!("Creating default agency structure under {}", self.prefix());
        if !self.materialize(&default_structure()).await? {
            return Ok(false);
        }

        let done = self.set_value(INIT_DONE_KEY, &json!(true), Duration::ZERO).await?;
        Ok(done.successful())
    }

    /// Depth-first: objects become directories, everything else a value
    async fn materialize(&self, tree: &Value) -> Result<bool> {
        let mut stack: Vec<(String, &Value)> = match tree.as_object() {
            Some(map) => map.iter().rev().map(|(k, v)| (k.clone(), v)).collect(),
            None => return Ok(false),
        };

        while let Some((path, value)) = stack.pop() {
            match value.as_object() {
                Some(children) => {
                    let created = self.create_directory(&path).await?;
                    if !created.successful() && created.error_code() != Some(ERROR_NOT_FILE) {
                        tracing::warn!("Creating {} failed: {}", path, created.error_details());
                        return Ok(false);
                    }
                    for (name, child) in children.iter().rev() {
                        stack.push((format!("{}/{}", path, name), child));
                    }
                }
                None => {
                    let written = self.set_value(&path, value, Duration::ZERO).await?;
                    if !written.successful() {
                        tracing::warn!("Writing {} failed: {}", path, written.error_details());
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }
}
