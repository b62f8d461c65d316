//! Cluster-wide unique id blocks
//!
//! A counter key is advanced with compare-and-swap. A successful call moves
//! the counter from `stored` to `stored + 2 * count` and reports
//! `stored + count + 1` as its first id, so the ids it owns are
//! `stored + count + 1 ..= stored + 2 * count`. Ranges committed by a swap
//! never overlap; half of every step stays unused.

use serde_json::json;
use std::time::Duration;

use crate::agency::client::{AgencyClient, CasCondition};
use crate::agency::result::AgencyCommResult;
use crate::common::Result;

const MAX_TRIES: usize = 10;

impl AgencyClient {
    /// Reserve `count` ids under `key`.
    ///
    /// On success the result's `index` is the first id. After `MAX_TRIES`
    /// lost races the last failed result is returned. A counter that is a
    /// directory, not numeric, or would overflow yields a failed result.
    pub async fn uniqid(&self, key: &str, count: u64, timeout: Duration) -> Result<AgencyCommResult> {
        let mut tries = 0;
        let mut old_value = 0;
        let mut result = AgencyCommResult::failure("uniqid not attempted");

        while tries < MAX_TRIES {
            tries += 1;
            result = self.get_values(key, false).await?;

            if !result.successful() {
                if !result.is_not_found() {
                    return Ok(result);
                }
                // create-only so a racing initializer cannot reset a live counter
                let init = self
                    .cas_value(key, &CasCondition::must_not_exist(), &json!(0), Duration::ZERO, timeout)
                    .await?;
                if !init.successful() && init.status_code != 412 {
                    return Ok(init);
                }
                tracing::debug!("Initialized id counter {}", key);
                tries -= 1;
                continue;
            }

            let is_dir = matches!(result.node(), Ok(Some(ref root)) if root.node.is_dir());
            let stored = result.values.values().next().filter(|_| !is_dir).cloned();
            let Some(stored) = stored else {
                tracing::warn!("Id counter {} holds no value", key);
                return Ok(AgencyCommResult::failure(format!("id counter {} holds no value", key)));
            };
            let Some(current) = stored.as_u64() else {
                tracing::warn!("Id counter {} is not numeric: {}", key, stored.value);
                return Ok(AgencyCommResult::failure(format!("id counter {} is not numeric", key)));
            };
            let Some((old, new_value)) = current
                .checked_add(count)
                .and_then(|old| old.checked_add(count).map(|new| (old, new)))
            else {
                tracing::warn!("Id counter {} exhausted at {}", key, current);
                return Ok(AgencyCommResult::failure(format!("id counter {} exhausted", key)));
            };
            old_value = old;

            result = self
                .cas_value(
                    key,
                    &CasCondition::PrevValue(stored.value),
                    &json!(new_value),
                    Duration::ZERO,
                    timeout,
                )
                .await?;
            if result.successful() {
                break;
            }
            tracing::debug!("Lost id race on {} (try {}/{})", key, tries, MAX_TRIES);
        }

        if result.successful() {
            result.index = old_value.saturating_add(1);
        } else {
            tracing::warn!("Could not reserve {} ids under {}: {}", count, key, result.error_details());
        }
        Ok(result)
    }
}
