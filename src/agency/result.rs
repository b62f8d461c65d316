//! Outcome of one logical Agency operation

use std::collections::BTreeMap;

use crate::agency::node::{flatten, KeyedNode, ResponseBody};
use crate::agency::transport::TransportResponse;
use crate::common::Result;

/// etcd error code for a missing key
pub const ERROR_KEY_NOT_FOUND: u32 = 100;
/// etcd error code for a failed `prevValue` comparison
pub const ERROR_COMPARE_FAILED: u32 = 101;
/// etcd error code for a malformed request parameter
pub const ERROR_INVALID_FIELD: u32 = 209;
/// etcd error code for a value operation on a directory (or a second mkdir)
pub const ERROR_NOT_FILE: u32 = 102;
/// etcd error code for a write below a value
pub const ERROR_NOT_DIR: u32 = 104;
/// etcd error code for a `prevExist=false` write on an existing key
pub const ERROR_NODE_EXIST: u32 = 105;
/// etcd error code for writes to the root
pub const ERROR_ROOT_READ_ONLY: u32 = 107;
/// etcd error code for a `waitIndex` older than the retained history
pub const ERROR_EVENT_INDEX_CLEARED: u32 = 401;

/// One flattened value
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AgencyEntry {
    /// Raw stored value (JSON text for values written by this client)
    pub value: String,
    pub index: u64,
    pub is_dir: bool,
}

impl AgencyEntry {
    pub fn new(value: impl Into<String>, index: u64) -> Self {
        Self {
            value: value.into(),
            index,
            is_dir: false,
        }
    }

    pub fn directory() -> Self {
        Self {
            is_dir: true,
            ..Default::default()
        }
    }

    pub fn json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(&self.value)?)
    }

    /// Numeric value, stored either as a JSON number or a numeric string
    pub fn as_u64(&self) -> Option<u64> {
        match self.json().ok()? {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// String value, unwrapping a JSON string if the value is one
    pub fn as_str(&self) -> String {
        match self.json() {
            Ok(serde_json::Value::String(s)) => s,
            _ => self.value.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AgencyCommResult {
    pub connected: bool,
    pub status_code: u16,
    pub location: Option<String>,
    pub body: String,
    pub message: String,
    /// Flattened values, filled by [`parse`](Self::parse)
    pub values: BTreeMap<String, AgencyEntry>,
    /// Store index (from `X-Etcd-Index`, or a watch hit, or a uniqid)
    pub index: u64,
}

impl AgencyCommResult {
    /// Result for a call that never got an answer
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn from_response(response: TransportResponse) -> Self {
        let index = response.etcd_index().unwrap_or(0);
        Self {
            connected: response.connected,
            status_code: response.status_code,
            location: response.location,
            body: response.body,
            message: response.message,
            values: BTreeMap::new(),
            index,
        }
    }

    pub fn successful(&self) -> bool {
        (200..=299).contains(&self.status_code)
    }

    pub fn is_client_error(&self) -> bool {
        (400..=499).contains(&self.status_code)
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code == 404
    }

    /// etcd `errorCode` of the body, if any
    pub fn error_code(&self) -> Option<u32> {
        ResponseBody::parse(&self.body).ok()?.error_code
    }

    pub fn error_message(&self) -> String {
        ResponseBody::parse(&self.body)
            .ok()
            .and_then(|b| b.message)
            .unwrap_or_else(|| self.message.clone())
    }

    pub fn error_details(&self) -> String {
        let code = self.error_code().map(|c| c.to_string()).unwrap_or_else(|| "-".into());
        format!(
            "HTTP {} ({}): {} - {}",
            self.status_code,
            if self.connected { "connected" } else { "not connected" },
            code,
            self.error_message()
        )
    }

    /// The `node` tree of the body
    pub fn node(&self) -> Result<Option<KeyedNode>> {
        Ok(ResponseBody::parse(&self.body)?.node.map(KeyedNode::from))
    }

    /// Flatten the body's node tree into [`values`](Self::values).
    ///
    /// `strip_prefix` is the full decoded key prefix removed from every key.
    /// Returns false if the body holds no node.
    pub fn parse(&mut self, strip_prefix: &str, with_dirs: bool) -> Result<bool> {
        match self.node()? {
            Some(root) => {
                self.values = flatten(&root.key, &root.node, strip_prefix, with_dirs);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
