//! In-process Agency
//!
//! A single key space speaking the etcd v2 subset the client uses:
//! GET/PUT/DELETE on `/v2/keys/...` with `recursive`, `dir`, `ttl`,
//! `prevExist`, `prevValue`, `wait` and `waitIndex`, plus `/version`.
//! It implements [`Transport`], so every endpoint spec of a client talks to
//! the same store; single endpoints can be marked unreachable.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::agency::client::AGENCY_URL_PREFIX;
use crate::agency::result::{
    ERROR_COMPARE_FAILED, ERROR_EVENT_INDEX_CLEARED, ERROR_INVALID_FIELD, ERROR_KEY_NOT_FOUND,
    ERROR_NODE_EXIST, ERROR_NOT_DIR, ERROR_NOT_FILE, ERROR_ROOT_READ_ONLY,
};
use crate::agency::transport::{AgencyRequest, Transport, TransportResponse, ETCD_INDEX_HEADER};
use crate::common::utils::{parse_form, unescape_path};
use crate::common::{Error, Result};

const HISTORY_LIMIT: usize = 1000;
const REQUEST_LOG_LIMIT: usize = 1000;
/// Longest a watch sleeps before looking for expired keys again
const WATCH_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
struct StoredNode {
    /// `None` for directories
    value: Option<String>,
    created_index: u64,
    modified_index: u64,
    expires_at: Option<Instant>,
}

impl StoredNode {
    fn directory(index: u64) -> Self {
        Self {
            value: None,
            created_index: index,
            modified_index: index,
            expires_at: None,
        }
    }

    fn is_dir(&self) -> bool {
        self.value.is_none()
    }
}

/// One change applied to the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgencyEvent {
    pub index: u64,
    pub action: String,
    pub key: String,
    pub value: Option<String>,
    pub dir: bool,
}

fn child_prefix(key: &str) -> String {
    if key == "/" {
        "/".to_string()
    } else {
        format!("{}/", key)
    }
}

fn ancestors(key: &str) -> Vec<String> {
    key.match_indices('/')
        .skip(1)
        .map(|(pos, _)| key[..pos].to_string())
        .collect()
}

#[derive(Debug)]
struct StoreState {
    nodes: BTreeMap<String, StoredNode>,
    index: u64,
    history: VecDeque<AgencyEvent>,
    /// Events at or below this index were dropped from `history`
    cleared_through: u64,
}

impl StoreState {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), StoredNode::directory(0));
        Self {
            nodes,
            index: 0,
            history: VecDeque::new(),
            cleared_through: 0,
        }
    }

    fn next_index(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    fn record(&mut self, index: u64, action: &str, key: &str, value: Option<String>, dir: bool) {
        self.history.push_back(AgencyEvent {
            index,
            action: action.to_string(),
            key: key.to_string(),
            value,
            dir,
        });
        while self.history.len() > HISTORY_LIMIT {
            if let Some(dropped) = self.history.pop_front() {
                self.cleared_through = dropped.index;
            }
        }
    }

    fn remove_tree(&mut self, key: &str) {
        let prefix = child_prefix(key);
        self.nodes.retain(|k, _| k != key && !k.starts_with(&prefix));
    }

    /// Drop expired keys. Returns true if anything expired.
    fn purge_expired(&mut self, now: Instant) -> bool {
        let expired: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.expires_at.is_some_and(|at| at <= now))
            .map(|(key, _)| key.clone())
            .collect();

        let mut any = false;
        for key in expired {
            let Some(node) = self.nodes.get(&key) else {
                continue;
            };
            let dir = node.is_dir();
            self.remove_tree(&key);
            let index = self.next_index();
            self.record(index, "expire", &key, None, dir);
            any = true;
        }
        any
    }

    fn children<'a>(&'a self, key: &str) -> impl Iterator<Item = (&'a String, &'a StoredNode)> + 'a {
        let prefix = child_prefix(key);
        let own = key.to_string();
        self.nodes.iter().filter(move |(k, _)| {
            **k != own && k.starts_with(&prefix) && !k[prefix.len()..].contains('/')
        })
    }

    fn node_json(&self, key: &str, node: &StoredNode, recursive: bool, expand: bool) -> Value {
        let mut obj = json!({
            "key": key,
            "modifiedIndex": node.modified_index,
            "createdIndex": node.created_index,
        });
        if let Some(at) = node.expires_at {
            obj["ttl"] = json!(at.saturating_duration_since(Instant::now()).as_secs());
        }
        match &node.value {
            Some(value) => obj["value"] = json!(value),
            None => {
                obj["dir"] = json!(true);
                if expand {
                    let nodes: Vec<Value> = self
                        .children(key)
                        .map(|(k, child)| self.node_json(k, child, recursive, recursive))
                        .collect();
                    obj["nodes"] = json!(nodes);
                }
            }
        }
        obj
    }
}

fn respond(status: u16, body: Value, index: u64) -> TransportResponse {
    TransportResponse::new(status, body.to_string()).with_header(ETCD_INDEX_HEADER, index.to_string())
}

fn error(status: u16, code: u32, message: &str, cause: &str, index: u64) -> TransportResponse {
    respond(
        status,
        json!({ "errorCode": code, "message": message, "cause": cause, "index": index }),
        index,
    )
}

fn flag(params: &HashMap<String, String>, name: &str) -> bool {
    params.get(name).is_some_and(|v| v == "true")
}

fn event_matches(event: &AgencyEvent, key: &str, recursive: bool) -> bool {
    event.key == key
        || (recursive && event.key.starts_with(&child_prefix(key)))
        || (matches!(event.action.as_str(), "delete" | "expire") && key.starts_with(&child_prefix(&event.key)))
}

/// In-process Agency store
#[derive(Debug)]
pub struct InMemoryAgency {
    state: Mutex<StoreState>,
    changed: Notify,
    unreachable: Mutex<HashSet<String>>,
    requests: Mutex<VecDeque<String>>,
}

impl Default for InMemoryAgency {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAgency {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::new()),
            changed: Notify::new(),
            unreachable: Mutex::new(HashSet::new()),
            requests: Mutex::new(VecDeque::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make an endpoint refuse (false) or accept (true) connections
    pub fn set_reachable(&self, endpoint: &str, reachable: bool) {
        let mut unreachable = self.unreachable.lock().unwrap_or_else(|p| p.into_inner());
        if reachable {
            unreachable.remove(endpoint);
        } else {
            unreachable.insert(endpoint.to_string());
        }
    }

    pub fn is_reachable(&self, endpoint: &str) -> bool {
        !self
            .unreachable
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(endpoint)
    }

    /// Endpoints of the most recent requests, in arrival order
    pub fn request_log(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Retained change events, oldest first
    pub fn history(&self) -> Vec<AgencyEvent> {
        self.state().history.iter().cloned().collect()
    }

    /// Index of the latest change
    pub fn current_index(&self) -> u64 {
        self.state().index
    }

    /// Raw stored value of a full (encoded) key, `None` for missing keys
    /// and directories
    pub fn raw_value(&self, key: &str) -> Option<String> {
        let mut state = self.state();
        state.purge_expired(Instant::now());
        state.nodes.get(key).and_then(|node| node.value.clone())
    }

    /// Serve one request
    pub async fn handle(&self, request: &AgencyRequest) -> TransportResponse {
        let (path, query) = request.url.split_once('?').unwrap_or((request.url.as_str(), ""));
        let path = unescape_path(path);
        let params: HashMap<String, String> = parse_form(query).into_iter().collect();

        if path == "/version" {
            return TransportResponse::new(
                200,
                json!({ "etcdserver": "2.3.8", "etcdcluster": "2.3.0" }).to_string(),
            );
        }

        let keys_prefix = format!("/{}", AGENCY_URL_PREFIX);
        let Some(rest) = path.strip_prefix(&keys_prefix) else {
            return TransportResponse::new(404, "404 page not found\n");
        };
        let trimmed = rest.trim_matches('/');
        let key = if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", trimmed)
        };

        match request.method {
            Method::GET if flag(&params, "wait") => self.watch(&key, &params, request.timeout).await,
            Method::GET => self.get(&key, &params),
            Method::PUT => self.put(&key, &params, &request.body),
            Method::DELETE => self.delete(&key, &params),
            _ => TransportResponse::new(405, "Method Not Allowed"),
        }
    }

    fn get(&self, key: &str, params: &HashMap<String, String>) -> TransportResponse {
        let mut state = self.state();
        if state.purge_expired(Instant::now()) {
            self.changed.notify_waiters();
        }

        match state.nodes.get(key) {
            Some(node) => {
                let body = json!({
                    "action": "get",
                    "node": state.node_json(key, node, flag(params, "recursive"), true),
                });
                respond(200, body, state.index)
            }
            None => error(404, ERROR_KEY_NOT_FOUND, "Key not found", key, state.index),
        }
    }

    fn put(&self, key: &str, params: &HashMap<String, String>, body: &str) -> TransportResponse {
        let now = Instant::now();
        let mut state = self.state();
        state.purge_expired(now);
        let index = state.index;

        if key == "/" {
            return error(403, ERROR_ROOT_READ_ONLY, "Root is read only", key, index);
        }

        let dir = flag(params, "dir");
        let ttl = match params.get("ttl").filter(|t| !t.is_empty()) {
            Some(t) => match t.parse::<u64>() {
                Ok(secs) => Some(secs),
                Err(_) => {
                    return error(400, ERROR_INVALID_FIELD, "The given TTL is not a number", "Update", index)
                }
            },
            None => None,
        };
        let prev_exist = params.get("prevExist").map(|v| v == "true");
        let prev_value = params.get("prevValue");
        let value = parse_form(body)
            .into_iter()
            .find(|(k, _)| k == "value")
            .map(|(_, v)| v);
        let existing = state.nodes.get(key).cloned();

        for ancestor in ancestors(key) {
            if state.nodes.get(&ancestor).is_some_and(|n| !n.is_dir()) {
                return error(403, ERROR_NOT_DIR, "Not a directory", &ancestor, index);
            }
        }

        match (prev_exist, &existing) {
            (Some(true), None) => return error(404, ERROR_KEY_NOT_FOUND, "Key not found", key, index),
            (Some(false), Some(_)) => {
                return error(412, ERROR_NODE_EXIST, "Key already exists", key, index)
            }
            _ => {}
        }

        if let Some(expected) = prev_value {
            match &existing {
                None => return error(404, ERROR_KEY_NOT_FOUND, "Key not found", key, index),
                Some(node) if node.is_dir() => {
                    return error(403, ERROR_NOT_FILE, "Not a file", key, index)
                }
                Some(node) if node.value.as_deref() != Some(expected.as_str()) => {
                    let cause = format!("[{} != {}]", expected, node.value.as_deref().unwrap_or_default());
                    return error(412, ERROR_COMPARE_FAILED, "Compare failed", &cause, index);
                }
                Some(_) => {}
            }
        }

        let is_dir_conflict = match &existing {
            Some(node) if dir => !(node.is_dir() && prev_exist == Some(true)),
            Some(node) => node.is_dir(),
            None => false,
        };
        if is_dir_conflict {
            return error(403, ERROR_NOT_FILE, "Not a file", key, index);
        }

        let index = state.next_index();
        for ancestor in ancestors(key) {
            state
                .nodes
                .entry(ancestor)
                .or_insert_with(|| StoredNode::directory(index));
        }

        let node = StoredNode {
            value: if dir { None } else { Some(value.unwrap_or_default()) },
            created_index: existing.as_ref().map_or(index, |n| n.created_index),
            modified_index: index,
            expires_at: ttl.filter(|secs| *secs > 0).map(|secs| now + Duration::from_secs(secs)),
        };
        state.nodes.insert(key.to_string(), node.clone());

        let action = if prev_value.is_some() {
            "compareAndSwap"
        } else {
            match prev_exist {
                Some(false) => "create",
                Some(true) => "update",
                None => "set",
            }
        };
        state.record(index, action, key, node.value.clone(), dir);

        let mut body = json!({ "action": action, "node": state.node_json(key, &node, false, false) });
        if let Some(prev) = &existing {
            body["prevNode"] = state.node_json(key, prev, false, false);
        }
        drop(state);
        self.changed.notify_waiters();

        respond(if existing.is_some() { 200 } else { 201 }, body, index)
    }

    fn delete(&self, key: &str, params: &HashMap<String, String>) -> TransportResponse {
        let mut state = self.state();
        state.purge_expired(Instant::now());
        let index = state.index;

        if key == "/" {
            return error(403, ERROR_ROOT_READ_ONLY, "Root is read only", key, index);
        }
        let Some(existing) = state.nodes.get(key).cloned() else {
            return error(404, ERROR_KEY_NOT_FOUND, "Key not found", key, index);
        };

        if existing.is_dir() && !flag(params, "recursive") {
            if !flag(params, "dir") {
                return error(403, ERROR_NOT_FILE, "Not a file", key, index);
            }
            if state.children(key).next().is_some() {
                return error(403, 108, "Directory not empty", key, index);
            }
        }
        if let Some(expected) = params.get("prevValue") {
            if existing.value.as_deref() != Some(expected.as_str()) {
                return error(412, ERROR_COMPARE_FAILED, "Compare failed", key, index);
            }
        }

        let prev = state.node_json(key, &existing, true, existing.is_dir());
        state.remove_tree(key);
        let index = state.next_index();
        state.record(index, "delete", key, None, existing.is_dir());
        drop(state);
        self.changed.notify_waiters();

        let mut node = json!({ "key": key, "modifiedIndex": index, "createdIndex": existing.created_index });
        if existing.is_dir() {
            node["dir"] = json!(true);
        }
        respond(200, json!({ "action": "delete", "node": node, "prevNode": prev }), index)
    }

    async fn watch(&self, key: &str, params: &HashMap<String, String>, timeout: Duration) -> TransportResponse {
        let recursive = flag(params, "recursive");
        let deadline = Instant::now() + timeout;

        let since = {
            let state = self.state();
            match params.get("waitIndex").and_then(|v| v.parse::<u64>().ok()) {
                Some(wait_index) if wait_index <= state.cleared_through => {
                    return error(
                        400,
                        ERROR_EVENT_INDEX_CLEARED,
                        "The event in requested index is outdated and cleared",
                        key,
                        state.index,
                    );
                }
                Some(wait_index) => wait_index,
                None => state.index + 1,
            }
        };

        loop {
            let changed = self.changed.notified();
            {
                let mut state = self.state();
                if state.purge_expired(Instant::now()) {
                    self.changed.notify_waiters();
                }
                let hit = state
                    .history
                    .iter()
                    .find(|event| event.index >= since && event_matches(event, key, recursive))
                    .cloned();
                if let Some(event) = hit {
                    let mut node = json!({ "key": event.key, "modifiedIndex": event.index });
                    match &event.value {
                        Some(value) => node["value"] = json!(value),
                        None if event.dir => node["dir"] = json!(true),
                        None => {}
                    }
                    return respond(200, json!({ "action": event.action, "node": node }), state.index);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return TransportResponse::timed_out("watch timed out");
            }
            let _ = tokio::time::timeout((deadline - now).min(WATCH_POLL), changed).await;
        }
    }
}

#[async_trait]
impl Transport for InMemoryAgency {
    async fn connect(&self, endpoint: &str, _timeout: Duration) -> Result<()> {
        if self.is_reachable(endpoint) {
            Ok(())
        } else {
            Err(Error::ConnectionFailed(endpoint.to_string()))
        }
    }

    async fn disconnect(&self, _endpoint: &str) {}

    async fn send(&self, endpoint: &str, request: &AgencyRequest) -> Result<TransportResponse> {
        {
            let mut requests = self.requests.lock().unwrap_or_else(|p| p.into_inner());
            if requests.len() == REQUEST_LOG_LIMIT {
                requests.pop_front();
            }
            requests.push_back(endpoint.to_string());
        }
        if !self.is_reachable(endpoint) {
            return Ok(TransportResponse::unreachable(format!("{}: connection refused", endpoint)));
        }
        Ok(self.handle(request).await)
    }
}
