//! Agency response tree
//!
//! Responses carry a recursive `node` object. It is turned into a [`Node`]
//! tree first; [`flatten`] then maps that tree to relative keys. Neither
//! step performs I/O.

use serde::Deserialize;
use std::collections::BTreeMap;

use crate::agency::result::AgencyEntry;
use crate::common::{decode_key, encode_key, Result};

/// One point in the hierarchical key namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Leaf { value: String, modified_index: u64 },
    Dir { children: BTreeMap<String, Node> },
}

impl Node {
    pub fn leaf(value: impl Into<String>, modified_index: u64) -> Self {
        Node::Leaf {
            value: value.into(),
            modified_index,
        }
    }

    pub fn dir<I, K>(children: I) -> Self
    where
        I: IntoIterator<Item = (K, Node)>,
        K: Into<String>,
    {
        Node::Dir {
            children: children.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Node::Dir { .. })
    }
}

/// A parsed node together with its full (encoded) key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedNode {
    pub key: String,
    pub modified_index: u64,
    pub node: Node,
}

/// `node` object as sent by the Agency
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireNode {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub dir: bool,
    #[serde(default)]
    pub modified_index: u64,
    #[serde(default)]
    pub nodes: Vec<WireNode>,
}

/// Agency response body: either a `node` or an error
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBody {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub node: Option<WireNode>,
    #[serde(default)]
    pub error_code: Option<u32>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub cause: Option<String>,
    #[serde(default)]
    pub index: Option<u64>,
}

impl ResponseBody {
    pub fn parse(body: &str) -> Result<Self> {
        Ok(serde_json::from_str(body)?)
    }
}

fn last_segment(key: &str) -> &str {
    key.trim_end_matches('/').rsplit('/').next().unwrap_or_default()
}

impl From<WireNode> for KeyedNode {
    fn from(wire: WireNode) -> Self {
        let modified_index = wire.modified_index;
        let key = wire.key.clone();
        KeyedNode {
            key,
            modified_index,
            node: wire.into(),
        }
    }
}

impl From<WireNode> for Node {
    fn from(wire: WireNode) -> Self {
        if wire.dir || !wire.nodes.is_empty() {
            let children = wire
                .nodes
                .into_iter()
                .map(|child| (last_segment(&child.key).to_string(), Node::from(child)))
                .collect();
            Node::Dir { children }
        } else {
            Node::Leaf {
                value: wire.value.unwrap_or_default(),
                modified_index: wire.modified_index,
            }
        }
    }
}

/// Key of `path` relative to `strip_prefix`, decoded and without leading `/`
pub fn relative_key(path: &str, strip_prefix: &str) -> String {
    let rest = match path.strip_prefix(strip_prefix) {
        Some(rest) => rest,
        None => path.get(strip_prefix.len()..).unwrap_or_default(),
    };
    decode_key(rest.trim_start_matches('/'))
}

/// Flatten a tree rooted at `root_key` into relative key → entry.
///
/// `strip_prefix` is the decoded key prefix to remove. Directories only
/// show up (as empty markers) when `with_dirs` is set; the queried root
/// itself never does.
pub fn flatten(
    root_key: &str,
    node: &Node,
    strip_prefix: &str,
    with_dirs: bool,
) -> BTreeMap<String, AgencyEntry> {
    let strip = encode_key(strip_prefix);
    let mut out = BTreeMap::new();
    walk(root_key, node, &strip, with_dirs, &mut out);
    out
}

fn walk(
    path: &str,
    node: &Node,
    strip: &str,
    with_dirs: bool,
    out: &mut BTreeMap<String, AgencyEntry>,
) {
    let rel = relative_key(path, strip);
    match node {
        Node::Leaf {
            value,
            modified_index,
        } => {
            out.insert(rel, AgencyEntry::new(value.clone(), *modified_index));
        }
        Node::Dir { children } => {
            if with_dirs && !rel.is_empty() {
                out.insert(rel, AgencyEntry::directory());
            }
            let base = path.trim_end_matches('/');
            for (name, child) in children {
                walk(&format!("{}/{}", base, name), child, strip, with_dirs, out);
            }
        }
    }
}
