//! Lock file model.
//!
//! A lock file pins every node of the input graph to an immutable fetched
//! revision. In memory the graph is an arena: nodes live in a vector owned
//! by the [`LockFile`] and edges refer to siblings by index, except for
//! `follows` edges, which are input paths resolved against the graph root.
//! The root node (index 0) represents the caller's own flake and carries no
//! references.
//!
//! # Lock File Format
//!
//! ```json
//! {
//!   "nodes": {
//!     "nixpkgs": {
//!       "locked": { "type": "github", "owner": "NixOS", "repo": "nixpkgs", "rev": "..." },
//!       "original": { "type": "github", "owner": "NixOS", "repo": "nixpkgs" }
//!     },
//!     "root": {
//!       "inputs": {
//!         "foo": ["nixpkgs"],
//!         "nixpkgs": "nixpkgs"
//!       }
//!     }
//!   },
//!   "root": "root",
//!   "version": 7
//! }
//! ```
//!
//! String values under `inputs` name another node; array values are
//! `follows` paths. Serialization is canonical: node keys are derived
//! deterministically from the graph and object keys are emitted in sorted
//! order, so equal lock files serialize byte-for-byte identically.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::{self, Write as _};
use std::path::Path;

use serde_json::json;
use thiserror::Error;
use tracing::debug;

use floc_core::attrs::Attrs;
use floc_core::reference::FlakeRef;

use super::types::{FlakeId, InputPath};

/// Version written to new lock files.
pub const LOCK_VERSION: u64 = 7;

/// Oldest lock file version still readable.
pub const MIN_LOCK_VERSION: u64 = 5;

/// Label of the root node.
pub const ROOT_NODE_LABEL: &str = "root";

/// Maximum `follows` indirections while resolving one path.
const MAX_FOLLOWS_DEPTH: usize = 32;

/// Index of a node in the lock file's arena.
pub type NodeId = usize;

/// A child edge of a lock node.
#[derive(Debug, Clone, PartialEq)]
pub enum Edge {
  /// An ordinary edge to another node in the arena.
  Node(NodeId),
  /// An alias edge: this input names the node at the given path.
  Follows(InputPath),
}

/// A node in the lock graph.
///
/// Non-root nodes always carry `locked` (the pinned reference) and
/// `original` (the reference as the user declared it, preserved so
/// overrides survive re-locking). The root carries neither.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
  pub locked: Option<FlakeRef>,
  pub original: Option<FlakeRef>,
  pub flake: bool,
  pub inputs: BTreeMap<FlakeId, Edge>,
}

impl Node {
  fn root() -> Self {
    Node {
      locked: None,
      original: None,
      flake: true,
      inputs: BTreeMap::new(),
    }
  }
}

/// Errors that can occur when working with lock files.
#[derive(Debug, Error)]
pub enum LockError {
  /// Failed to read the lock file.
  #[error("failed to read lock file '{path}': {source}")]
  Read {
    path: String,
    #[source]
    source: io::Error,
  },

  /// Failed to write the lock file.
  #[error("failed to write lock file '{path}': {source}")]
  Write {
    path: String,
    #[source]
    source: io::Error,
  },

  /// The lock file is not valid JSON.
  #[error("failed to parse lock file: {0}")]
  Parse(#[source] serde_json::Error),

  /// The lock file version is outside the supported range.
  #[error("unsupported lock file version {0}")]
  UnsupportedVersion(u64),

  /// The lock file is structurally invalid.
  #[error("malformed lock file: {0}")]
  Malformed(String),

  /// A `follows` edge does not resolve to a node.
  #[error("input '{input}' follows a non-existent input '{target}'")]
  DanglingFollows { input: InputPath, target: InputPath },
}

/// The lock graph plus its format version.
#[derive(Debug, Clone)]
pub struct LockFile {
  version: u64,
  nodes: Vec<Node>,
}

impl Default for LockFile {
  fn default() -> Self {
    Self::new()
  }
}

impl LockFile {
  /// An empty lock file: a root node with no children.
  pub fn new() -> Self {
    LockFile {
      version: LOCK_VERSION,
      nodes: vec![Node::root()],
    }
  }

  pub fn root(&self) -> NodeId {
    0
  }

  pub fn node(&self, id: NodeId) -> &Node {
    &self.nodes[id]
  }

  pub fn node_count(&self) -> usize {
    self.nodes.len()
  }

  /// Append a locked node to the arena; the caller attaches it with
  /// [`LockFile::add_edge`].
  pub fn add_node(&mut self, locked: FlakeRef, original: FlakeRef, flake: bool) -> NodeId {
    self.nodes.push(Node {
      locked: Some(locked),
      original: Some(original),
      flake,
      inputs: BTreeMap::new(),
    });
    self.nodes.len() - 1
  }

  pub fn add_edge(&mut self, parent: NodeId, id: &str, edge: Edge) {
    self.nodes[parent].inputs.insert(id.to_string(), edge);
  }

  pub fn child(&self, parent: NodeId, id: &str) -> Option<&Edge> {
    self.nodes[parent].inputs.get(id)
  }

  /// Resolve an input path to a node, following alias edges. Returns
  /// `None` when the path does not resolve or alias chains run too deep.
  pub fn follow_path(&self, path: &InputPath) -> Option<NodeId> {
    self.follow_path_limited(path, MAX_FOLLOWS_DEPTH)
  }

  fn follow_path_limited(&self, path: &InputPath, depth: usize) -> Option<NodeId> {
    if depth == 0 {
      return None;
    }
    let mut current = self.root();
    for (i, segment) in path.segments().iter().enumerate() {
      match self.nodes[current].inputs.get(segment)? {
        Edge::Node(id) => current = *id,
        Edge::Follows(target) => {
          // Re-root at the alias target, then continue with the rest of
          // the path.
          let mut full = target.clone();
          for rest in &path.segments()[i + 1..] {
            full = full.child(rest);
          }
          return self.follow_path_limited(&full, depth - 1);
        }
      }
    }
    Some(current)
  }

  /// Verify that every `follows` edge resolves to an existing node.
  pub fn check(&self) -> Result<(), LockError> {
    let mut paths: Vec<(InputPath, &Node)> = vec![(InputPath::root(), &self.nodes[self.root()])];
    let mut seen = BTreeSet::new();
    seen.insert(self.root());

    let mut i = 0;
    while i < paths.len() {
      let (prefix, node) = (paths[i].0.clone(), paths[i].1);
      for (id, edge) in &node.inputs {
        match edge {
          Edge::Node(child) => {
            if seen.insert(*child) {
              paths.push((prefix.child(id), &self.nodes[*child]));
            }
          }
          Edge::Follows(target) => {
            if self.follow_path(target).is_none() {
              return Err(LockError::DanglingFollows {
                input: prefix.child(id),
                target: target.clone(),
              });
            }
          }
        }
      }
      i += 1;
    }
    Ok(())
  }

  /// Whether every locked node pins a unique revision.
  pub fn is_immutable(&self) -> bool {
    self
      .nodes
      .iter()
      .all(|node| node.locked.as_ref().is_none_or(FlakeRef::is_immutable))
  }

  /// Read a lock file, returning an empty one if the path does not exist.
  pub fn read(path: &Path) -> Result<Self, LockError> {
    let content = match fs::read_to_string(path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
        debug!(path = %path.display(), "no lock file, starting from an empty one");
        return Ok(LockFile::new());
      }
      Err(e) => {
        return Err(LockError::Read {
          path: path.display().to_string(),
          source: e,
        });
      }
    };
    content.parse()
  }

  /// Write the lock file atomically (temp file plus rename).
  pub fn write(&self, path: &Path) -> Result<(), LockError> {
    let write_err = |source: io::Error| LockError::Write {
      path: path.display().to_string(),
      source,
    };

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    temp.write_all(self.to_string().as_bytes()).map_err(write_err)?;
    temp.write_all(b"\n").map_err(write_err)?;
    temp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
  }

  /// Assign a stable serialization key to every reachable node.
  ///
  /// The root is `"root"`; other nodes take the id of the first edge
  /// reaching them, disambiguated with a numeric suffix. Traversal order
  /// is deterministic, so equal graphs get equal keys.
  fn assign_keys(&self) -> BTreeMap<NodeId, String> {
    let mut keys: BTreeMap<NodeId, String> = BTreeMap::new();
    let mut taken: BTreeSet<String> = BTreeSet::new();
    keys.insert(self.root(), ROOT_NODE_LABEL.to_string());
    taken.insert(ROOT_NODE_LABEL.to_string());

    let mut queue = vec![self.root()];
    let mut i = 0;
    while i < queue.len() {
      let current = queue[i];
      for (id, edge) in &self.nodes[current].inputs {
        if let Edge::Node(child) = edge
          && !keys.contains_key(child)
        {
          let mut key = id.clone();
          let mut n = 1;
          while taken.contains(&key) {
            n += 1;
            key = format!("{}_{}", id, n);
          }
          taken.insert(key.clone());
          keys.insert(*child, key);
          queue.push(*child);
        }
      }
      i += 1;
    }
    keys
  }

  fn to_json(&self) -> serde_json::Value {
    let keys = self.assign_keys();
    let mut nodes = serde_json::Map::new();

    for (id, key) in &keys {
      let node = &self.nodes[*id];
      let mut obj = serde_json::Map::new();

      if !node.inputs.is_empty() {
        let mut inputs = serde_json::Map::new();
        for (input_id, edge) in &node.inputs {
          let value = match edge {
            Edge::Node(child) => json!(keys[child]),
            Edge::Follows(path) => json!(path.segments()),
          };
          inputs.insert(input_id.clone(), value);
        }
        obj.insert("inputs".to_string(), serde_json::Value::Object(inputs));
      }
      if let Some(locked) = &node.locked {
        obj.insert("locked".to_string(), attrs_to_json(&locked.to_attrs()));
      }
      if let Some(original) = &node.original {
        obj.insert("original".to_string(), attrs_to_json(&original.to_attrs()));
      }
      if !node.flake {
        obj.insert("flake".to_string(), json!(false));
      }

      nodes.insert(key.clone(), serde_json::Value::Object(obj));
    }

    json!({
      "nodes": nodes,
      "root": ROOT_NODE_LABEL,
      "version": self.version,
    })
  }

  /// Human-readable change summary between two lock files, keyed by input
  /// path.
  pub fn diff(old: &LockFile, new: &LockFile) -> String {
    let old_flat = old.flatten();
    let new_flat = new.flatten();
    let mut out = String::new();

    let all_paths: BTreeSet<&InputPath> = old_flat.keys().chain(new_flat.keys()).collect();
    for path in all_paths {
      match (old_flat.get(path), new_flat.get(path)) {
        (None, Some(entry)) => out.push_str(&format!("• Added input '{}': {}\n", path, entry)),
        (Some(_), None) => out.push_str(&format!("• Removed input '{}'\n", path)),
        (Some(before), Some(after)) if before != after => {
          out.push_str(&format!("• Updated input '{}': {} -> {}\n", path, before, after));
        }
        _ => {}
      }
    }
    out
  }

  /// Flatten the graph into path-keyed entries, without following alias
  /// edges.
  fn flatten(&self) -> BTreeMap<InputPath, String> {
    let mut out = BTreeMap::new();
    let mut stack = vec![(InputPath::root(), self.root())];
    let mut seen = BTreeSet::new();
    seen.insert(self.root());

    while let Some((prefix, id)) = stack.pop() {
      for (input_id, edge) in &self.nodes[id].inputs {
        let path = prefix.child(input_id);
        match edge {
          Edge::Node(child) => {
            let node = &self.nodes[*child];
            let rendered = match &node.locked {
              Some(locked) => format!("'{}'", locked),
              None => "?".to_string(),
            };
            out.insert(path.clone(), rendered);
            if seen.insert(*child) {
              stack.push((path, *child));
            }
          }
          Edge::Follows(target) => {
            out.insert(path, format!("follows '{}'", target));
          }
        }
      }
    }
    out
  }
}

fn attrs_to_json(attrs: &Attrs) -> serde_json::Value {
  serde_json::to_value(attrs).unwrap_or_else(|_| json!({}))
}

impl fmt::Display for LockFile {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let text = serde_json::to_string_pretty(&self.to_json()).map_err(|_| fmt::Error)?;
    write!(f, "{}", text)
  }
}

impl PartialEq for LockFile {
  fn eq(&self, other: &Self) -> bool {
    self.to_json() == other.to_json()
  }
}

impl Eq for LockFile {}

impl std::str::FromStr for LockFile {
  type Err = LockError;

  fn from_str(s: &str) -> Result<Self, LockError> {
    let value: serde_json::Value = serde_json::from_str(s).map_err(LockError::Parse)?;
    let malformed = |reason: &str| LockError::Malformed(reason.to_string());

    let obj = value.as_object().ok_or_else(|| malformed("top level is not an object"))?;
    let version = obj
      .get("version")
      .and_then(serde_json::Value::as_u64)
      .ok_or_else(|| malformed("missing 'version'"))?;
    if !(MIN_LOCK_VERSION..=LOCK_VERSION).contains(&version) {
      return Err(LockError::UnsupportedVersion(version));
    }
    let root_label = obj
      .get("root")
      .and_then(serde_json::Value::as_str)
      .ok_or_else(|| malformed("missing 'root'"))?;
    let raw_nodes = obj
      .get("nodes")
      .and_then(serde_json::Value::as_object)
      .ok_or_else(|| malformed("missing 'nodes'"))?;

    let mut lock = LockFile {
      version: LOCK_VERSION,
      nodes: Vec::new(),
    };
    let mut ids: BTreeMap<String, NodeId> = BTreeMap::new();
    let mut in_progress: BTreeSet<String> = BTreeSet::new();
    build_node(root_label, raw_nodes, &mut lock, &mut ids, &mut in_progress, true)?;
    Ok(lock)
  }
}

fn build_node(
  label: &str,
  raw_nodes: &serde_json::Map<String, serde_json::Value>,
  lock: &mut LockFile,
  ids: &mut BTreeMap<String, NodeId>,
  in_progress: &mut BTreeSet<String>,
  is_root: bool,
) -> Result<NodeId, LockError> {
  if let Some(id) = ids.get(label) {
    return Ok(*id);
  }
  if !in_progress.insert(label.to_string()) {
    return Err(LockError::Malformed(format!("cycle through node '{}'", label)));
  }

  let raw = raw_nodes
    .get(label)
    .and_then(serde_json::Value::as_object)
    .ok_or_else(|| LockError::Malformed(format!("node '{}' is missing", label)))?;

  let parse_ref = |field: &str| -> Result<Option<FlakeRef>, LockError> {
    match raw.get(field) {
      None => Ok(None),
      Some(value) => {
        let attrs: Attrs = serde_json::from_value(value.clone())
          .map_err(|_| LockError::Malformed(format!("node '{}' has an invalid '{}' object", label, field)))?;
        FlakeRef::parse_attrs(&attrs)
          .map(Some)
          .map_err(|e| LockError::Malformed(format!("node '{}': {}", label, e)))
      }
    }
  };

  let locked = parse_ref("locked")?;
  let original = parse_ref("original")?;
  if !is_root && locked.is_none() {
    return Err(LockError::Malformed(format!("node '{}' lacks a 'locked' reference", label)));
  }
  let flake = raw.get("flake").and_then(serde_json::Value::as_bool).unwrap_or(true);

  // Reserve the slot before walking children so sibling edges can refer
  // to this node.
  let id = if is_root {
    lock.root()
  } else {
    lock.nodes.push(Node::root());
    lock.nodes.len() - 1
  };
  ids.insert(label.to_string(), id);

  let mut inputs = BTreeMap::new();
  if let Some(raw_inputs) = raw.get("inputs") {
    let raw_inputs = raw_inputs
      .as_object()
      .ok_or_else(|| LockError::Malformed(format!("node '{}' has a non-object 'inputs'", label)))?;
    for (input_id, value) in raw_inputs {
      let edge = match value {
        serde_json::Value::String(target) => {
          Edge::Node(build_node(target, raw_nodes, lock, ids, in_progress, false)?)
        }
        serde_json::Value::Array(segments) => {
          let segments: Option<Vec<String>> = segments.iter().map(|v| v.as_str().map(str::to_string)).collect();
          let segments =
            segments.ok_or_else(|| LockError::Malformed(format!("node '{}' has a non-string follows path", label)))?;
          Edge::Follows(InputPath::from(segments))
        }
        _ => {
          return Err(LockError::Malformed(format!(
            "node '{}' input '{}' is neither a node key nor a follows path",
            label, input_id
          )));
        }
      };
      inputs.insert(input_id.clone(), edge);
    }
  }

  lock.nodes[id] = Node {
    locked,
    original,
    flake,
    inputs,
  };
  in_progress.remove(label);
  Ok(id)
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  const REV: &str = "a1b2c3d4e5f6a7b8c9d0e1f2a3b4c5d6e7f8a9b0";

  fn locked_ref(name: &str) -> FlakeRef {
    FlakeRef::parse(&format!("github:example/{}/{}", name, REV), None, false).unwrap()
  }

  fn original_ref(name: &str) -> FlakeRef {
    FlakeRef::parse(&format!("github:example/{}", name), None, false).unwrap()
  }

  fn sample() -> LockFile {
    let mut lock = LockFile::new();
    let nixpkgs = lock.add_node(locked_ref("nixpkgs"), original_ref("nixpkgs"), true);
    lock.add_edge(lock.root(), "nixpkgs", Edge::Node(nixpkgs));
    lock.add_edge(
      lock.root(),
      "foo",
      Edge::Follows(InputPath::parse("nixpkgs").unwrap()),
    );
    lock
  }

  mod construction {
    use super::*;

    #[test]
    fn empty_lock_has_only_root() {
      let lock = LockFile::new();
      assert_eq!(lock.node_count(), 1);
      assert!(lock.node(lock.root()).inputs.is_empty());
      assert!(lock.node(lock.root()).locked.is_none());
    }

    #[test]
    fn follow_path_resolves_nodes_and_aliases() {
      let lock = sample();
      let direct = lock.follow_path(&InputPath::parse("nixpkgs").unwrap());
      let aliased = lock.follow_path(&InputPath::parse("foo").unwrap());
      assert!(direct.is_some());
      assert_eq!(direct, aliased);
      assert!(lock.follow_path(&InputPath::parse("missing").unwrap()).is_none());
    }

    #[test]
    fn check_passes_for_resolvable_follows() {
      sample().check().unwrap();
    }

    #[test]
    fn check_reports_dangling_follows() {
      let mut lock = LockFile::new();
      lock.add_edge(
        lock.root(),
        "foo",
        Edge::Follows(InputPath::parse("missing").unwrap()),
      );
      let result = lock.check();
      assert!(matches!(result, Err(LockError::DanglingFollows { .. })));
    }

    #[test]
    fn immutability_requires_pinned_refs() {
      let mut lock = sample();
      assert!(lock.is_immutable());

      let mutable = lock.add_node(original_ref("extra"), original_ref("extra"), true);
      lock.add_edge(lock.root(), "extra", Edge::Node(mutable));
      assert!(!lock.is_immutable());
    }
  }

  mod serialization {
    use super::*;

    #[test]
    fn canonical_shape() {
      let text = sample().to_string();
      assert!(text.contains("\"version\": 7"));
      assert!(text.contains("\"root\": \"root\""));
      assert!(text.contains("\"nixpkgs\": \"nixpkgs\""));
      assert!(text.contains(&format!("\"rev\": \"{}\"", REV)));
      // Follows edges serialize as path arrays.
      assert!(text.contains("\"foo\": ["));
    }

    #[test]
    fn roundtrip_is_canonical() {
      let lock = sample();
      let text = lock.to_string();
      let parsed: LockFile = text.parse().unwrap();
      assert_eq!(parsed, lock);
      assert_eq!(parsed.to_string(), text);
    }

    #[test]
    fn key_collisions_get_suffixes() {
      let mut lock = LockFile::new();
      let a = lock.add_node(locked_ref("a"), original_ref("a"), true);
      lock.add_edge(lock.root(), "dep", Edge::Node(a));
      let b = lock.add_node(locked_ref("b"), original_ref("b"), true);
      lock.add_edge(a, "dep", Edge::Node(b));

      let text = lock.to_string();
      assert!(text.contains("\"dep_2\""));
      let parsed: LockFile = text.parse().unwrap();
      assert_eq!(parsed, lock);
    }

    #[test]
    fn non_flake_marker_roundtrips() {
      let mut lock = LockFile::new();
      let a = lock.add_node(locked_ref("a"), original_ref("a"), false);
      lock.add_edge(lock.root(), "a", Edge::Node(a));

      let text = lock.to_string();
      assert!(text.contains("\"flake\": false"));
      let parsed: LockFile = text.parse().unwrap();
      assert!(!parsed.node(parsed.follow_path(&InputPath::parse("a").unwrap()).unwrap()).flake);
    }

    #[test]
    fn rejects_unsupported_version() {
      let result: Result<LockFile, _> = r#"{"version": 1, "root": "root", "nodes": {"root": {}}}"#.parse();
      assert!(matches!(result, Err(LockError::UnsupportedVersion(1))));
    }

    #[test]
    fn rejects_missing_locked_on_non_root() {
      let text = r#"{
        "version": 7,
        "root": "root",
        "nodes": {
          "root": { "inputs": { "a": "a" } },
          "a": { "original": { "type": "github", "owner": "x", "repo": "y" } }
        }
      }"#;
      let result: Result<LockFile, _> = text.parse();
      assert!(matches!(result, Err(LockError::Malformed(_))));
    }

    #[test]
    fn rejects_node_reference_cycles() {
      let text = format!(
        r#"{{
          "version": 7,
          "root": "root",
          "nodes": {{
            "root": {{ "inputs": {{ "a": "a" }} }},
            "a": {{
              "inputs": {{ "b": "a" }},
              "locked": {{ "type": "github", "owner": "x", "repo": "y", "rev": "{REV}" }},
              "original": {{ "type": "github", "owner": "x", "repo": "y" }}
            }}
          }}
        }}"#
      );
      let result: Result<LockFile, _> = text.parse();
      assert!(matches!(result, Err(LockError::Malformed(_))));
    }

    #[test]
    fn rejects_invalid_json() {
      let result: Result<LockFile, _> = "not json".parse();
      assert!(matches!(result, Err(LockError::Parse(_))));
    }
  }

  mod persistence {
    use super::*;

    #[test]
    fn read_missing_returns_empty() {
      let temp = TempDir::new().unwrap();
      let lock = LockFile::read(&temp.path().join("flake.lock")).unwrap();
      assert_eq!(lock, LockFile::new());
    }

    #[test]
    fn write_then_read_roundtrip() {
      let temp = TempDir::new().unwrap();
      let path = temp.path().join("flake.lock");
      let lock = sample();

      lock.write(&path).unwrap();
      let loaded = LockFile::read(&path).unwrap();
      assert_eq!(loaded, lock);
    }

    #[test]
    fn read_unparsable_fails() {
      let temp = TempDir::new().unwrap();
      let path = temp.path().join("flake.lock");
      fs::write(&path, "junk").unwrap();
      assert!(LockFile::read(&path).is_err());
    }
  }

  mod diff {
    use super::*;

    #[test]
    fn added_removed_updated() {
      let old = sample();

      let mut new = LockFile::new();
      let other_rev = "ffffffffffffffffffffffffffffffffffffffff";
      let updated = FlakeRef::parse(&format!("github:example/nixpkgs/{}", other_rev), None, false).unwrap();
      let nixpkgs = new.add_node(updated, original_ref("nixpkgs"), true);
      new.add_edge(new.root(), "nixpkgs", Edge::Node(nixpkgs));
      let utils = new.add_node(locked_ref("flake-utils"), original_ref("flake-utils"), true);
      new.add_edge(new.root(), "flake-utils", Edge::Node(utils));

      let diff = LockFile::diff(&old, &new);
      assert!(diff.contains("Added input 'flake-utils'"));
      assert!(diff.contains("Removed input 'foo'"));
      assert!(diff.contains("Updated input 'nixpkgs'"));
    }

    #[test]
    fn equal_locks_have_empty_diff() {
      assert!(LockFile::diff(&sample(), &sample()).is_empty());
    }
  }
}
