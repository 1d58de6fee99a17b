// Copyright 2018-2026 the sandbox-bundler authors. MIT license.

//! The serializer (§4.6): converts the live node arena into a plain,
//! JSON-friendly blob keyed by node id and back. Grounded on the teacher's
//! `serde`-derived cache-entry records in `cli/cache/cache_db.rs`, adapted
//! to the arena-plus-edge-set shape of [`crate::node::TranspiledModule`].
//!
//! Transient fields are dropped on the way out: `errors` (diagnostics are
//! re-derived on the next transpile), `async_dependencies` (re-resolved on
//! the next transpile) and any HMR accept callback (a live `JsValue` that
//! cannot survive a restart). Restoring skips edges whose target id is no
//! longer present in the blob rather than failing the whole restore, since a
//! partially stale cache is recoverable by re-transpiling, per the design
//! notes' "best effort" framing for `load()`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::module::{Diagnostic, Module, ModuleSource};
use crate::node::{Compilation, HmrState, NodeId, TranspiledModule};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SerializedNode {
  id: u32,
  module: Module,
  query: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  source: Option<ModuleSource>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  compilation: Option<Compilation>,
  is_entry: bool,
  #[serde(default)]
  non_cacheable: bool,
  #[serde(default)]
  warnings: Vec<Diagnostic>,
  #[serde(default)]
  assets: HashMap<String, ModuleSource>,
  #[serde(default)]
  emitted_assets: Vec<String>,
  #[serde(default)]
  child_modules: Vec<u32>,
  #[serde(default)]
  hmr_enabled: HmrState,
  #[serde(default)]
  changed: bool,
  #[serde(default)]
  dependencies: Vec<u32>,
  #[serde(default)]
  initiators: Vec<u32>,
  #[serde(default)]
  transpilation_dependencies: Vec<u32>,
  #[serde(default)]
  transpilation_initiators: Vec<u32>,
}

/// `{ byId: { ... } }`, the wire shape for a serialized graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedGraph {
  #[serde(rename = "byId")]
  by_id: HashMap<u32, SerializedNode>,
}

pub fn serialize(nodes: &[Option<TranspiledModule>]) -> SerializedGraph {
  let mut by_id = HashMap::new();
  for node in nodes.iter().flatten() {
    by_id.insert(
      node.id.0,
      SerializedNode {
        id: node.id.0,
        module: node.module.clone(),
        query: node.query.clone(),
        source: node.source.clone(),
        compilation: node.compilation.clone(),
        is_entry: node.is_entry,
        non_cacheable: node.non_cacheable,
        warnings: node.warnings.clone(),
        assets: node.assets.clone(),
        emitted_assets: node.emitted_assets.clone(),
        child_modules: node.child_modules.iter().map(|id| id.0).collect(),
        hmr_enabled: node.hmr_enabled.clone(),
        changed: node.changed,
        dependencies: node.dependencies.iter().map(|id| id.0).collect(),
        initiators: node.initiators.iter().map(|id| id.0).collect(),
        transpilation_dependencies: node
          .transpilation_dependencies
          .iter()
          .map(|id| id.0)
          .collect(),
        transpilation_initiators: node
          .transpilation_initiators
          .iter()
          .map(|id| id.0)
          .collect(),
      },
    );
  }
  SerializedGraph { by_id }
}

/// Restores `nodes`/`index` in place from `serialized`. Node ids are
/// preserved exactly (not renumbered), so a restored graph's ids keep
/// meaning across reloads; the caller is responsible for seeding its
/// `next_id` counter above the highest restored id afterwards.
pub fn deserialize(
  serialized: SerializedGraph,
  nodes: &mut Vec<Option<TranspiledModule>>,
  index: &mut HashMap<(String, String), NodeId>,
) -> Result<(), GraphError> {
  let max_id = serialized.by_id.keys().copied().max().unwrap_or(0);
  nodes.clear();
  nodes.resize_with(max_id as usize + 1, || None);
  index.clear();

  let known_ids: std::collections::HashSet<u32> = serialized.by_id.keys().copied().collect();
  let keep = |id: &u32| known_ids.contains(id);

  for (id, entry) in serialized.by_id {
    if entry.id != id {
      return Err(GraphError::Corrupt(format!(
        "node key {id} does not match its own id field {}",
        entry.id
      )));
    }
    let node_id = NodeId(id);
    let mut node = TranspiledModule::new(node_id, entry.module, entry.query);
    node.source = entry.source;
    node.compilation = entry.compilation;
    node.is_entry = entry.is_entry;
    node.non_cacheable = entry.non_cacheable;
    node.warnings = entry.warnings;
    node.assets = entry.assets;
    node.emitted_assets = entry.emitted_assets;
    node.child_modules = entry.child_modules.into_iter().filter(|i| keep(i)).map(NodeId).collect();
    node.hmr_enabled = entry.hmr_enabled;
    node.changed = entry.changed;
    node.dependencies = entry
      .dependencies
      .into_iter()
      .filter(|i| keep(i))
      .map(NodeId)
      .collect();
    node.initiators = entry
      .initiators
      .into_iter()
      .filter(|i| keep(i))
      .map(NodeId)
      .collect();
    node.transpilation_dependencies = entry
      .transpilation_dependencies
      .into_iter()
      .filter(|i| keep(i))
      .map(NodeId)
      .collect();
    node.transpilation_initiators = entry
      .transpilation_initiators
      .into_iter()
      .filter(|i| keep(i))
      .map(NodeId)
      .collect();

    index.insert(node.key(), node_id);
    nodes[id as usize] = Some(node);
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn round_trips_a_small_graph() {
    let mut a = TranspiledModule::new(NodeId(0), Module::new("/a.js", "require('./b')"), "".into());
    let b = TranspiledModule::new(NodeId(1), Module::new("/b.js", "1"), "".into());
    a.dependencies.insert(NodeId(1));
    let mut b = b;
    b.initiators.insert(NodeId(0));

    let nodes = vec![Some(a), Some(b)];
    let blob = serialize(&nodes);

    let mut restored_nodes = Vec::new();
    let mut restored_index = HashMap::new();
    deserialize(blob, &mut restored_nodes, &mut restored_index).unwrap();

    assert_eq!(restored_nodes.len(), 2);
    let restored_a = restored_nodes[0].as_ref().unwrap();
    assert!(restored_a.dependencies.contains(&NodeId(1)));
    assert_eq!(restored_index.get(&("/a.js".to_string(), String::new())), Some(&NodeId(0)));
  }

  #[test]
  fn drops_edges_to_nodes_missing_from_the_blob() {
    let mut a = TranspiledModule::new(NodeId(0), Module::new("/a.js", "1"), "".into());
    a.dependencies.insert(NodeId(99));
    let nodes = vec![Some(a)];
    let blob = serialize(&nodes);

    let mut restored_nodes = Vec::new();
    let mut restored_index = HashMap::new();
    deserialize(blob, &mut restored_nodes, &mut restored_index).unwrap();

    assert!(restored_nodes[0].as_ref().unwrap().dependencies.is_empty());
  }
}
