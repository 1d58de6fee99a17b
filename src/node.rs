// Copyright 2018-2026 the sandbox-bundler authors. MIT license.

//! The graph vertex: [`TranspiledModule`]. Grounded on the design notes'
//! "arena-keyed node table" and on the teacher's `ModuleEntry` variants in
//! `cli/graph_util.rs`, adapted from an enum-of-states to a single struct
//! with `Option` fields since the spec requires mutation in place (editing a
//! dependency's `source` must be visible to every initiator without a
//! re-insert).

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::module::{Diagnostic, Module, ModuleSource};

/// Arena index into `Graph::nodes`. Stable for the lifetime of a node; never
/// reused while the node is live, since `Graph::remove_node` only recycles
/// the slot once nothing else can observe the old identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// A cached evaluation result: the unit's export record plus its HMR hot
/// object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Compilation {
  pub exports: serde_json::Value,
  pub hot: HotApi,
}

/// The subset of `module.hot` state tracked per evaluation. The actual
/// `accept`/`dispose` callbacks live on `Graph::accept_callbacks`, not here;
/// this just records whether `accept()` was ever called during this
/// evaluation so `resetCompilation` under HMR knows the node opted in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HotApi {
  pub accepted: bool,
}

/// `hmrEnabled` as a tagged variant, per the design notes, rather than the
/// source's conflated `undefined | true | Function`. The callback itself is
/// a live `boa_engine::JsValue`, which cannot be serialized or stored here
/// alongside the rest of a node's plain-data state; `Graph` keeps it
/// separately in `accept_callbacks`, keyed by `NodeId`, and this variant
/// only records that an external accept handler is registered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HmrState {
  #[default]
  Off,
  SelfAccept,
  Accept,
}

/// The vertex of the dependency graph: one `(module.path, query)` pair and
/// its cached transpile/evaluation state.
#[derive(Debug, Clone)]
pub struct TranspiledModule {
  pub id: NodeId,
  pub module: Module,
  pub query: String,

  pub source: Option<ModuleSource>,
  pub compilation: Option<Compilation>,
  pub is_entry: bool,
  /// Set from the loader chain's own `cacheable` flags on its last run
  /// (§4.2); `postEvaluate` drops `compilation` for a node transpiled by a
  /// non-cacheable transformer instead of every evaluation being cached.
  pub non_cacheable: bool,

  pub errors: Vec<Diagnostic>,
  pub warnings: Vec<Diagnostic>,

  pub assets: std::collections::HashMap<String, ModuleSource>,
  pub emitted_assets: Vec<String>,
  pub child_modules: Vec<NodeId>,

  pub hmr_enabled: HmrState,
  pub changed: bool,

  pub dependencies: HashSet<NodeId>,
  pub initiators: HashSet<NodeId>,
  pub transpilation_dependencies: HashSet<NodeId>,
  pub transpilation_initiators: HashSet<NodeId>,
  pub async_dependencies: HashSet<String>,
}

impl TranspiledModule {
  pub fn new(id: NodeId, module: Module, query: String) -> Self {
    Self {
      id,
      module,
      query,
      source: None,
      compilation: None,
      is_entry: false,
      non_cacheable: false,
      errors: Vec::new(),
      warnings: Vec::new(),
      // Open question in spec.md §9: `assets` must be initialized to an
      // empty map at construction, since `emitFile` only ever inserts.
      assets: std::collections::HashMap::new(),
      emitted_assets: Vec::new(),
      child_modules: Vec::new(),
      hmr_enabled: HmrState::Off,
      changed: false,
      dependencies: HashSet::new(),
      initiators: HashSet::new(),
      transpilation_dependencies: HashSet::new(),
      transpilation_initiators: HashSet::new(),
      async_dependencies: HashSet::new(),
    }
  }

  pub fn key(&self) -> (String, String) {
    (self.module.path.clone(), self.query.clone())
  }

  /// `reset()`: reset children, clear emitted assets, reset compilation and
  /// transpilation, mark non-entry. Children and edge unlinking are handled
  /// by the graph, which owns cross-node mutation; this only clears local
  /// state.
  pub(crate) fn clear_local_state(&mut self) {
    self.assets.clear();
    self.emitted_assets.clear();
    self.is_entry = false;
  }
}
