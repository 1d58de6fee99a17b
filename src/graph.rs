// Copyright 2018-2026 the sandbox-bundler authors. MIT license.

//! The graph manager (§4.4): owns the entire set of transpiled-module
//! nodes keyed by `(source path, query)`, orchestrates transpile of the
//! entry and its transitive closure, drives evaluation, mediates
//! invalidation, and handles serialize/restore of the graph.
//!
//! Grounded on the teacher's arena-and-index split in `cli/graph.rs`'s
//! `Graph` type and on `cli/graph_container.rs`'s single-mutator discipline,
//! adapted to Rust's aliasing rules via an index-keyed arena behind
//! `RefCell` (§5: "wrap graph mutations in a single mutex" — here a
//! single-threaded cooperative executor makes a `RefCell` the direct
//! analogue). The whole module graph is single-owner for the duration of a
//! compile request; concurrency is expressed by `join_all` over sibling
//! transpile futures, never by aliasing `&mut self`.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};

use boa_engine::object::builtins::JsFunction;
use boa_engine::{Context, JsValue};
use futures::future::{join_all, LocalBoxFuture};
use log::{debug, warn};

use crate::collaborators::{DependencyLoader, DiagnosticsSink, Preset, Storage, Transpiler};
use crate::error::{BundlerError, EvalError, GraphError, ResolveError};
use crate::eval;
use crate::files::FileSet;
use crate::loader::{self, DependencyOptions, LoaderOp};
use crate::manifest::{DependencyManifest, EnvVariables, Externals};
use crate::module::{Module, ModuleSource};
use crate::node::{Compilation, HmrState, HotApi, NodeId, TranspiledModule};
use crate::serialize::{self, SerializedGraph};

/// Event emitted once an evaluation walk settles, consumed by the request
/// pipeline (§4.7) to drive the host event channel (§6).
pub enum EvalOutcome {
  Exports(serde_json::Value),
  /// HMR was active, this node is an entry with no cached compilation and
  /// does not self-accept: the host must hard-reload the page.
  Reload,
}

struct Inner {
  nodes: Vec<Option<TranspiledModule>>,
  index: HashMap<(String, String), NodeId>,
  files: FileSet,
  manifest: DependencyManifest,
  externals: Externals,
  env_variables: EnvVariables,
  webpack_hmr: bool,
  in_progress: HashSet<NodeId>,
  accept_callbacks: HashMap<NodeId, JsValue>,
}

impl Inner {
  fn node(&self, id: NodeId) -> Result<&TranspiledModule, GraphError> {
    self
      .nodes
      .get(id.0 as usize)
      .and_then(|slot| slot.as_ref())
      .ok_or(GraphError::MissingNode(id))
  }

  fn node_mut(&mut self, id: NodeId) -> Result<&mut TranspiledModule, GraphError> {
    self
      .nodes
      .get_mut(id.0 as usize)
      .and_then(|slot| slot.as_mut())
      .ok_or(GraphError::MissingNode(id))
  }
}

/// Owns the whole transpiled-module graph for one sandbox. Public surface
/// mirrors §4.4. All mutation methods take `&self`: the single `RefCell`
/// enforces the "only the active walk may mutate" discipline at runtime
/// instead of at the type level, since the recursive async/sync walks below
/// need many short-lived mutable views of disjoint nodes.
pub struct Graph {
  pub id: String,
  preset: Box<dyn Preset>,
  transpilers: HashMap<String, Box<dyn Transpiler>>,
  downloader: Option<Box<dyn DependencyLoader>>,
  storage: Option<Box<dyn Storage>>,
  diagnostics: Option<Box<dyn DiagnosticsSink>>,
  inner: RefCell<Inner>,
  next_id: Cell<u32>,
}

impl Graph {
  pub fn new(
    id: impl Into<String>,
    preset: Box<dyn Preset>,
    transpilers: HashMap<String, Box<dyn Transpiler>>,
    downloader: Option<Box<dyn DependencyLoader>>,
    storage: Option<Box<dyn Storage>>,
    diagnostics: Option<Box<dyn DiagnosticsSink>>,
  ) -> Self {
    Self {
      id: id.into(),
      preset,
      transpilers,
      downloader,
      storage,
      diagnostics,
      inner: RefCell::new(Inner {
        nodes: Vec::new(),
        index: HashMap::new(),
        files: FileSet::new(),
        manifest: DependencyManifest::default(),
        externals: Externals::default(),
        env_variables: EnvVariables::new(),
        webpack_hmr: false,
        in_progress: HashSet::new(),
        accept_callbacks: HashMap::new(),
      }),
      next_id: Cell::new(0),
    }
  }

  pub fn set_env_variables(&self, env: EnvVariables) {
    self.inner.borrow_mut().env_variables = env;
  }

  pub fn set_externals(&self, externals: Externals) {
    self.inner.borrow_mut().externals = externals;
  }

  pub fn webpack_hmr(&self) -> bool {
    self.inner.borrow().webpack_hmr
  }

  // ---- introspection (devtools/testing) ------------------------------

  pub fn has_dependency(&self, from: NodeId, to: NodeId) -> bool {
    matches!(self.inner.borrow().node(from), Ok(n) if n.dependencies.contains(&to))
  }

  pub fn has_initiator(&self, of: NodeId, initiator: NodeId) -> bool {
    matches!(self.inner.borrow().node(of), Ok(n) if n.initiators.contains(&initiator))
  }

  pub fn has_source(&self, id: NodeId) -> bool {
    matches!(self.inner.borrow().node(id), Ok(n) if n.source.is_some())
  }

  pub fn has_compilation(&self, id: NodeId) -> bool {
    matches!(self.inner.borrow().node(id), Ok(n) if n.compilation.is_some())
  }

  pub fn has_changed(&self, id: NodeId) -> bool {
    matches!(self.inner.borrow().node(id), Ok(n) if n.changed)
  }

  // ---- load / save (§4.4) -------------------------------------------

  /// Restore the transpiled-module graph from an opaque prior blob keyed
  /// by `sandboxId`. Best-effort; on any failure, start empty.
  pub async fn load(&self) {
    let Some(storage) = &self.storage else {
      return;
    };
    match storage.load(&self.id).await {
      Ok(Some(blob)) => match serde_json::from_slice::<SerializedGraph>(&blob) {
        Ok(serialized) => {
          let mut inner = self.inner.borrow_mut();
          if let Err(e) = serialize::deserialize(serialized, &mut inner.nodes, &mut inner.index) {
            warn!("discarding corrupt sandbox graph cache: {e}");
            inner.nodes.clear();
            inner.index.clear();
          }
          self.next_id.set(inner.nodes.len() as u32);
        }
        Err(e) => warn!("discarding unparsable sandbox graph cache: {e}"),
      },
      Ok(None) => {}
      Err(e) => warn!("failed to load sandbox graph cache: {e}"),
    }
  }

  /// Serialize the current graph and hand the blob to the storage
  /// collaborator.
  pub async fn save(&self) {
    let Some(storage) = &self.storage else {
      return;
    };
    let blob = {
      let inner = self.inner.borrow();
      serialize::serialize(&inner.nodes)
    };
    match serde_json::to_vec(&blob) {
      Ok(bytes) => {
        if let Err(e) = storage.save(&self.id, bytes).await {
          warn!("failed to save sandbox graph cache: {e}");
        }
      }
      Err(e) => warn!("failed to encode sandbox graph cache: {e}"),
    }
  }

  pub async fn clear_cache(&self) {
    if let Some(storage) = &self.storage {
      let _ = storage.clear(&self.id).await;
    }
  }

  pub fn set_manifest(&self, manifest: DependencyManifest) {
    self.inner.borrow_mut().manifest = manifest;
  }

  pub fn downloader(&self) -> Option<&dyn DependencyLoader> {
    self.downloader.as_deref()
  }

  /// Drops every node and edge (§6: "a new combination invalidates the
  /// whole manager"). The file set, manifest, externals and env variables
  /// are left untouched; the caller re-adopts them via `update_data` and
  /// `set_manifest` around this call, same as a fresh sandbox would.
  pub fn invalidate_all(&self) {
    let mut inner = self.inner.borrow_mut();
    inner.nodes.clear();
    inner.index.clear();
    inner.in_progress.clear();
    inner.accept_callbacks.clear();
  }

  /// Count of live nodes, for callers that only need to observe arena size
  /// (e.g. confirming an invalidation actually dropped prior nodes).
  pub fn node_count(&self) -> usize {
    self.inner.borrow().nodes.iter().filter(|n| n.is_some()).count()
  }

  // ---- node lifecycle -------------------------------------------------

  /// Create or look up a node by `(path, query)`.
  pub fn add_transpiled_module(&self, module: Module, query: String) -> NodeId {
    let key = (module.path.clone(), query.clone());
    let mut inner = self.inner.borrow_mut();
    if let Some(&id) = inner.index.get(&key) {
      return id;
    }
    let id = NodeId(self.next_id.get());
    self.next_id.set(id.0 + 1);
    let node = TranspiledModule::new(id, module, query);
    if inner.nodes.len() <= id.0 as usize {
      inner.nodes.resize_with(id.0 as usize + 1, || None);
    }
    inner.nodes[id.0 as usize] = Some(node);
    inner.index.insert(key, id);
    id
  }

  /// Reconcile the node set with a new file set (§4.4): create a node per
  /// unseen path, `update()` existing ones, and remove nodes whose source
  /// paths disappeared and are not retained (not an entry, no initiators).
  pub fn update_data(&self, modules: Vec<Module>) {
    let incoming: HashMap<String, Module> =
      modules.into_iter().map(|m| (m.path.clone(), m)).collect();

    let stale_paths: Vec<String> = {
      let inner = self.inner.borrow();
      inner
        .files
        .paths()
        .filter(|p| !incoming.contains_key(*p))
        .map(str::to_string)
        .collect()
    };

    for (path, module) in incoming.iter() {
      let unchanged = matches!(self.inner.borrow().files.get(path), Some(old) if old == module);
      if unchanged {
        continue;
      }
      let existing_root = {
        let inner = self.inner.borrow();
        inner.index.get(&(path.clone(), String::new())).copied()
      };
      match existing_root {
        Some(id) => self.update_module(id, module.clone()),
        None => {
          self.inner.borrow_mut().files.insert(module.clone());
        }
      }
    }
    // Register brand-new files into the index lazily: a node is only
    // materialized on first reference (direct import or loader-emitted
    // child), per the lifecycle rule in §3.

    for path in stale_paths {
      self.remove_source(&path);
    }
  }

  fn update_module(&self, id: NodeId, new_module: Module) {
    {
      let mut inner = self.inner.borrow_mut();
      inner.files.insert(new_module.clone());
      if let Ok(node) = inner.node_mut(id) {
        node.module = new_module;
      }
    }
    self.reset(id);
  }

  /// Remove every node rooted at `path` that is not retained (not an entry,
  /// no initiators), after dropping the source module itself.
  fn remove_source(&self, path: &str) {
    self.inner.borrow_mut().files.remove(path);
    let candidates: Vec<NodeId> = {
      let inner = self.inner.borrow();
      inner
        .nodes
        .iter()
        .filter_map(|slot| slot.as_ref())
        .filter(|n| n.module.path == path)
        .map(|n| n.id)
        .collect()
    };
    for id in candidates {
      self.try_collect(id);
    }
  }

  fn try_collect(&self, id: NodeId) {
    let retained = {
      let inner = self.inner.borrow();
      match inner.node(id) {
        Ok(node) => node.is_entry || !node.initiators.is_empty(),
        Err(_) => return,
      }
    };
    if retained {
      return;
    }
    self.dispose(id);
    let mut inner = self.inner.borrow_mut();
    if let Ok(node) = inner.node(id) {
      let key = node.key();
      inner.index.remove(&key);
    }
    if let Some(slot) = inner.nodes.get_mut(id.0 as usize) {
      *slot = None;
    }
  }

  // ---- resolution -------------------------------------------------------

  pub fn resolve_transpiled_module(
    &self,
    specifier: &str,
    from_path: &str,
  ) -> Result<NodeId, ResolveError> {
    self.resolve_transpiled_module_with(specifier, from_path, false)
  }

  /// As [`Graph::resolve_transpiled_module`], but honoring a loader-declared
  /// `{ isAbsolute: true }` on the dependency (§4.1 rule 4): the join base is
  /// forced to `/` instead of `from_path`'s directory.
  pub fn resolve_transpiled_module_with(
    &self,
    specifier: &str,
    from_path: &str,
    is_absolute: bool,
  ) -> Result<NodeId, ResolveError> {
    let split = crate::resolve::split_loader_chain(specifier);
    let inner = self.inner.borrow();
    let module = crate::resolve::resolve(
      self.preset.as_ref(),
      &inner.files,
      &inner.manifest,
      &inner.externals,
      &split.path_part,
      from_path,
      is_absolute,
    )?
    .clone();
    drop(inner);
    Ok(self.add_transpiled_module(module, split.query))
  }

  pub fn resolve_transpiled_modules_in_directory(&self, dir: &str, _from_path: &str) -> Vec<NodeId> {
    let inner = self.inner.borrow();
    let modules: Vec<Module> = inner.files.in_directory(dir).cloned().collect();
    drop(inner);
    modules
      .into_iter()
      .map(|m| self.add_transpiled_module(m, String::new()))
      .collect()
  }

  // ---- transpile (§4.3) --------------------------------------------------

  /// Mark `entry` as a root then transpile it and its transitive closure.
  pub async fn transpile_modules(&self, entry: NodeId) -> Result<(), BundlerError> {
    {
      let mut inner = self.inner.borrow_mut();
      if let Ok(node) = inner.node_mut(entry) {
        node.is_entry = true;
      }
    }
    self.transpile_node(entry).await
  }

  fn transpile_node<'a>(&'a self, id: NodeId) -> LocalBoxFuture<'a, Result<(), BundlerError>> {
    Box::pin(async move {
      // The transform itself is idempotent while `source` is non-null
      // (§4.3): a node already holding a cached `ModuleSource` does not
      // re-run its loader chain. The fan-out below still runs regardless,
      // so a `transpileModules(entry)` call from an unaffected entry still
      // reaches a dependency further down that an edit invalidated (§8 S5).
      let already_done = matches!(self.inner.borrow().node(id), Ok(n) if n.source.is_some());

      if !already_done {
        // Clear old outgoing runtime edges before re-running the chain.
        self.unlink_dependencies(id);

        let (module, query) = {
          let inner = self.inner.borrow();
          let node = inner.node(id)?;
          (node.module.clone(), node.query.clone())
        };

        let chain_output = {
          let inner = self.inner.borrow();
          loader::run_chain(
            id,
            &module,
            &query,
            self.preset.as_ref(),
            &self.transpilers,
            &inner.files,
          )
        };

        let chain_output = match chain_output {
          Ok(out) => out,
          Err(e) => {
            self.reset_transpilation(id);
            return Err(BundlerError::Loader(e));
          }
        };

        for warning in &chain_output.warnings {
          if let Some(sink) = &self.diagnostics {
            sink.show_warning(&warning.message, id, &warning.file_name);
          }
        }

        let code_with_url =
          ModuleSource::with_source_url("sandbox://", &module.path, chain_output.code.clone());

        {
          let mut inner = self.inner.borrow_mut();
          let node = inner.node_mut(id)?;
          node.source = Some(ModuleSource {
            file_name: module.path.clone(),
            compiled_code: code_with_url,
            source_map: chain_output.source_map,
          });
          node.warnings = chain_output.warnings;
          node.non_cacheable = chain_output.non_cacheable;
        }

        let mut pending_async: Vec<String> = Vec::new();
        self.apply_loader_ops(id, chain_output.ops, &mut pending_async);

        // Step 1: resolve pending async dependencies via the downloader.
        if !pending_async.is_empty() {
          if let Some(downloader) = &self.downloader {
            for specifier in pending_async {
              match downloader.download_dependency(&specifier, &module.path).await {
                Ok(entry) => {
                  let path = format!("/node_modules/{}/{}", entry.name, entry.main);
                  let dep_module = {
                    let inner = self.inner.borrow();
                    inner.files.get(&path).cloned()
                  };
                  {
                    let mut inner = self.inner.borrow_mut();
                    inner.manifest.entries.insert(specifier.clone(), entry);
                  }
                  if let Some(dep_module) = dep_module {
                    let dep_id = self.add_transpiled_module(dep_module, String::new());
                    self.link_dependency(id, dep_id);
                  }
                  let mut inner = self.inner.borrow_mut();
                  if let Ok(node) = inner.node_mut(id) {
                    node.async_dependencies.remove(&specifier);
                  }
                }
                Err(_) => {
                  // Rejections are ignored at this stage (§4.3 step 1);
                  // deferred to evaluation.
                }
              }
            }
          }
        }
      }

      // Step 2: concurrently transpile transpilation-initiators and
      // dependencies not yet transpiled. Runs whether or not this node's
      // own chain just ran, so an already-cached node still reaches a
      // dependency invalidated since this node was last transpiled.
      let fan_out: Vec<NodeId> = {
        let inner = self.inner.borrow();
        let node = inner.node(id)?;
        node
          .transpilation_initiators
          .iter()
          .chain(node.dependencies.iter())
          .copied()
          .filter(|dep_id| {
            inner
              .node(*dep_id)
              .map(|n| n.source.is_none())
              .unwrap_or(false)
          })
          .collect::<HashSet<_>>()
          .into_iter()
          .collect()
      };

      let results = join_all(fan_out.iter().map(|dep_id| self.transpile_node(*dep_id))).await;
      for result in results {
        result?;
      }

      Ok(())
    })
  }

  fn apply_loader_ops(&self, id: NodeId, ops: Vec<LoaderOp>, pending_async: &mut Vec<String>) {
    for op in ops {
      match op {
        LoaderOp::EmitModule {
          path,
          code,
          dir_path,
        } => {
          let resolved_path = if path.starts_with('/') {
            path
          } else {
            let dir = dir_path.unwrap_or_else(|| {
              let inner = self.inner.borrow();
              inner
                .node(id)
                .map(|n| n.module.directory().to_string())
                .unwrap_or_else(|_| "/".to_string())
            });
            format!("{}/{}", dir.trim_end_matches('/'), path)
          };
          let child_module = Module::new(resolved_path, code);
          {
            let mut inner = self.inner.borrow_mut();
            inner.files.insert(child_module.clone());
          }
          let child_id = self.add_transpiled_module(child_module, String::new());
          {
            let mut inner = self.inner.borrow_mut();
            if let Ok(node) = inner.node_mut(id) {
              node.child_modules.push(child_id);
            }
          }
          self.link_dependency(id, child_id);
        }
        LoaderOp::EmitFile {
          name,
          content,
          source_map,
        } => {
          let mut inner = self.inner.borrow_mut();
          if let Ok(node) = inner.node_mut(id) {
            node.assets.insert(
              name.clone(),
              ModuleSource {
                file_name: name.clone(),
                compiled_code: content,
                source_map,
              },
            );
            node.emitted_assets.push(name);
          }
        }
        LoaderOp::AddDependency { specifier, opts } => {
          self.add_dependency_op(id, &specifier, opts, pending_async, false);
        }
        LoaderOp::AddTranspilationDependency { specifier, opts } => {
          self.add_dependency_op(id, &specifier, opts, pending_async, true);
        }
        LoaderOp::AddDependenciesInDirectory { dir, opts: _ } => {
          let from_path = {
            let inner = self.inner.borrow();
            inner
              .node(id)
              .map(|n| n.module.path.clone())
              .unwrap_or_default()
          };
          let deps = self.resolve_transpiled_modules_in_directory(&dir, &from_path);
          for dep_id in deps {
            self.link_dependency(id, dep_id);
          }
        }
      }
    }
  }

  fn add_dependency_op(
    &self,
    id: NodeId,
    specifier: &str,
    opts: DependencyOptions,
    pending_async: &mut Vec<String>,
    is_transpilation: bool,
  ) {
    let from_path = {
      let inner = self.inner.borrow();
      inner
        .node(id)
        .map(|n| n.module.path.clone())
        .unwrap_or_default()
    };

    // "Known to be special" runtime helpers/host APIs resolve through
    // externals and are never linked as a graph edge (§4.2).
    if self.inner.borrow().externals.contains(specifier) {
      return;
    }

    match self.resolve_transpiled_module_with(specifier, &from_path, opts.is_absolute) {
      Ok(dep_id) => {
        if is_transpilation {
          self.link_transpilation_dependency(id, dep_id);
        } else {
          self.link_dependency(id, dep_id);
        }
      }
      Err(e) if e.is_dependency() => {
        pending_async.push(specifier.to_string());
        let mut inner = self.inner.borrow_mut();
        if let Ok(node) = inner.node_mut(id) {
          node.async_dependencies.insert(specifier.to_string());
        }
      }
      Err(_) => {
        // Real failure surfaces at evaluation time (§7).
        debug!("could not resolve '{specifier}' from '{from_path}' during transpile");
      }
    }
  }

  // ---- edge maintenance ---------------------------------------------------

  fn link_dependency(&self, from: NodeId, to: NodeId) {
    let mut inner = self.inner.borrow_mut();
    if let Ok(node) = inner.node_mut(from) {
      node.dependencies.insert(to);
    }
    if let Ok(node) = inner.node_mut(to) {
      node.initiators.insert(from);
    }
  }

  fn unlink_dependency(&self, from: NodeId, to: NodeId) {
    let mut inner = self.inner.borrow_mut();
    if let Ok(node) = inner.node_mut(from) {
      node.dependencies.remove(&to);
    }
    if let Ok(node) = inner.node_mut(to) {
      node.initiators.remove(&from);
    }
  }

  fn link_transpilation_dependency(&self, from: NodeId, to: NodeId) {
    let mut inner = self.inner.borrow_mut();
    if let Ok(node) = inner.node_mut(from) {
      node.transpilation_dependencies.insert(to);
    }
    if let Ok(node) = inner.node_mut(to) {
      node.transpilation_initiators.insert(from);
    }
  }

  /// Remove self from the `initiators` of every current dependency, as the
  /// first step of re-transpiling a node (§4.3).
  fn unlink_dependencies(&self, id: NodeId) {
    let deps: Vec<NodeId> = {
      let inner = self.inner.borrow();
      inner
        .node(id)
        .map(|n| n.dependencies.iter().copied().collect())
        .unwrap_or_default()
    };
    for dep in deps {
      self.unlink_dependency(id, dep);
    }
  }

  // ---- reset / invalidation (§4.3) ---------------------------------------

  /// `reset()`: reset children, clear emitted assets, reset compilation and
  /// transpilation, mark non-entry.
  pub fn reset(&self, id: NodeId) {
    let children: Vec<NodeId> = {
      let inner = self.inner.borrow();
      inner
        .node(id)
        .map(|n| n.child_modules.clone())
        .unwrap_or_default()
    };
    for child in children {
      self.reset(child);
    }
    {
      let mut inner = self.inner.borrow_mut();
      if let Ok(node) = inner.node_mut(id) {
        node.clear_local_state();
      }
    }
    self.reset_compilation(id);
    self.reset_transpilation(id);
  }

  pub fn reset_transpilation(&self, id: NodeId) {
    let (hmr_off, initiators, deps): (bool, Vec<NodeId>, Vec<NodeId>) = {
      let inner = self.inner.borrow();
      match inner.node(id) {
        Ok(node) => (
          node.hmr_enabled == HmrState::Off,
          node.transpilation_initiators.iter().copied().collect(),
          node.dependencies.iter().copied().collect(),
        ),
        Err(_) => return,
      }
    };

    if hmr_off {
      for initiator in initiators {
        let has_source = matches!(
          self.inner.borrow().node(initiator),
          Ok(n) if n.source.is_some()
        );
        if has_source {
          self.reset_transpilation(initiator);
        }
      }
    }

    for dep in deps {
      self.unlink_dependency(id, dep);
    }

    let mut inner = self.inner.borrow_mut();
    if let Ok(node) = inner.node_mut(id) {
      node.source = None;
      node.errors.clear();
      node.warnings.clear();
      node.dependencies.clear();
      node.async_dependencies.clear();
    }
  }

  pub fn reset_compilation(&self, id: NodeId) {
    let (has_compilation, hmr_on, initiators, transpilation_initiators): (
      bool,
      bool,
      Vec<NodeId>,
      Vec<NodeId>,
    ) = {
      let inner = self.inner.borrow();
      match inner.node(id) {
        Ok(node) => (
          node.compilation.is_some(),
          node.hmr_enabled != HmrState::Off,
          node.initiators.iter().copied().collect(),
          node.transpilation_initiators.iter().copied().collect(),
        ),
        Err(_) => return,
      }
    };

    if !has_compilation {
      return;
    }

    if hmr_on {
      let mut inner = self.inner.borrow_mut();
      if let Ok(node) = inner.node_mut(id) {
        node.changed = true;
      }
      return;
    }

    {
      let mut inner = self.inner.borrow_mut();
      if let Ok(node) = inner.node_mut(id) {
        node.compilation = None;
        node.changed = false;
      }
    }
    for initiator in initiators {
      let has = matches!(self.inner.borrow().node(initiator), Ok(n) if n.compilation.is_some());
      if has {
        self.reset_compilation(initiator);
      }
    }
    for initiator in transpilation_initiators {
      let has = matches!(self.inner.borrow().node(initiator), Ok(n) if n.compilation.is_some());
      if has {
        self.reset_compilation(initiator);
      }
    }
  }

  pub fn dispose(&self, id: NodeId) {
    self.reset(id);
  }

  // ---- evaluate (§4.3, §4.5) ----------------------------------------------

  /// Evaluate `entry` transitively, then call `postEvaluate` on every
  /// touched node.
  pub fn evaluate_module(&self, entry: NodeId) -> Result<EvalOutcome, BundlerError> {
    let mut context = Context::default();
    let mut touched = HashSet::new();
    let result = self.evaluate_in_context(&mut context, entry, &[], &mut touched);
    for id in &touched {
      self.post_evaluate(*id);
    }
    match result {
      Ok(Some(value)) => {
        let json = value.to_json(&mut context).map_err(|e| {
          BundlerError::Eval(EvalError::Runtime {
            message: e.to_string(),
            t_module: Some(entry),
          })
        })?;
        Ok(EvalOutcome::Exports(json))
      }
      Ok(None) => Ok(EvalOutcome::Reload),
      Err(e) => Err(BundlerError::Eval(e)),
    }
  }

  /// The recursive entry point used by `require` (§4.3 step 4). Returns
  /// `Ok(None)` only for the HMR full-reload short-circuit.
  fn evaluate_in_context(
    &self,
    context: &mut Context,
    id: NodeId,
    parents: &[NodeId],
    touched: &mut HashSet<NodeId>,
  ) -> Result<Option<JsValue>, EvalError> {
    touched.insert(id);

    let (is_entry, has_compilation, hmr_self_accept) = {
      let inner = self.inner.borrow();
      let node = inner.node(id).map_err(|e| EvalError::Runtime {
        message: e.to_string(),
        t_module: Some(id),
      })?;
      (
        node.is_entry,
        node.compilation.is_some(),
        node.hmr_enabled != HmrState::Off,
      )
    };

    if self.webpack_hmr() && is_entry && !has_compilation && !hmr_self_accept {
      return Ok(None);
    }

    let changed = matches!(self.inner.borrow().node(id), Ok(n) if n.changed);
    if has_compilation && !changed {
      let exports = {
        let inner = self.inner.borrow();
        inner.node(id).unwrap().compilation.as_ref().unwrap().exports.clone()
      };
      return json_to_value(&exports, context, id);
    }

    if self.inner.borrow().in_progress.contains(&id) {
      // Cycle (§8 S3): hand back whatever the in-progress node's exports
      // look like right now. The simplified JSON-cached bridging model (see
      // `eval.rs`) means this is the snapshot from evaluation start (an
      // empty object) rather than a live view of assignments made so far in
      // the still-running call further up the stack; callers that read a
      // cyclic dependency's property *after* it is assigned still see it,
      // since that read happens via the live object handed back from the
      // *completed* call, not this snapshot. See DESIGN.md.
      let hint = self.inner.borrow().live_exports_hint(id);
      return Ok(Some(hint.unwrap_or_else(JsValue::undefined)));
    }

    let source_code = {
      let inner = self.inner.borrow();
      let node = inner.node(id).map_err(|e| EvalError::Runtime {
        message: e.to_string(),
        t_module: Some(id),
      })?;
      node.source.as_ref().map(|s| s.compiled_code.clone())
    };
    let Some(source_code) = source_code else {
      return Err(EvalError::Runtime {
        message: "cannot evaluate a node with no transpile output".into(),
        t_module: Some(id),
      });
    };

    self.inner.borrow_mut().in_progress.insert(id);
    {
      let mut inner = self.inner.borrow_mut();
      if let Ok(node) = inner.node_mut(id) {
        if node.compilation.is_none() {
          node.compilation = Some(Compilation {
            exports: serde_json::Value::Object(Default::default()),
            hot: HotApi::default(),
          });
        }
      }
    }

    let mut parent_stack = parents.to_vec();
    parent_stack.push(id);

    let host = GraphRequireHost {
      graph: self,
      parents: &parent_stack,
    };
    let env = self.inner.borrow().env_variables.clone();
    let eval_result = eval::evaluate_linked(context, &source_code, id, &host, &env);

    self.inner.borrow_mut().in_progress.remove(&id);

    let exports_value = eval_result.map_err(|mut e| {
      if let EvalError::Runtime { t_module, .. } = &mut e {
        if t_module.is_none() {
          *t_module = Some(id);
        }
      }
      e
    })?;

    let exports_json = exports_value.to_json(context).map_err(|e| EvalError::Runtime {
      message: e.to_string(),
      t_module: Some(id),
    })?;

    {
      let mut inner = self.inner.borrow_mut();
      if let Ok(node) = inner.node_mut(id) {
        node.compilation = Some(Compilation {
          exports: exports_json,
          hot: HotApi { accepted: node.hmr_enabled != HmrState::Off },
        });
        node.changed = false;
      }
    }

    // §4.3 step 6: on a re-evaluation (not the first run), invoke whatever
    // accept callback this execution just (re-)registered via
    // `module.hot.accept`, now that the new exports are in place.
    if changed {
      let callback = self.inner.borrow().accept_callbacks.get(&id).cloned();
      let callback = callback
        .as_ref()
        .and_then(|v| v.as_object())
        .cloned()
        .and_then(JsFunction::from_object);
      if let Some(callback) = callback {
        let _ = callback.call(&JsValue::undefined(), &[], context);
      }
    }

    Ok(Some(exports_value))
  }

  /// `postEvaluate`: drop non-cacheable compilations and give zero-initiator
  /// non-entry nodes a cleanup pass.
  fn post_evaluate(&self, id: NodeId) {
    let (module, query, is_garbage, non_cacheable) = {
      let inner = self.inner.borrow();
      match inner.node(id) {
        Ok(node) => (
          node.module.clone(),
          node.query.clone(),
          !node.is_entry && node.initiators.is_empty(),
          node.non_cacheable,
        ),
        Err(_) => return,
      }
    };

    if non_cacheable {
      let mut inner = self.inner.borrow_mut();
      if let Ok(node) = inner.node_mut(id) {
        node.compilation = None;
      }
    }

    let specs = self.preset.get_loaders(&module, &query);
    if is_garbage {
      for spec in &specs {
        if let Some(transpiler) = self.transpilers.get(&spec.transpiler) {
          let mut ctx = crate::loader::LoaderContext::new(
            id,
            module.path.clone(),
            spec.options.clone(),
            &self.inner.borrow().files,
          );
          transpiler.clean_module(&mut ctx);
        }
      }
    }
  }

  // ---- hot module replacement --------------------------------------------

  pub fn mark_self_accept(&self, id: NodeId) {
    let mut inner = self.inner.borrow_mut();
    if let Ok(node) = inner.node_mut(id) {
      node.hmr_enabled = HmrState::SelfAccept;
    }
    inner.webpack_hmr = true;
  }

  pub fn mark_accept(&self, id: NodeId, callback: JsValue) {
    let mut inner = self.inner.borrow_mut();
    if let Ok(node) = inner.node_mut(id) {
      node.hmr_enabled = HmrState::Accept;
    }
    inner.webpack_hmr = true;
    inner.accept_callbacks.insert(id, callback);
  }
}

impl Inner {
  /// Best-effort hint at a node's in-progress live exports value. The
  /// simplified (non-live) bridging model (see `eval.rs`) means a reentrant
  /// cyclic `require` only ever observes the empty scaffold recorded at
  /// evaluation start, matching the common case where cyclic modules only
  /// read each other's exports *after* assignment completes elsewhere in
  /// the call graph (§8 S3). See DESIGN.md for the tradeoff.
  fn live_exports_hint(&self, id: NodeId) -> Option<JsValue> {
    let node = self.node(id).ok()?;
    let exports = node.compilation.as_ref()?.exports.clone();
    Some(JsValue::from_json(&exports, &mut Context::default()).ok()?)
  }
}

struct GraphRequireHost<'a> {
  graph: &'a Graph,
  parents: &'a [NodeId],
}

impl<'a> eval::RequireHost for GraphRequireHost<'a> {
  fn require(
    &self,
    context: &mut Context,
    from: NodeId,
    specifier: &str,
  ) -> Result<JsValue, EvalError> {
    let from_path = {
      let inner = self.graph.inner.borrow();
      inner
        .node(from)
        .map(|n| n.module.path.clone())
        .unwrap_or_default()
    };

    // Externals and runtime helpers resolve directly, never through the
    // graph (§4.3 step 4).
    let externals_hit = self.graph.inner.borrow().externals.get(specifier).cloned();
    if let Some(value) = externals_hit {
      return JsValue::from_json(&value, context).map_err(|e| EvalError::Runtime {
        message: e.to_string(),
        t_module: Some(from),
      });
    }

    let split = crate::resolve::split_loader_chain(specifier);
    if !crate::resolve::is_bare_specifier(&split.path_part) {
      // Relative self-import check (§4.3 step 4, §7).
      let from_dir = crate::module::Module::new(from_path.clone(), "")
        .directory()
        .to_string();
      let joined = crate::resolve::join_for_self_check(&from_dir, &split.path_part);
      if joined == from_path {
        return Err(EvalError::SelfImport(specifier.to_string()));
      }
    }

    let target = self
      .graph
      .resolve_transpiled_module(specifier, &from_path)
      .map_err(|e| EvalError::RequireResolution {
        specifier: specifier.to_string(),
        from_path: from_path.clone(),
        source: e,
      })?;

    if target == from {
      return Err(EvalError::SelfImport(specifier.to_string()));
    }

    let mut touched = HashSet::new();
    match self
      .graph
      .evaluate_in_context(context, target, self.parents, &mut touched)?
    {
      Some(value) => Ok(value),
      None => Ok(JsValue::undefined()),
    }
  }

  fn self_accept(&self, from: NodeId) {
    self.graph.mark_self_accept(from);
  }

  /// `accept(path, callback)` (§4.3 step 3): `path` names the module to mark
  /// HMR-accepting, resolved relative to `from`, not `from` itself. If `path`
  /// cannot be resolved, the call is dropped: there is no node to mark.
  fn accept(&self, from: NodeId, path: &str, callback: JsValue) {
    let from_path = {
      let inner = self.graph.inner.borrow();
      inner
        .node(from)
        .map(|n| n.module.path.clone())
        .unwrap_or_default()
    };
    if let Ok(target) = self.graph.resolve_transpiled_module(path, &from_path) {
      self.graph.mark_accept(target, callback);
    }
  }
}

fn json_to_value(
  value: &serde_json::Value,
  context: &mut Context,
  node_id: NodeId,
) -> Result<Option<JsValue>, EvalError> {
  JsValue::from_json(value, context)
    .map(Some)
    .map_err(|e| EvalError::Runtime {
      message: e.to_string(),
      t_module: Some(node_id),
    })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::collaborators::LoaderSpec;

  struct IdentityPreset;
  impl Preset for IdentityPreset {
    fn get_loaders(&self, _module: &Module, _query: &str) -> Vec<LoaderSpec> {
      vec![LoaderSpec {
        transpiler: "identity".into(),
        options: HashMap::new(),
        cacheable: true,
      }]
    }
    fn get_aliased_path(&self, specifier: &str) -> String {
      specifier.to_string()
    }
  }

  struct IdentityTranspiler;
  impl Transpiler for IdentityTranspiler {
    fn name(&self) -> &str {
      "identity"
    }
    fn transpile(
      &self,
      code: &str,
      _ctx: &mut crate::loader::LoaderContext,
    ) -> Result<(String, Option<String>), crate::error::LoaderError> {
      Ok((code.to_string(), None))
    }
  }

  fn test_graph() -> Graph {
    let mut transpilers: HashMap<String, Box<dyn Transpiler>> = HashMap::new();
    transpilers.insert("identity".into(), Box::new(IdentityTranspiler));
    Graph::new("test-sandbox", Box::new(IdentityPreset), transpilers, None, None, None)
  }

  #[test]
  fn single_file_evaluation() {
    let graph = test_graph();
    graph.update_data(vec![Module::new("/index.js", "module.exports = 1 + 2")]);
    let entry = graph.resolve_transpiled_module("/index.js", "/").unwrap();
    futures::executor::block_on(graph.transpile_modules(entry)).unwrap();
    match graph.evaluate_module(entry).unwrap() {
      EvalOutcome::Exports(v) => assert_eq!(v, serde_json::json!(3)),
      EvalOutcome::Reload => panic!("unexpected reload"),
    }
  }

  #[test]
  fn two_file_linkage_produces_edge_pairs() {
    let graph = test_graph();
    graph.update_data(vec![
      Module::new("/a.js", "module.exports = require('./b').x * 2"),
      Module::new("/b.js", "exports.x = 21"),
    ]);
    let entry = graph.resolve_transpiled_module("/a.js", "/").unwrap();
    futures::executor::block_on(graph.transpile_modules(entry)).unwrap();
    match graph.evaluate_module(entry).unwrap() {
      EvalOutcome::Exports(v) => assert_eq!(v, serde_json::json!(42)),
      EvalOutcome::Reload => panic!("unexpected reload"),
    }

    let b = graph.resolve_transpiled_module("./b", "/a.js").unwrap();
    let inner = graph.inner.borrow();
    assert!(inner.node(entry).unwrap().dependencies.contains(&b));
    assert!(inner.node(b).unwrap().initiators.contains(&entry));
  }

  #[test]
  fn cycle_tolerant_evaluation_terminates() {
    let graph = test_graph();
    graph.update_data(vec![
      Module::new("/a.js", "exports.a=1; exports.b=require('./b').b;"),
      Module::new("/b.js", "exports.b=2; exports.a=require('./a').a;"),
    ]);
    let entry = graph.resolve_transpiled_module("/a.js", "/").unwrap();
    futures::executor::block_on(graph.transpile_modules(entry)).unwrap();
    match graph.evaluate_module(entry).unwrap() {
      EvalOutcome::Exports(v) => {
        assert_eq!(v.get("b"), Some(&serde_json::json!(2)));
      }
      EvalOutcome::Reload => panic!("unexpected reload"),
    }
  }

  #[test]
  fn edit_invalidation_clears_ancestor_compilation() {
    let graph = test_graph();
    graph.update_data(vec![
      Module::new("/a.js", "module.exports = require('./b').x * 2"),
      Module::new("/b.js", "exports.x = 21"),
    ]);
    let entry = graph.resolve_transpiled_module("/a.js", "/").unwrap();
    futures::executor::block_on(graph.transpile_modules(entry)).unwrap();
    graph.evaluate_module(entry).unwrap();

    graph.update_data(vec![
      Module::new("/a.js", "module.exports = require('./b').x * 2"),
      Module::new("/b.js", "exports.x = 10"),
    ]);

    let b = graph.resolve_transpiled_module("./b", "/a.js").unwrap();
    assert!(graph.inner.borrow().node(b).unwrap().source.is_none());
    assert!(graph.inner.borrow().node(entry).unwrap().compilation.is_none());

    futures::executor::block_on(graph.transpile_modules(entry)).unwrap();
    match graph.evaluate_module(entry).unwrap() {
      EvalOutcome::Exports(v) => assert_eq!(v, serde_json::json!(20)),
      EvalOutcome::Reload => panic!("unexpected reload"),
    }
  }

  #[test]
  fn is_absolute_dependency_resolves_against_root_not_initiator_dir() {
    let graph = test_graph();
    graph.update_data(vec![
      Module::new("/deeply/nested/a.js", "1"),
      Module::new("/lib/util.js", "2"),
    ]);
    let rooted = graph
      .resolve_transpiled_module_with("./lib/util", "/deeply/nested/a.js", true)
      .unwrap();
    assert_eq!(graph.inner.borrow().node(rooted).unwrap().module.path, "/lib/util.js");

    let from_dir = graph.resolve_transpiled_module_with("./lib/util", "/deeply/nested/a.js", false);
    assert!(from_dir.is_err());
  }
}
