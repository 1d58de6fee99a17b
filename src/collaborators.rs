// Copyright 2018-2026 the sandbox-bundler authors. MIT license.

//! The collaborator contracts the core consumes but does not own (§6):
//! presets, transformers, the dependency downloader, storage and the
//! diagnostics sink. Grounded on the teacher's own collaborator-trait shape
//! (`specifier_handler::SpecifierHandler` in `cli/graph.rs`,
//! `ModuleGraphContainer`/`ModuleGraphUpdatePermit` in
//! `cli/graph_container.rs`).

use std::collections::HashMap;

use async_trait::async_trait;

use crate::loader::LoaderContext;
use crate::manifest::{DependencyManifest, ManifestEntry};
use crate::module::Module;
use crate::node::NodeId;

/// One entry of a loader chain, as returned by [`Preset::get_loaders`].
#[derive(Debug, Clone)]
pub struct LoaderSpec {
  pub transpiler: String,
  pub options: HashMap<String, String>,
  pub cacheable: bool,
}

/// Maps a template to the ordered transformer list for a given
/// `(module, query)`, and resolves preset-defined aliases (§4.1 rule 2).
pub trait Preset {
  fn get_loaders(&self, module: &Module, query: &str) -> Vec<LoaderSpec>;
  fn get_aliased_path(&self, specifier: &str) -> String;
}

/// A concrete transformer, invoked once per `LoaderSpec` in a chain.
pub trait Transpiler {
  fn name(&self) -> &str;

  /// `transpile(code, loaderCtx) -> { transpiledCode, sourceMap }`.
  fn transpile(
    &self,
    code: &str,
    ctx: &mut LoaderContext,
  ) -> Result<(String, Option<String>), crate::error::LoaderError>;

  /// Cleanup hook invoked from `postEvaluate` when a node with zero
  /// initiators is garbage-collected (e.g. detach injected `<style>` tags).
  fn clean_module(&self, _ctx: &mut LoaderContext) {}

  fn cacheable(&self) -> bool {
    true
  }
}

/// `loadDependencies(deps) -> { manifest, isNewCombination }`. A new
/// combination invalidates the whole manager (§6).
#[async_trait(?Send)]
pub trait DependencyLoader {
  async fn load_dependencies(
    &self,
    deps: &HashMap<String, String>,
  ) -> Result<(DependencyManifest, bool), String>;

  /// Resolve a single bare specifier discovered mid-transpile that was not
  /// in the initial manifest (§4.3 step 1, §8 S6).
  async fn download_dependency(
    &self,
    specifier: &str,
    from_path: &str,
  ) -> Result<ManifestEntry, String>;
}

/// Opaque blob persistence, keyed by sandbox id.
#[async_trait(?Send)]
pub trait Storage {
  async fn save(&self, sandbox_id: &str, blob: Vec<u8>) -> Result<(), String>;
  async fn load(&self, sandbox_id: &str) -> Result<Option<Vec<u8>>, String>;
  async fn clear(&self, sandbox_id: &str) -> Result<(), String>;
}

/// `correction.show(message, loc)` for warnings (§6).
pub trait DiagnosticsSink {
  fn show_warning(&self, message: &str, node: NodeId, file_name: &str);
}
