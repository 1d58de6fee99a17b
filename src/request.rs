// Copyright 2018-2026 the sandbox-bundler authors. MIT license.

//! The request pipeline (§4.7, ambient): the single-slot coalescing queue
//! plus the `CompileRequest` → [`HostEvent`] orchestration that drives the
//! graph manager end to end. Grounded on the permit/commit shape of
//! `MainModuleGraphContainer::acquire_update_permit` in
//! `cli/graph_container.rs`, but a single-slot *coalescing* queue rather
//! than a strict FIFO: this runtime has no native threads (§5), so only one
//! compile can ever be in flight; a request that arrives while another is
//! running doesn't queue behind it; it replaces whatever was already
//! waiting, and every caller still pending when the in-flight request
//! settles receives the result of whichever request the driver runs next.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;

use futures::channel::oneshot;
use log::error;
use serde::{Deserialize, Serialize};

use crate::events::HostEvent;
use crate::graph::{EvalOutcome, Graph};
use crate::manifest::{EnvVariables, Externals};
use crate::module::Module;

/// One compile request entering the manager (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileRequest {
  pub sandbox_id: String,
  pub modules: Vec<Module>,
  pub entry: String,
  #[serde(default)]
  pub external_resources: HashMap<String, serde_json::Value>,
  /// Declared package → version-range requirements (§6), resolved into a
  /// `crate::manifest::DependencyManifest` via the dependency-loader
  /// collaborator before each compile.
  #[serde(default)]
  pub dependencies: HashMap<String, String>,
  #[serde(default)]
  pub env_variables: EnvVariables,
  #[serde(default)]
  pub has_actions: bool,
  #[serde(default)]
  pub is_module_view: bool,
  #[serde(default)]
  pub template: String,
}

struct PendingSlot {
  request: CompileRequest,
  waiters: Vec<oneshot::Sender<HostEvent>>,
}

/// The single-slot coalescing queue (§5). `Cell`/`RefCell`-backed since the
/// single-threaded cooperative executor never observes concurrent mutable
/// access; the only reentrancy is the loop below driving successive
/// superseding requests itself.
#[derive(Default)]
pub struct RequestQueue {
  running: Cell<bool>,
  pending: RefCell<Option<PendingSlot>>,
}

impl RequestQueue {
  pub fn new() -> Self {
    Self::default()
  }

  /// Runs `request` through `run`, coalescing with any request that arrives
  /// while this (or a superseding) run is in flight. Every caller gets the
  /// outcome of whichever request the driver ends up actually running last.
  pub async fn run_coalesced<F, Fut>(&self, request: CompileRequest, run: F) -> HostEvent
  where
    F: Fn(CompileRequest) -> Fut,
    Fut: Future<Output = HostEvent>,
  {
    let (tx, rx) = oneshot::channel();

    if self.running.get() {
      let mut pending = self.pending.borrow_mut();
      let waiters = match pending.take() {
        Some(old) => {
          let mut waiters = old.waiters;
          waiters.push(tx);
          waiters
        }
        None => vec![tx],
      };
      *pending = Some(PendingSlot { request, waiters });
      drop(pending);
      return rx.await.unwrap_or(HostEvent::Error {
        message: "compile request queue was dropped".into(),
        file_name: None,
      });
    }

    self.running.set(true);
    let mut current_request = request;
    let mut current_waiters = vec![tx];
    loop {
      let outcome = run(current_request).await;
      for waiter in current_waiters.drain(..) {
        let _ = waiter.send(outcome.clone());
      }
      let next = self.pending.borrow_mut().take();
      match next {
        Some(slot) => {
          current_request = slot.request;
          current_waiters = slot.waiters;
        }
        None => break,
      }
    }
    self.running.set(false);

    rx.await.unwrap_or(HostEvent::Error {
      message: "compile request queue was dropped".into(),
      file_name: None,
    })
  }
}

/// Orchestrates the graph manager end to end for one sandbox (§4.7).
pub struct BundlerService {
  pub graph: Graph,
  queue: RequestQueue,
}

impl BundlerService {
  pub fn new(graph: Graph) -> Self {
    Self {
      graph,
      queue: RequestQueue::new(),
    }
  }

  pub async fn compile(&self, request: CompileRequest) -> HostEvent {
    self
      .queue
      .run_coalesced(request, |request| self.run_once(request))
      .await
  }

  async fn run_once(&self, request: CompileRequest) -> HostEvent {
    match self.graph.downloader() {
      Some(downloader) => match downloader.load_dependencies(&request.dependencies).await {
        Ok((manifest, is_new_combination)) => {
          if is_new_combination {
            self.graph.invalidate_all();
          }
          self.graph.set_manifest(manifest);
        }
        Err(e) => {
          error!("failed to resolve dependency manifest: {e}");
          return HostEvent::Error {
            message: e,
            file_name: None,
          };
        }
      },
      // No downloader configured: a bare manifest is assumed already
      // resolved (e.g. embedding tests), so there is nothing to load.
      None if request.dependencies.is_empty() => {}
      None => {
        error!("compile request declares dependencies but no dependency loader is configured");
      }
    }
    self.graph.set_env_variables(request.env_variables);
    let mut externals = Externals::new();
    for (key, value) in request.external_resources {
      externals.insert(key, value);
    }
    self.graph.set_externals(externals);
    self.graph.update_data(request.modules);

    let entry = match self.graph.resolve_transpiled_module(&request.entry, "/") {
      Ok(id) => id,
      Err(e) => {
        error!("could not resolve entry '{}': {e}", request.entry);
        return HostEvent::Error {
          message: e.to_string(),
          file_name: Some(request.entry),
        };
      }
    };

    let event = match self.graph.transpile_modules(entry).await {
      Ok(()) => match self.graph.evaluate_module(entry) {
        Ok(EvalOutcome::Exports(_)) | Ok(EvalOutcome::Reload) => HostEvent::Success,
        Err(e) => {
          error!("evaluation failed: {e}");
          HostEvent::from_error(&e)
        }
      },
      Err(e) => {
        error!("transpile failed: {e}");
        HostEvent::from_error(&e)
      }
    };

    self.graph.save().await;
    event
  }
}

#[cfg(test)]
mod tests {
  use std::cell::Cell;

  use async_trait::async_trait;

  use super::*;
  use crate::collaborators::{DependencyLoader, LoaderSpec, Preset, Transpiler};
  use crate::graph::Graph;
  use crate::manifest::{DependencyManifest, ManifestEntry};

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

  /// Resolves `left-pad` and reports every call after the first as a new
  /// combination, so a test can assert the manager invalidates on it.
  struct CountingLoader {
    calls: Cell<u32>,
  }

  #[async_trait(?Send)]
  impl DependencyLoader for CountingLoader {
    async fn load_dependencies(
      &self,
      deps: &HashMap<String, String>,
    ) -> Result<(DependencyManifest, bool), String> {
      let call = self.calls.get();
      self.calls.set(call + 1);
      let mut manifest = DependencyManifest::default();
      for name in deps.keys() {
        manifest.entries.insert(
          name.clone(),
          ManifestEntry {
            name: name.clone(),
            version: "1.0.0".into(),
            main: "index.js".into(),
          },
        );
      }
      Ok((manifest, call > 0))
    }

    async fn download_dependency(
      &self,
      specifier: &str,
      from_path: &str,
    ) -> Result<ManifestEntry, String> {
      Err(format!("unexpected download of '{specifier}' from '{from_path}'"))
    }
  }

  fn service_with(downloader: CountingLoader) -> BundlerService {
    let mut transpilers: HashMap<String, Box<dyn Transpiler>> = HashMap::new();
    transpilers.insert("identity".into(), Box::new(IdentityTranspiler));
    let graph = Graph::new(
      "test-sandbox",
      Box::new(IdentityPreset),
      transpilers,
      Some(Box::new(downloader)),
      None,
      None,
    );
    BundlerService::new(graph)
  }

  fn request() -> CompileRequest {
    CompileRequest {
      sandbox_id: "test-sandbox".into(),
      modules: vec![Module::new("/index.js", "module.exports = 1;")],
      entry: "/index.js".into(),
      external_resources: HashMap::new(),
      dependencies: HashMap::new(),
      env_variables: HashMap::new(),
      has_actions: false,
      is_module_view: false,
      template: "node".into(),
    }
  }

  #[test]
  fn resolves_declared_dependencies_into_the_manifest() {
    let service = service_with(CountingLoader { calls: Cell::new(0) });
    let mut req = request();
    req.dependencies.insert("left-pad".into(), "^1.0.0".into());
    let event = futures::executor::block_on(service.compile(req));
    assert_eq!(event, HostEvent::Success);
  }

  #[test]
  fn a_new_combination_invalidates_existing_nodes() {
    let service = service_with(CountingLoader { calls: Cell::new(0) });
    futures::executor::block_on(service.compile(request()));
    assert!(service.graph.node_count() > 0);

    // The second compile reports `isNewCombination`, so every prior node
    // must be gone before the fresh entry is re-added.
    futures::executor::block_on(service.compile(request()));
    assert_eq!(service.graph.node_count(), 1);
  }
}
