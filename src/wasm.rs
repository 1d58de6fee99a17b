// Copyright 2018-2026 the sandbox-bundler authors. MIT license.

//! The wasm boundary (§4.7 item 8, ambient): `wasm-bindgen` exports that
//! adapt a `JsValue` compile request into a [`CompileRequest`], drive one
//! [`BundlerService`] per sandbox, and hand host events back across the
//! boundary as plain JS objects. Grounded on the dependency stack of
//! `data-bridge-sheet-wasm` (`wasm-bindgen`, `serde-wasm-bindgen`,
//! `console_error_panic_hook`, `web-sys`), since that crate is this pack's
//! only wasm-bindgen example and its own source was not retrieved; the
//! shape below follows `wasm-bindgen`'s own documented idiom (`#[wasm_bindgen]`
//! over a struct wrapping the Rust-side state, JSON in/out via
//! `serde-wasm-bindgen`) rather than any one file.

use wasm_bindgen::prelude::*;

use crate::collaborators::{DependencyLoader, DiagnosticsSink, Storage};
use crate::events::HostEvent;
use crate::graph::Graph;
use crate::presets::{built_in_transpilers, StaticPreset};
use crate::request::{BundlerService, CompileRequest};

/// Installs `console_error_panic_hook` and routes the `log` facade to the
/// browser console. Call once from the host's module-init glue, before any
/// [`Sandbox`] is constructed.
#[wasm_bindgen(start)]
pub fn init() {
  console_error_panic_hook::set_once();
  let _ = console_log::init_with_level(log::Level::Debug);
}

/// One sandbox's bundler, exposed to JavaScript. Wraps a [`BundlerService`]
/// built from the built-in preset/transpiler set (§"Out of scope": richer
/// transformers are injected through the `Transpiler` trait from native
/// Rust code, not from across this boundary, since `wasm-bindgen` cannot
/// hand a JS closure through as a trait object safely).
#[wasm_bindgen]
pub struct Sandbox {
  service: BundlerService,
}

#[wasm_bindgen]
impl Sandbox {
  #[wasm_bindgen(constructor)]
  pub fn new(sandbox_id: String) -> Sandbox {
    let graph = Graph::new(
      sandbox_id,
      Box::new(StaticPreset::built_in()),
      built_in_transpilers(),
      Some(Box::new(NoDependencies)),
      None,
      None,
    );
    Sandbox {
      service: BundlerService::new(graph),
    }
  }

  /// Runs one compile request end to end (§4.7) and returns the resulting
  /// host event as a JS object (`{ type: "success" | "error" | "resize", ... }`).
  #[wasm_bindgen(js_name = compile)]
  pub async fn compile(&self, request: JsValue) -> Result<JsValue, JsValue> {
    let request: CompileRequest = serde_wasm_bindgen::from_value(request)
      .map_err(|e| JsValue::from_str(&format!("invalid compile request: {e}")))?;
    let event = self.service.compile(request).await;
    host_event_to_js(&event)
  }

  /// Best-effort restore of a prior compile's graph cache (§4.4 `load`).
  #[wasm_bindgen(js_name = restore)]
  pub async fn restore(&self) {
    self.service.graph.load().await;
  }

  #[wasm_bindgen(js_name = clearCache)]
  pub async fn clear_cache(&self) {
    self.service.graph.clear_cache().await;
  }
}

fn host_event_to_js(event: &HostEvent) -> Result<JsValue, JsValue> {
  serde_wasm_bindgen::to_value(event).map_err(|e| JsValue::from_str(&e.to_string()))
}

/// A `Storage` backed by `window.localStorage`, the simplest host-provided
/// persistence a browser build can assume without further host wiring.
pub struct LocalStorageBackend;

#[async_trait::async_trait(?Send)]
impl Storage for LocalStorageBackend {
  async fn save(&self, sandbox_id: &str, blob: Vec<u8>) -> Result<(), String> {
    let window = web_sys::window().ok_or("no global window")?;
    let storage = window
      .local_storage()
      .map_err(|_| "localStorage unavailable")?
      .ok_or("localStorage unavailable")?;
    let encoded = String::from_utf8(blob).map_err(|e| e.to_string())?;
    storage
      .set_item(&format!("sandbox-bundler:{sandbox_id}"), &encoded)
      .map_err(|_| "localStorage.setItem failed".to_string())
  }

  async fn load(&self, sandbox_id: &str) -> Result<Option<Vec<u8>>, String> {
    let window = web_sys::window().ok_or("no global window")?;
    let storage = window
      .local_storage()
      .map_err(|_| "localStorage unavailable")?
      .ok_or("localStorage unavailable")?;
    let item = storage
      .get_item(&format!("sandbox-bundler:{sandbox_id}"))
      .map_err(|_| "localStorage.getItem failed".to_string())?;
    Ok(item.map(String::into_bytes))
  }

  async fn clear(&self, sandbox_id: &str) -> Result<(), String> {
    let window = web_sys::window().ok_or("no global window")?;
    let storage = window
      .local_storage()
      .map_err(|_| "localStorage unavailable")?
      .ok_or("localStorage unavailable")?;
    storage
      .remove_item(&format!("sandbox-bundler:{sandbox_id}"))
      .map_err(|_| "localStorage.removeItem failed".to_string())
  }
}

/// A no-op dependency loader for hosts that never resolve external
/// packages; `download_dependency` always fails, matching the resolver's
/// existing "no manifest entry" failure path so unresolved bare specifiers
/// surface through the ordinary error event rather than hanging.
pub struct NoDependencies;

#[async_trait::async_trait(?Send)]
impl DependencyLoader for NoDependencies {
  async fn load_dependencies(
    &self,
    _deps: &std::collections::HashMap<String, String>,
  ) -> Result<(crate::manifest::DependencyManifest, bool), String> {
    Ok((crate::manifest::DependencyManifest::default(), false))
  }

  async fn download_dependency(
    &self,
    specifier: &str,
    from_path: &str,
  ) -> Result<crate::manifest::ManifestEntry, String> {
    Err(format!(
      "no dependency downloader configured: cannot resolve '{specifier}' from '{from_path}'"
    ))
  }
}

/// A diagnostics sink that forwards to the `log` facade; the error-overlay
/// and status UI consuming these are out of scope (design notes).
pub struct LogDiagnostics;

impl DiagnosticsSink for LogDiagnostics {
  fn show_warning(&self, message: &str, node: crate::node::NodeId, file_name: &str) {
    log::warn!("[{file_name}] (node {}) {message}", node.0);
  }
}
