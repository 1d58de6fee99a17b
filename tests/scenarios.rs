// Copyright 2018-2026 the sandbox-bundler authors. MIT license.

//! End-to-end scenarios S1-S6, exercising the graph manager the way a real
//! compile request would rather than unit-testing individual components.

use std::collections::HashMap;

use sandbox_bundler::collaborators::DependencyLoader;
use sandbox_bundler::graph::{EvalOutcome, Graph};
use sandbox_bundler::manifest::ManifestEntry;
use sandbox_bundler::module::Module;
use sandbox_bundler::presets::{built_in_transpilers, StaticPreset};

fn test_graph() -> Graph {
  Graph::new(
    "scenario-sandbox",
    Box::new(StaticPreset::built_in()),
    built_in_transpilers(),
    None,
    None,
    None,
  )
}

fn test_graph_with_downloader(downloader: Box<dyn DependencyLoader>) -> Graph {
  Graph::new(
    "scenario-sandbox",
    Box::new(StaticPreset::built_in()),
    built_in_transpilers(),
    Some(downloader),
    None,
    None,
  )
}

#[test]
fn s1_single_file_evaluation() {
  let graph = test_graph();
  graph.update_data(vec![Module::new("/index.js", "module.exports = 1 + 2")]);
  let entry = graph.resolve_transpiled_module("/index.js", "/").unwrap();
  futures::executor::block_on(graph.transpile_modules(entry)).unwrap();
  match graph.evaluate_module(entry).unwrap() {
    EvalOutcome::Exports(v) => assert_eq!(v, serde_json::json!(3)),
    EvalOutcome::Reload => panic!("S1 should not request a reload"),
  }
}

#[test]
fn s2_two_file_linkage() {
  let graph = test_graph();
  graph.update_data(vec![
    Module::new("/a.js", "module.exports = require('./b').x * 2"),
    Module::new("/b.js", "exports.x = 21"),
  ]);
  let entry = graph.resolve_transpiled_module("/a.js", "/").unwrap();
  futures::executor::block_on(graph.transpile_modules(entry)).unwrap();
  match graph.evaluate_module(entry).unwrap() {
    EvalOutcome::Exports(v) => assert_eq!(v, serde_json::json!(42)),
    EvalOutcome::Reload => panic!("S2 should not request a reload"),
  }

  let b = graph.resolve_transpiled_module("./b", "/a.js").unwrap();
  assert!(graph.has_dependency(entry, b));
  assert!(graph.has_initiator(b, entry));
  assert!(graph.has_source(entry));
  assert!(graph.has_source(b));
  assert!(graph.has_compilation(entry));
  assert!(graph.has_compilation(b));
}

#[test]
fn s3_cycle_tolerance() {
  let graph = test_graph();
  graph.update_data(vec![
    Module::new("/a.js", "exports.a=1; exports.b=require('./b').b;"),
    Module::new("/b.js", "exports.b=2; exports.a=require('./a').a;"),
  ]);
  let entry = graph.resolve_transpiled_module("/a.js", "/").unwrap();
  futures::executor::block_on(graph.transpile_modules(entry)).unwrap();
  match graph.evaluate_module(entry).unwrap() {
    EvalOutcome::Exports(v) => assert_eq!(v.get("b"), Some(&serde_json::json!(2))),
    EvalOutcome::Reload => panic!("S3 should not request a reload"),
  }
}

#[test]
fn s4_edit_invalidation() {
  let graph = test_graph();
  graph.update_data(vec![
    Module::new("/a.js", "module.exports = require('./b').x * 2"),
    Module::new("/b.js", "exports.x = 21"),
  ]);
  let entry = graph.resolve_transpiled_module("/a.js", "/").unwrap();
  futures::executor::block_on(graph.transpile_modules(entry)).unwrap();
  graph.evaluate_module(entry).unwrap();

  let b = graph.resolve_transpiled_module("./b", "/a.js").unwrap();
  graph.update_data(vec![
    Module::new("/a.js", "module.exports = require('./b').x * 2"),
    Module::new("/b.js", "exports.x = 10"),
  ]);

  assert!(!graph.has_source(b));
  assert!(!graph.has_compilation(entry));

  futures::executor::block_on(graph.transpile_modules(entry)).unwrap();
  match graph.evaluate_module(entry).unwrap() {
    EvalOutcome::Exports(v) => assert_eq!(v, serde_json::json!(20)),
    EvalOutcome::Reload => panic!("S4 should not request a reload"),
  }
}

#[test]
fn s5_hmr_accept_reruns_only_the_entry() {
  let graph = test_graph();
  graph.update_data(vec![
    Module::new(
      "/a.js",
      "module.hot.accept(); module.exports = require('./b').x * 2;",
    ),
    Module::new("/b.js", "exports.x = 21"),
  ]);
  let entry = graph.resolve_transpiled_module("/a.js", "/").unwrap();
  futures::executor::block_on(graph.transpile_modules(entry)).unwrap();
  match graph.evaluate_module(entry).unwrap() {
    EvalOutcome::Exports(v) => assert_eq!(v, serde_json::json!(42)),
    EvalOutcome::Reload => panic!("entry self-accepts, should never reload"),
  }
  assert!(graph.webpack_hmr());

  graph.update_data(vec![
    Module::new(
      "/a.js",
      "module.hot.accept(); module.exports = require('./b').x * 2;",
    ),
    Module::new("/b.js", "exports.x = 10"),
  ]);

  assert!(graph.has_changed(entry));
  assert!(graph.has_source(entry), "the entry itself was not edited, only its dependency");

  let b = graph.resolve_transpiled_module("./b", "/a.js").unwrap();
  assert!(!graph.has_source(b), "the edited dependency must be re-transpiled");

  futures::executor::block_on(graph.transpile_modules(entry)).unwrap();
  match graph.evaluate_module(entry).unwrap() {
    EvalOutcome::Exports(v) => assert_eq!(v, serde_json::json!(20)),
    EvalOutcome::Reload => panic!("location.reload must not trigger for a self-accepting entry"),
  }
}

struct RecoveringDownloader;

#[async_trait::async_trait(?Send)]
impl DependencyLoader for RecoveringDownloader {
  async fn load_dependencies(
    &self,
    _deps: &HashMap<String, String>,
  ) -> Result<(sandbox_bundler::manifest::DependencyManifest, bool), String> {
    Ok((sandbox_bundler::manifest::DependencyManifest::default(), false))
  }

  async fn download_dependency(
    &self,
    specifier: &str,
    from_path: &str,
  ) -> Result<ManifestEntry, String> {
    assert_eq!(specifier, "missing-pkg");
    assert_eq!(from_path, "/a.js");
    Ok(ManifestEntry {
      name: "missing-pkg".into(),
      version: "1.0.0".into(),
      main: "index.js".into(),
    })
  }
}

#[test]
fn s6_async_dependency_recovery() {
  let graph = test_graph_with_downloader(Box::new(RecoveringDownloader));
  graph.update_data(vec![
    Module::new("/a.js", "module.exports = require('missing-pkg').value;"),
    Module::new("/node_modules/missing-pkg/index.js", "exports.value = 7;"),
  ]);
  let entry = graph.resolve_transpiled_module("/a.js", "/").unwrap();
  futures::executor::block_on(graph.transpile_modules(entry)).unwrap();
  match graph.evaluate_module(entry).unwrap() {
    EvalOutcome::Exports(v) => assert_eq!(v, serde_json::json!(7)),
    EvalOutcome::Reload => panic!("S6 should not request a reload"),
  }
}

struct RejectingDownloader;

#[async_trait::async_trait(?Send)]
impl DependencyLoader for RejectingDownloader {
  async fn load_dependencies(
    &self,
    _deps: &HashMap<String, String>,
  ) -> Result<(sandbox_bundler::manifest::DependencyManifest, bool), String> {
    Ok((sandbox_bundler::manifest::DependencyManifest::default(), false))
  }

  async fn download_dependency(
    &self,
    specifier: &str,
    _from_path: &str,
  ) -> Result<ManifestEntry, String> {
    Err(format!("no such package: {specifier}"))
  }
}

#[test]
fn s6_async_dependency_rejection_surfaces_at_evaluation() {
  let graph = test_graph_with_downloader(Box::new(RejectingDownloader));
  graph.update_data(vec![Module::new(
    "/a.js",
    "module.exports = require('missing-pkg').value;",
  )]);
  let entry = graph.resolve_transpiled_module("/a.js", "/").unwrap();
  futures::executor::block_on(graph.transpile_modules(entry)).unwrap();
  let err = graph.evaluate_module(entry).unwrap_err();
  assert_eq!(err.file_name(), Some("/a.js"));
}
