// Copyright 2018-2026 the sandbox-bundler authors. MIT license.

//! The resolved external-dependency manifest and the externals map, as
//! consumed by the path resolver (§4.1) and the evaluator's `require`
//! closure (§4.3 step 4).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One entry of the resolved dependency manifest: enough for the path
/// resolver to answer "is this bare specifier known" without yet knowing
/// its contents (those live in the `Module`s the downloader adds to the
/// file set).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
  pub name: String,
  pub version: String,
  /// The entry file of the package, relative to its virtual root.
  pub main: String,
}

/// `manifest` on the `Manager`: external package name -> resolved entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyManifest {
  pub entries: HashMap<String, ManifestEntry>,
}

impl DependencyManifest {
  pub fn get(&self, name: &str) -> Option<&ManifestEntry> {
    self.entries.get(name)
  }
}

/// `externals` on the `Manager`: the subset of dependencies whose code is
/// injected by the host rather than transpiled in-graph (runtime helpers,
/// host APIs). Keyed by bare specifier.
#[derive(Debug, Clone, Default)]
pub struct Externals {
  exports: HashMap<String, serde_json::Value>,
}

impl Externals {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, specifier: impl Into<String>, value: serde_json::Value) {
    self.exports.insert(specifier.into(), value);
  }

  pub fn get(&self, specifier: &str) -> Option<&serde_json::Value> {
    self.exports.get(specifier)
  }

  pub fn contains(&self, specifier: &str) -> bool {
    self.exports.contains_key(specifier)
  }
}

/// Environment variables injected into `process.env` for every evaluation.
pub type EnvVariables = HashMap<String, String>;
