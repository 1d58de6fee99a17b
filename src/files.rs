// Copyright 2018-2026 the sandbox-bundler authors. MIT license.

//! The in-memory file set: the `modules[]` the manager currently knows
//! about, keyed by absolute path. Grounded on the teacher's
//! `GraphData`/`HashMap<ModuleSpecifier, ModuleEntry>` indexing in
//! `cli/graph_util.rs`, simplified to the single-workspace, no-redirects
//! case this sandbox runtime needs.

use indexmap::IndexMap;

use crate::module::Module;

/// `IndexMap` rather than `HashMap` so `iter()`/`paths()` walk files in the
/// order the host handed them in, matching the `modules[]` ordering the
/// manager's own data model documents (§3) and giving `serialize.rs` a
/// deterministic byte-for-byte output across otherwise-identical requests.
#[derive(Debug, Clone, Default)]
pub struct FileSet {
  by_path: IndexMap<String, Module>,
}

impl FileSet {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn from_modules(modules: Vec<Module>) -> Self {
    let mut set = Self::new();
    for module in modules {
      set.insert(module);
    }
    set
  }

  pub fn insert(&mut self, module: Module) {
    self.by_path.insert(module.path.clone(), module);
  }

  pub fn get(&self, path: &str) -> Option<&Module> {
    self.by_path.get(path)
  }

  pub fn contains(&self, path: &str) -> bool {
    self.by_path.contains_key(path)
  }

  pub fn remove(&mut self, path: &str) -> Option<Module> {
    self.by_path.shift_remove(path)
  }

  pub fn paths(&self) -> impl Iterator<Item = &str> {
    self.by_path.keys().map(String::as_str)
  }

  pub fn iter(&self) -> impl Iterator<Item = &Module> {
    self.by_path.values()
  }

  pub fn in_directory<'a>(&'a self, dir: &'a str) -> impl Iterator<Item = &'a Module> {
    let prefix = if dir.ends_with('/') {
      dir.to_string()
    } else {
      format!("{dir}/")
    };
    self
      .by_path
      .values()
      .filter(move |m| m.path.starts_with(&prefix))
  }
}
