// Copyright 2018-2026 the sandbox-bundler authors. MIT license.

//! The immutable input data model: [`Module`] and the loader-chain output
//! [`ModuleSource`]. Grounded on the teacher's split between
//! `specifier_handler::CachedModule` (raw fetched source) and
//! `ModuleSource` emitted by `deno_core` after transpilation.

use serde::{Deserialize, Serialize};

/// An immutable input source file, as handed to the manager in a compile
/// request. `path` is always an absolute, slash-separated virtual path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
  pub path: String,
  pub code: String,
  /// An authoritative precomputed dependency list. When present, the
  /// loader-chain runner skips transformation entirely and registers these
  /// as dependencies directly (see `loader::run_chain`).
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub requires: Option<Vec<String>>,
}

impl Module {
  pub fn new(path: impl Into<String>, code: impl Into<String>) -> Self {
    Self {
      path: path.into(),
      code: code.into(),
      requires: None,
    }
  }

  pub fn directory(&self) -> &str {
    match self.path.rfind('/') {
      Some(0) => "/",
      Some(idx) => &self.path[..idx],
      None => "/",
    }
  }
}

/// The post-transform output of one loader-chain run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSource {
  pub file_name: String,
  pub compiled_code: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub source_map: Option<String>,
}

impl ModuleSource {
  /// Appends a `//# sourceURL=...` trailer so browser devtools (and, here,
  /// `boa_engine`'s error frames) attribute the evaluated code to its
  /// virtual path rather than an anonymous `eval` blob.
  pub fn with_source_url(
    origin: &str,
    path: &str,
    compiled_code: String,
  ) -> String {
    format!("{compiled_code}\n//# sourceURL={origin}{path}")
  }
}

/// A single diagnostic produced during transpile: a warning or an error,
/// carrying the originating file and, when known, a source location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
  pub message: String,
  pub file_name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub line: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub column: Option<u32>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn directory_of_nested_path() {
    let m = Module::new("/src/components/App.js", "");
    assert_eq!(m.directory(), "/src/components");
  }

  #[test]
  fn directory_of_root_path() {
    let m = Module::new("/index.js", "");
    assert_eq!(m.directory(), "/");
  }

  #[test]
  fn source_url_trailer_is_appended() {
    let out =
      ModuleSource::with_source_url("sandbox://", "/a.js", "1+1".into());
    assert_eq!(out, "1+1\n//# sourceURL=sandbox:///a.js");
  }
}
