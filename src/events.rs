// Copyright 2018-2026 the sandbox-bundler authors. MIT license.

//! The host event channel (§6): the typed outcomes a compile request
//! reports back across the wasm boundary. Grounded on the teacher's
//! `ModuleGraphError`-to-diagnostic mapping in `cli/graph_util.rs`, adapted
//! to the small, fixed event vocabulary this sandbox runtime's host side
//! expects (`resize`, `success`, `error`).

use serde::Serialize;

use crate::error::BundlerError;

/// One event emitted to the host document after a compile request settles.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostEvent {
  /// The iframe/canvas the sandbox renders into should resize.
  Resize { width: u32, height: u32 },
  /// The entry evaluated cleanly.
  Success,
  /// The entry failed to transpile or evaluate.
  Error {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_name: Option<String>,
  },
}

impl HostEvent {
  /// Builds the `error` event directly from a [`BundlerError`], without
  /// mutating a shared dynamic object the way the distilled source's
  /// `e.module = e.module` duplicate assignment implied.
  pub fn from_error(err: &BundlerError) -> Self {
    HostEvent::Error {
      message: err.to_string(),
      file_name: err.file_name().map(str::to_string),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::{EvalError, ResolveError};

  #[test]
  fn error_event_carries_file_name_when_known() {
    let err = BundlerError::Eval(EvalError::RequireResolution {
      specifier: "./missing".into(),
      from_path: "/a.js".into(),
      source: ResolveError::ModuleNotFound {
        specifier: "./missing".into(),
        from_path: "/a.js".into(),
        is_dependency: false,
      },
    });
    match HostEvent::from_error(&err) {
      HostEvent::Error { file_name, .. } => assert_eq!(file_name.as_deref(), Some("/a.js")),
      _ => panic!("expected an error event"),
    }
  }
}
