// Copyright 2018-2026 the sandbox-bundler authors. MIT license.

//! Error types for the module graph, loader chain, path resolver and
//! evaluator, converging on [`BundlerError`] at the crate boundary.

use thiserror::Error;

use crate::node::NodeId;

/// Errors raised while resolving an import specifier to a module.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
  #[error("Cannot find module '{specifier}' from '{from_path}'")]
  ModuleNotFound {
    specifier: String,
    from_path: String,
    /// Set when the specifier looked like a bare package name, signalling
    /// the caller to attempt an async download instead of failing outright.
    is_dependency: bool,
  },
  #[error("Cannot resolve alias target '{alias}' for specifier '{specifier}'")]
  InvalidAlias { specifier: String, alias: String },
}

impl ResolveError {
  pub fn is_dependency(&self) -> bool {
    matches!(
      self,
      ResolveError::ModuleNotFound {
        is_dependency: true,
        ..
      }
    )
  }
}

/// Errors raised while running a transformer inside the loader chain.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct LoaderError {
  pub message: String,
  pub file_name: String,
  pub line: Option<u32>,
  pub column: Option<u32>,
}

/// Errors raised while evaluating a transpiled module.
#[derive(Debug, Clone, Error)]
pub enum EvalError {
  #[error("Cannot import self: '{0}'")]
  SelfImport(String),
  #[error("{message}")]
  Runtime {
    message: String,
    t_module: Option<NodeId>,
  },
  #[error("require could not resolve '{specifier}' from '{from_path}'")]
  RequireResolution {
    specifier: String,
    from_path: String,
    #[source]
    source: ResolveError,
  },
}

/// Errors raised while manipulating the module graph itself.
#[derive(Debug, Clone, Error)]
pub enum GraphError {
  #[error("No transpiled module found for node {0:?}")]
  MissingNode(NodeId),
  #[error("Entry module '{0}' is not present in the current file set")]
  MissingEntry(String),
  #[error("Cannot restore malformed serialized graph: {0}")]
  Corrupt(String),
}

/// The crate-wide error boundary, mirroring the teacher's `AnyError` role at
/// the edge of `cli/lib.rs`: every component error converts into this one so
/// request handling only needs to match on a single type.
#[derive(Debug, Clone, Error)]
pub enum BundlerError {
  #[error(transparent)]
  Resolve(#[from] ResolveError),
  #[error(transparent)]
  Loader(#[from] LoaderError),
  #[error(transparent)]
  Eval(#[from] EvalError),
  #[error(transparent)]
  Graph(#[from] GraphError),
}

impl BundlerError {
  /// The `fileName` to attach to a host-facing `error` event, when known.
  pub fn file_name(&self) -> Option<&str> {
    match self {
      BundlerError::Loader(e) => Some(&e.file_name),
      BundlerError::Eval(EvalError::RequireResolution { from_path, .. }) => {
        Some(from_path)
      }
      _ => None,
    }
  }
}
