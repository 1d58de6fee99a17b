// Copyright 2018-2026 the sandbox-bundler authors. MIT license.

//! The evaluator (§4.5): compiles transpiled source text into an executable
//! unit and invokes it with an injected `require`, `module.hot` and
//! `process.env`, returning the unit's live export object. Built on
//! `boa_engine`, grounded on the module-loader captures pattern in
//! `boa_engine::module` (see `NativeFunction::from_copy_closure_with_captures`)
//! and on the `Trace`/`Finalize`-derive convention `boa_engine` uses for any
//! type a native closure captures that must participate in GC tracing.
//!
//! One `Context` is shared across an entire `evaluate_module` walk (owned by
//! `graph::Graph::evaluate_module`) rather than created per node: `boa_engine`
//! hands a native function its `context` as a call-time argument, so a
//! `require` closure invoked deep in a recursive call naturally observes the
//! same realm its caller is running in. That is what makes cyclic requires
//! (§8 S3) resolvable at all — a module still mid-execution can be found
//! in-progress and its live, partially populated `exports` object handed
//! back, instead of only ever seeing a frozen JSON snapshot from before the
//! cycle closed.

use boa_engine::{
  js_string, native_function::NativeFunction, property::Attribute, Context, JsError, JsObject,
  JsValue, Source,
};
use boa_gc::{Finalize, Trace};

use crate::error::EvalError;
use crate::manifest::EnvVariables;
use crate::node::NodeId;

/// Implemented by the graph so the evaluator's `require`/`module.hot` native
/// functions can recurse back into the graph's own evaluation walk and
/// bookkeeping without the evaluator owning a graph reference itself.
pub trait RequireHost {
  fn require(&self, context: &mut Context, from: NodeId, specifier: &str)
    -> Result<JsValue, EvalError>;
  fn self_accept(&self, from: NodeId);
  /// `accept(path, callback)`: `path` is resolved relative to `from` to the
  /// target transpiled module, which is then marked HMR-accepting with
  /// `callback`.
  fn accept(&self, from: NodeId, path: &str, callback: JsValue);
}

/// A raw pointer wrapper so the host reference can ride along inside a
/// `NativeFunction` capture, which requires `Trace + Finalize` (boa tracing
/// contract) but never actually holds GC-managed data here.
#[derive(Clone, Copy, Trace, Finalize)]
struct HostPtr(#[unsafe_ignore_trace] *const dyn RequireHost);

/// Invokes `compiled_code` as a CommonJS-shaped unit:
/// `(function(module, exports, require, process) { <code> })`, within the
/// caller's shared `context`. Returns the live `exports` value (a `JsValue`,
/// typically an object) rather than a JSON snapshot, so a caller further up
/// a cyclic require chain can keep holding a handle to it.
pub fn evaluate_linked(
  context: &mut Context,
  compiled_code: &str,
  node_id: NodeId,
  host: &dyn RequireHost,
  env: &EnvVariables,
) -> Result<JsValue, EvalError> {
  let captures = (node_id, HostPtr(host as *const dyn RequireHost));

  let require_fn = NativeFunction::from_copy_closure_with_captures(
    move |_this, args, captures: &(NodeId, HostPtr), context| {
      let specifier = args
        .get(0)
        .and_then(|v| v.as_string())
        .map(|s| s.to_std_string_escaped())
        .unwrap_or_default();
      // SAFETY: `host` outlives this `Context`, which does not escape
      // `evaluate_module`'s call tree on the graph.
      let host = unsafe { &*captures.1 .0 };
      host
        .require(context, captures.0, &specifier)
        .map_err(|e| JsError::from_opaque(JsValue::from(js_string!(e.to_string()))))
    },
    captures,
  );
  let require_obj = boa_engine::object::FunctionObjectBuilder::new(&mut *context, require_fn)
    .name("require")
    .length(1)
    .build();

  let module_obj = JsObject::with_object_proto(context.intrinsics());
  let exports_obj = JsObject::with_object_proto(context.intrinsics());
  module_obj
    .set(js_string!("exports"), exports_obj.clone(), false, context)
    .map_err(|e| runtime_error(e, node_id))?;
  module_obj
    .set(js_string!("hot"), build_hot_api(context, node_id, host), false, context)
    .map_err(|e| runtime_error(e, node_id))?;

  let process_obj = JsObject::with_object_proto(context.intrinsics());
  let env_obj = JsObject::with_object_proto(context.intrinsics());
  for (key, value) in env.iter() {
    env_obj
      .set(js_string!(key.clone()), js_string!(value.clone()), false, context)
      .map_err(|e| runtime_error(e, node_id))?;
  }
  process_obj
    .set(js_string!("env"), env_obj, false, context)
    .map_err(|e| runtime_error(e, node_id))?;

  context
    .register_global_property(js_string!("__sandboxRequire"), require_obj, Attribute::all())
    .map_err(|e| runtime_error(e, node_id))?;
  context
    .register_global_property(
      js_string!("__sandboxModule"),
      module_obj.clone(),
      Attribute::all(),
    )
    .map_err(|e| runtime_error(e, node_id))?;
  context
    .register_global_property(js_string!("__sandboxExports"), exports_obj, Attribute::all())
    .map_err(|e| runtime_error(e, node_id))?;
  context
    .register_global_property(js_string!("__sandboxProcess"), process_obj, Attribute::all())
    .map_err(|e| runtime_error(e, node_id))?;

  let wrapped = format!(
    "(function(module, exports, require, process) {{\n{compiled_code}\n}})(__sandboxModule, __sandboxExports, __sandboxRequire, __sandboxProcess);"
  );

  context
    .eval(Source::from_bytes(&wrapped))
    .map_err(|e| runtime_error(e, node_id))?;

  module_obj
    .get(js_string!("exports"), context)
    .map_err(|e| runtime_error(e, node_id))
}

/// Builds `module.hot`: `{ accept(path?, callback?) }` (§4.3 step 3). Calling
/// `accept()` with no arguments, or with a single callable argument, marks
/// the current node as self-accepting (the callback is not retained in that
/// form — self-accept carries no callback, see `node::HmrState`). Calling it
/// with a path marks the *specified* module HMR-accepting, with the second
/// argument as its callback; the graph resolves that path to a `NodeId`
/// relative to the currently evaluating module before calling back into
/// [`RequireHost::accept`].
fn build_hot_api(context: &mut Context, node_id: NodeId, host: &dyn RequireHost) -> JsObject {
  let captures = (node_id, HostPtr(host as *const dyn RequireHost));
  let accept_fn = NativeFunction::from_copy_closure_with_captures(
    move |_this, args, captures: &(NodeId, HostPtr), _context| {
      let host = unsafe { &*captures.1 .0 };
      match args.first() {
        None => {
          host.self_accept(captures.0);
        }
        Some(JsValue::Object(obj)) if obj.is_callable() && args.len() == 1 => {
          host.self_accept(captures.0);
        }
        Some(path) => {
          let path = path
            .as_string()
            .map(|s| s.to_std_string_escaped())
            .unwrap_or_default();
          let callback = args.get(1).cloned().unwrap_or_else(JsValue::undefined);
          host.accept(captures.0, &path, callback);
        }
      }
      Ok(JsValue::undefined())
    },
    captures,
  );
  let accept_obj = boa_engine::object::FunctionObjectBuilder::new(&mut *context, accept_fn)
    .name("accept")
    .length(2)
    .build();

  let hot_obj = JsObject::with_object_proto(context.intrinsics());
  let _ = hot_obj.set(js_string!("accept"), accept_obj, false, context);
  hot_obj
}

fn runtime_error(err: JsError, node_id: NodeId) -> EvalError {
  EvalError::Runtime {
    message: err.to_string(),
    t_module: Some(node_id),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::cell::RefCell;
  use std::collections::HashMap;

  struct StubHost {
    answers: RefCell<HashMap<String, serde_json::Value>>,
  }

  impl RequireHost for StubHost {
    fn require(
      &self,
      context: &mut Context,
      _from: NodeId,
      specifier: &str,
    ) -> Result<JsValue, EvalError> {
      let value = self
        .answers
        .borrow()
        .get(specifier)
        .cloned()
        .ok_or_else(|| EvalError::RequireResolution {
          specifier: specifier.to_string(),
          from_path: "/a.js".into(),
          source: crate::error::ResolveError::ModuleNotFound {
            specifier: specifier.to_string(),
            from_path: "/a.js".into(),
            is_dependency: false,
          },
        })?;
      JsValue::from_json(&value, context).map_err(|e| EvalError::Runtime {
        message: e.to_string(),
        t_module: None,
      })
    }

    fn self_accept(&self, _from: NodeId) {}
    fn accept(&self, _from: NodeId, _path: &str, _callback: JsValue) {}
  }

  #[test]
  fn simple_arithmetic_export() {
    let host = StubHost {
      answers: RefCell::new(HashMap::new()),
    };
    let env = EnvVariables::new();
    let mut context = Context::default();
    let exports =
      evaluate_linked(&mut context, "module.exports = 1 + 2;", NodeId(0), &host, &env).unwrap();
    assert_eq!(exports.to_json(&mut context).unwrap(), serde_json::json!(3));
  }

  #[test]
  fn linked_require_multiplies_dependency_export() {
    let mut answers = HashMap::new();
    answers.insert("./b".to_string(), serde_json::json!({"x": 21}));
    let host = StubHost {
      answers: RefCell::new(answers),
    };
    let env = EnvVariables::new();
    let mut context = Context::default();
    let exports = evaluate_linked(
      &mut context,
      "module.exports = require('./b').x * 2;",
      NodeId(0),
      &host,
      &env,
    )
    .unwrap();
    assert_eq!(exports.to_json(&mut context).unwrap(), serde_json::json!(42));
  }

  #[test]
  fn self_accept_with_no_arguments_is_recorded() {
    use std::cell::Cell;

    struct RecordingHost {
      accepted: Cell<bool>,
    }
    impl RequireHost for RecordingHost {
      fn require(
        &self,
        _context: &mut Context,
        _from: NodeId,
        specifier: &str,
      ) -> Result<JsValue, EvalError> {
        Err(EvalError::RequireResolution {
          specifier: specifier.to_string(),
          from_path: "/a.js".into(),
          source: crate::error::ResolveError::ModuleNotFound {
            specifier: specifier.to_string(),
            from_path: "/a.js".into(),
            is_dependency: false,
          },
        })
      }
      fn self_accept(&self, _from: NodeId) {
        self.accepted.set(true);
      }
      fn accept(&self, _from: NodeId, _path: &str, _callback: JsValue) {}
    }

    let host = RecordingHost {
      accepted: Cell::new(false),
    };
    let env = EnvVariables::new();
    let mut context = Context::default();
    evaluate_linked(&mut context, "module.hot.accept();", NodeId(0), &host, &env).unwrap();
    assert!(host.accepted.get());
  }
}
