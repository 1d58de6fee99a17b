// Copyright 2018-2026 the sandbox-bundler authors. MIT license.

//! The built-in collaborator set named as in-scope scaffolding by the
//! design notes: a small `Preset` driven by a table of extension matches,
//! plus identity/JSON/CSS-passthrough transformers, enough to exercise the
//! loader-chain pipeline without a richer transformer injected through the
//! [`Transpiler`] trait. Grounded on the teacher's own built-in media-type
//! table in `cli/util/path.rs` (`MediaType::from_path`), adapted to a
//! glob-ish extension match since this crate's "media type" is just "which
//! transpiler(s) apply".

use std::collections::HashMap;

use crate::collaborators::{LoaderSpec, Preset, Transpiler};
use crate::error::LoaderError;
use crate::loader::LoaderContext;
use crate::module::Module;

/// One `(extension, transpiler name)` rule, tried in order; the first match
/// wins, mirroring `cli/util/path.rs`'s extension-ordered dispatch.
pub struct ExtensionRule {
  pub extension: &'static str,
  pub transpiler: &'static str,
}

/// A `Preset` whose loader chain is a static extension→transpiler table.
/// Aliases are a flat lookup table (`packagePath -> target`), applied once
/// per [`Preset::get_aliased_path`] call.
pub struct StaticPreset {
  rules: Vec<ExtensionRule>,
  aliases: HashMap<String, String>,
}

impl StaticPreset {
  pub fn new(rules: Vec<ExtensionRule>) -> Self {
    Self {
      rules,
      aliases: HashMap::new(),
    }
  }

  /// The identity/JSON/CSS passthrough preset named in the design notes'
  /// "Out of scope" section as the crate's shipped built-in set.
  pub fn built_in() -> Self {
    Self::new(vec![
      ExtensionRule {
        extension: ".json",
        transpiler: "json",
      },
      ExtensionRule {
        extension: ".css",
        transpiler: "css",
      },
      ExtensionRule {
        extension: ".js",
        transpiler: "identity",
      },
      ExtensionRule {
        extension: ".mjs",
        transpiler: "identity",
      },
      ExtensionRule {
        extension: ".jsx",
        transpiler: "identity",
      },
    ])
  }

  pub fn with_alias(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
    self.aliases.insert(from.into(), to.into());
    self
  }
}

impl Preset for StaticPreset {
  fn get_loaders(&self, module: &Module, _query: &str) -> Vec<LoaderSpec> {
    for rule in &self.rules {
      if module.path.ends_with(rule.extension) {
        return vec![LoaderSpec {
          transpiler: rule.transpiler.to_string(),
          options: HashMap::new(),
          cacheable: true,
        }];
      }
    }
    vec![LoaderSpec {
      transpiler: "identity".to_string(),
      options: HashMap::new(),
      cacheable: true,
    }]
  }

  fn get_aliased_path(&self, specifier: &str) -> String {
    self
      .aliases
      .get(specifier)
      .cloned()
      .unwrap_or_else(|| specifier.to_string())
  }
}

/// Passes source text through unchanged; the default for `.js`/`.mjs`/`.jsx`
/// files, and the fallback when no rule matches.
pub struct IdentityTranspiler;

impl Transpiler for IdentityTranspiler {
  fn name(&self) -> &str {
    "identity"
  }

  fn transpile(
    &self,
    code: &str,
    _ctx: &mut LoaderContext,
  ) -> Result<(String, Option<String>), LoaderError> {
    Ok((code.to_string(), None))
  }
}

/// Wraps a `.json` file's raw text as a `module.exports = <parsed>;`
/// assignment, validating it parses as JSON first.
pub struct JsonTranspiler;

impl Transpiler for JsonTranspiler {
  fn name(&self) -> &str {
    "json"
  }

  fn transpile(
    &self,
    code: &str,
    ctx: &mut LoaderContext,
  ) -> Result<(String, Option<String>), LoaderError> {
    if let Err(e) = serde_json::from_str::<serde_json::Value>(code) {
      return Err(LoaderError {
        message: format!("invalid JSON: {e}"),
        file_name: ctx.path.clone(),
        line: None,
        column: None,
      });
    }
    Ok((format!("module.exports = {code};"), None))
  }
}

/// Turns CSS text into a unit that injects a `<style>` tag into the host
/// document and exports nothing, the minimal style-loader shape the design
/// notes call out as "enough to run the built-in transformers". Emits the
/// raw CSS as an auxiliary asset so a host-side `emittedAssets` consumer can
/// also retrieve it directly.
pub struct CssTranspiler;

impl Transpiler for CssTranspiler {
  fn name(&self) -> &str {
    "css"
  }

  fn transpile(
    &self,
    code: &str,
    ctx: &mut LoaderContext,
  ) -> Result<(String, Option<String>), LoaderError> {
    let asset_name = format!("{}.css", ctx.path.trim_start_matches('/').replace('/', "_"));
    ctx.emit_file(asset_name.clone(), code.to_string(), None);
    let escaped = code.replace('\\', "\\\\").replace('`', "\\`");
    let wrapped = format!(
      "var __style = document.createElement('style');\n__style.textContent = `{escaped}`;\ndocument.head.appendChild(__style);\nmodule.exports = {{}};"
    );
    Ok((wrapped, None))
  }

  fn clean_module(&self, _ctx: &mut LoaderContext) {
    // A garbage-collected CSS node's injected <style> tag is a host-side DOM
    // concern (external-resource injection is out of scope per the design
    // notes); nothing to clean up on the Rust side.
  }
}

/// Registers the built-in transformer set under the names [`StaticPreset`]
/// expects.
pub fn built_in_transpilers() -> HashMap<String, Box<dyn Transpiler>> {
  let mut map: HashMap<String, Box<dyn Transpiler>> = HashMap::new();
  map.insert("identity".into(), Box::new(IdentityTranspiler));
  map.insert("json".into(), Box::new(JsonTranspiler));
  map.insert("css".into(), Box::new(CssTranspiler));
  map
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn extension_rules_pick_matching_transpiler() {
    let preset = StaticPreset::built_in();
    let module = Module::new("/data.json", "{}");
    let specs = preset.get_loaders(&module, "");
    assert_eq!(specs[0].transpiler, "json");
  }

  #[test]
  fn unmatched_extension_falls_back_to_identity() {
    let preset = StaticPreset::built_in();
    let module = Module::new("/readme.md", "# hi");
    let specs = preset.get_loaders(&module, "");
    assert_eq!(specs[0].transpiler, "identity");
  }

  #[test]
  fn json_transpiler_wraps_valid_json() {
    let transpiler = JsonTranspiler;
    let files = crate::files::FileSet::new();
    let mut ctx = LoaderContext::new(
      crate::node::NodeId(0),
      "/data.json".into(),
      HashMap::new(),
      &files,
    );
    let (code, _) = transpiler.transpile(r#"{"a":1}"#, &mut ctx).unwrap();
    assert_eq!(code, r#"module.exports = {"a":1};"#);
  }

  #[test]
  fn json_transpiler_rejects_invalid_json() {
    let transpiler = JsonTranspiler;
    let files = crate::files::FileSet::new();
    let mut ctx = LoaderContext::new(
      crate::node::NodeId(0),
      "/data.json".into(),
      HashMap::new(),
      &files,
    );
    assert!(transpiler.transpile("{not json", &mut ctx).is_err());
  }

  #[test]
  fn css_transpiler_emits_style_asset() {
    let transpiler = CssTranspiler;
    let files = crate::files::FileSet::new();
    let mut ctx = LoaderContext::new(
      crate::node::NodeId(0),
      "/styles/app.css".into(),
      HashMap::new(),
      &files,
    );
    let (code, _) = transpiler.transpile("body { color: red; }", &mut ctx).unwrap();
    assert!(code.contains("document.head.appendChild"));
    let (ops, _, _) = ctx.into_parts();
    assert_eq!(ops.len(), 1);
  }
}
