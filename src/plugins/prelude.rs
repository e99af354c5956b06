//! The prelude: names every script can use without importing anything.
//!
//! ```text
//! def glob(pattern: {string, set<string>}): set<file> = native:bibix.prelude.Glob
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use camino::{Utf8Path, Utf8PathBuf};

use crate::ast::{AstIds, Def, ImplDef, RuleDef, Script, TypeKind};
use crate::plugin::{BuildContext, NativeRule, NativeRules, PluginReturn};
use crate::value::Value;

pub const GLOB_CLASS: &str = "bibix.prelude.Glob";

pub fn script() -> Script {
    let ids = AstIds::new();
    let set_of = |elem: &str| ids.ty(TypeKind::Collection("set".into(), vec![ids.type_name(elem)]));

    let pattern = ids.ty(TypeKind::Union(vec![ids.type_name("string"), set_of("string")]));
    let glob = RuleDef {
        id: ids.next(),
        name: "glob".into(),
        params: vec![ids.param("pattern", pattern, None)],
        return_type: set_of("file"),
        implementation: ImplDef {
            target: vec!["native".into()],
            class: GLOB_CLASS.into(),
            method: None,
        },
    };

    Script {
        package: None,
        defs: vec![Def::BuildRule(glob)],
    }
}

pub fn natives() -> Arc<dyn NativeRules> {
    let mut rules: HashMap<String, Arc<dyn NativeRule>> = HashMap::new();
    rules.insert(GLOB_CLASS.into(), Arc::new(Glob));
    Arc::new(rules)
}

/// Matches patterns against the filesystem, relative to the caller's
/// project root.
struct Glob;

impl NativeRule for Glob {
    fn build(&self, context: &BuildContext) -> anyhow::Result<PluginReturn> {
        let patterns = match context.arg("pattern") {
            Some(Value::String(pattern)) => vec![pattern.clone()],
            Some(Value::Set(items) | Value::List(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(pattern) => Ok(pattern.clone()),
                    other => Err(anyhow!("glob pattern must be a string, got {other}")),
                })
                .collect::<anyhow::Result<Vec<_>>>()?,
            Some(other) => bail!("glob pattern must be a string or a set of strings, got {other}"),
            None => bail!("missing glob pattern"),
        };

        // the root is a literal path, only the script's part is a pattern
        let base = Utf8PathBuf::from(glob::Pattern::escape(context.base_dir().as_str()));
        let mut matched = Vec::new();
        for pattern in &patterns {
            let pattern = if Utf8Path::new(pattern).is_absolute() {
                Utf8PathBuf::from(pattern)
            } else {
                base.join(pattern)
            };
            for path in glob::glob(pattern.as_str())? {
                matched.push(Utf8PathBuf::try_from(path?)?);
            }
        }
        matched.sort();
        tracing::debug!(patterns = patterns.len(), matched = matched.len(), "glob");

        Ok(PluginReturn::Value(Value::set(matched.into_iter().map(Value::File))))
    }

    fn transient(&self) -> bool {
        true
    }
}
