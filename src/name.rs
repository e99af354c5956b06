//! Per-script symbol table used while building the task graph.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, PoisonError, RwLock};

use crate::ast::{AstId, Def, Script};
use crate::error::ConstructionError;
use crate::graph::global::{ProjectId, TaskContext};

/// Dot-separated identifier, e.g. `jvm.lib`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Name(Vec<String>);

impl Name {
    pub fn new(tokens: Vec<String>) -> Self {
        Name(tokens)
    }

    pub fn parse(dotted: &str) -> Self {
        Name(crate::ast::split_dotted(dotted))
    }

    pub fn tokens(&self) -> &[String] {
        &self.0
    }

    pub fn child(&self, token: &str) -> Name {
        let mut tokens = self.0.clone();
        tokens.push(token.to_string());
        Name(tokens)
    }

    pub fn last(&self) -> &str {
        self.0.last().map(String::as_str).unwrap_or_default()
    }
}

impl Display for Name {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(usize);

impl ScopeId {
    pub const ROOT: ScopeId = ScopeId(0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefKind {
    Target,
    Action,
    BuildRule,
    ActionRule,
    DataClass,
    SuperClass,
    Enum,
    Var,
    Import,
}

/// Where a definition was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Local,
    Prelude,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefRef {
    pub kind: DefKind,
    pub id: AstId,
    /// Full name from the script root.
    pub name: Name,
    pub scope: ScopeId,
    pub origin: Origin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(DefRef),
    /// The first part of the name is an import; the rest has to be looked up
    /// in the imported project once the import is resolved.
    ImportRequired {
        import: DefRef,
        remaining: Vec<String>,
    },
    TargetMember {
        target: DefRef,
        remaining: Vec<String>,
    },
    EnumValue {
        def: DefRef,
        value: String,
    },
    NamespaceFound(ScopeId),
    NotFound,
}

/// What an import turned out to point at, memoized per evaluation context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportResolution {
    pub project: ProjectId,
    pub context: TaskContext,
    pub prefix: Vec<String>,
}

#[derive(Debug, Clone)]
enum Entry {
    Def(DefRef),
    Namespace(ScopeId),
}

#[derive(Debug)]
struct Scope {
    parent: Option<ScopeId>,
    path: Name,
    entries: HashMap<String, Entry>,
}

#[derive(Debug)]
pub struct NameTable {
    scopes: Vec<Scope>,
    enum_values: HashMap<AstId, Vec<String>>,
    prelude: Option<Arc<NameTable>>,
    resolved_imports: RwLock<HashMap<(Name, TaskContext), ImportResolution>>,
}

impl NameTable {
    /// Collects every name defined by `script`. Names missing from the script
    /// are looked up in `prelude`, when given.
    pub fn build(
        script: &Script,
        prelude: Option<Arc<NameTable>>,
    ) -> Result<Self, ConstructionError> {
        let mut table = NameTable {
            scopes: vec![Scope {
                parent: None,
                path: Name::default(),
                entries: HashMap::new(),
            }],
            enum_values: HashMap::new(),
            prelude,
            resolved_imports: RwLock::new(HashMap::new()),
        };
        table.add_defs(ScopeId::ROOT, &script.defs)?;
        Ok(table)
    }

    fn add_defs(&mut self, scope: ScopeId, defs: &[Def]) -> Result<(), ConstructionError> {
        for def in defs {
            let (kind, id, name) = match def {
                Def::Import(import) => {
                    let name = import.bound_name().ok_or(ConstructionError::ImportName)?;
                    (DefKind::Import, import.id(), name)
                }
                Def::Namespace(ns) => {
                    let child = ScopeId(self.scopes.len());
                    let path = self.scopes[scope.0].path.child(&ns.name);
                    self.scopes.push(Scope {
                        parent: Some(scope),
                        path,
                        entries: HashMap::new(),
                    });
                    self.insert(scope, &ns.name, Entry::Namespace(child))?;
                    self.add_defs(child, &ns.defs)?;
                    continue;
                }
                Def::Target(d) => (DefKind::Target, d.id, d.name.as_str()),
                Def::Action(d) => (DefKind::Action, d.id, d.name.as_str()),
                Def::BuildRule(d) => (DefKind::BuildRule, d.id, d.name.as_str()),
                Def::ActionRule(d) => (DefKind::ActionRule, d.id, d.name.as_str()),
                Def::DataClass(d) => (DefKind::DataClass, d.id, d.name.as_str()),
                Def::SuperClass(d) => (DefKind::SuperClass, d.id, d.name.as_str()),
                Def::Enum(d) => {
                    self.enum_values.insert(d.id, d.values.clone());
                    (DefKind::Enum, d.id, d.name.as_str())
                }
                Def::Var(d) => (DefKind::Var, d.id, d.name.as_str()),
                Def::VarRedefs(_) => continue,
            };

            let def = DefRef {
                kind,
                id,
                name: self.scopes[scope.0].path.child(name),
                scope,
                origin: Origin::Local,
            };
            self.insert(scope, name, Entry::Def(def))?;
        }
        Ok(())
    }

    fn insert(&mut self, scope: ScopeId, name: &str, entry: Entry) -> Result<(), ConstructionError> {
        let entries = &mut self.scopes[scope.0].entries;
        if entries.contains_key(name) {
            let full = self.scopes[scope.0].path.child(name);
            return Err(ConstructionError::DuplicateName(full.to_string()));
        }
        entries.insert(name.to_string(), entry);
        Ok(())
    }

    /// Resolves `tokens` as seen from `scope`: the first token is searched
    /// from the innermost scope outwards to the root, then in the prelude.
    pub fn lookup(&self, scope: ScopeId, tokens: &[String]) -> Lookup {
        let Some(first) = tokens.first() else {
            return Lookup::NotFound;
        };

        let mut current = Some(scope);
        while let Some(id) = current {
            let scope = &self.scopes[id.0];
            if let Some(entry) = scope.entries.get(first) {
                return self.resolve_entry(entry, &tokens[1..]);
            }
            current = scope.parent;
        }

        match &self.prelude {
            Some(prelude) => match prelude.lookup(ScopeId::ROOT, tokens) {
                Lookup::NamespaceFound(_) => Lookup::NotFound,
                found => found.from_prelude(),
            },
            None => Lookup::NotFound,
        }
    }

    fn resolve_entry(&self, entry: &Entry, rest: &[String]) -> Lookup {
        match entry {
            Entry::Namespace(scope) => match rest.split_first() {
                None => Lookup::NamespaceFound(*scope),
                Some((next, rest)) => match self.scopes[scope.0].entries.get(next) {
                    Some(entry) => self.resolve_entry(entry, rest),
                    None => Lookup::NotFound,
                },
            },
            Entry::Def(def) if rest.is_empty() => Lookup::Found(def.clone()),
            Entry::Def(def) => match def.kind {
                DefKind::Import => Lookup::ImportRequired {
                    import: def.clone(),
                    remaining: rest.to_vec(),
                },
                DefKind::Target => Lookup::TargetMember {
                    target: def.clone(),
                    remaining: rest.to_vec(),
                },
                DefKind::Enum if rest.len() == 1 => {
                    let known = self
                        .enum_values
                        .get(&def.id)
                        .is_some_and(|values| values.contains(&rest[0]));
                    if known {
                        Lookup::EnumValue {
                            def: def.clone(),
                            value: rest[0].clone(),
                        }
                    } else {
                        Lookup::NotFound
                    }
                }
                _ => Lookup::NotFound,
            },
        }
    }

    /// Finds the scope of the namespace `name` declared directly in `parent`.
    pub fn namespace_scope(&self, parent: ScopeId, name: &str) -> Option<ScopeId> {
        match self.scopes[parent.0].entries.get(name) {
            Some(Entry::Namespace(scope)) => Some(*scope),
            _ => None,
        }
    }

    /// Looks at `scope` alone, without walking outwards.
    pub fn local(&self, scope: ScopeId, name: &str) -> Option<&DefRef> {
        match self.scopes[scope.0].entries.get(name) {
            Some(Entry::Def(def)) => Some(def),
            _ => None,
        }
    }

    pub fn scope_path(&self, scope: ScopeId) -> &Name {
        &self.scopes[scope.0].path
    }

    /// The resolution of the import named `import` as evaluated in `context`,
    /// once [`NameTable::memoize_import`] recorded it.
    pub fn resolved_import(&self, import: &Name, context: TaskContext) -> Option<ImportResolution> {
        self.resolved_imports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(import.clone(), context))
            .cloned()
    }

    pub fn memoize_import(&self, import: Name, context: TaskContext, resolution: ImportResolution) {
        self.resolved_imports
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((import, context), resolution);
    }
}

impl Lookup {
    fn from_prelude(self) -> Lookup {
        fn mark(mut def: DefRef) -> DefRef {
            def.origin = Origin::Prelude;
            def
        }

        match self {
            Lookup::Found(def) => Lookup::Found(mark(def)),
            Lookup::ImportRequired { import, remaining } => Lookup::ImportRequired {
                import: mark(import),
                remaining,
            },
            Lookup::TargetMember { target, remaining } => Lookup::TargetMember {
                target: mark(target),
                remaining,
            },
            Lookup::EnumValue { def, value } => Lookup::EnumValue {
                def: mark(def),
                value,
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{AstIds, EnumDef, ExprKind, ImportDef, NamespaceDef, VarDef};

    fn tokens(dotted: &str) -> Vec<String> {
        crate::ast::split_dotted(dotted)
    }

    fn sample(ids: &AstIds) -> Script {
        Script {
            package: Some("sample".into()),
            defs: vec![
                Def::Import(ImportDef::All {
                    id: ids.next(),
                    source: ids.expr(ExprKind::Name(tokens("jvm"))),
                    rename: None,
                }),
                ids.target("x", ids.string("hello")),
                Def::Enum(EnumDef {
                    id: ids.next(),
                    name: "Color".into(),
                    values: vec!["red".into(), "green".into()],
                }),
                Def::Namespace(NamespaceDef {
                    id: ids.next(),
                    name: "inner".into(),
                    defs: vec![
                        ids.target("y", ids.name("x")),
                        Def::Var(VarDef {
                            id: ids.next(),
                            name: "x".into(),
                            ty: None,
                            default: Some(ids.string("shadow")),
                        }),
                    ],
                }),
            ],
        }
    }

    #[test]
    fn test_lookup_walks_scopes_outwards() {
        let ids = AstIds::new();
        let table = NameTable::build(&sample(&ids), None).unwrap();
        let inner = table.namespace_scope(ScopeId::ROOT, "inner").unwrap();

        match table.lookup(inner, &tokens("x")) {
            Lookup::Found(def) => {
                assert_eq!(def.kind, DefKind::Var);
                assert_eq!(def.name.to_string(), "inner.x");
            }
            other => panic!("unexpected {other:?}"),
        }

        match table.lookup(ScopeId::ROOT, &tokens("x")) {
            Lookup::Found(def) => assert_eq!(def.kind, DefKind::Target),
            other => panic!("unexpected {other:?}"),
        }

        match table.lookup(ScopeId::ROOT, &tokens("inner.y")) {
            Lookup::Found(def) => assert_eq!(def.name.to_string(), "inner.y"),
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(
            table.lookup(ScopeId::ROOT, &tokens("inner")),
            Lookup::NamespaceFound(_)
        ));
        assert_eq!(table.lookup(ScopeId::ROOT, &tokens("missing")), Lookup::NotFound);
    }

    #[test]
    fn test_lookup_variants() {
        let ids = AstIds::new();
        let table = NameTable::build(&sample(&ids), None).unwrap();

        match table.lookup(ScopeId::ROOT, &tokens("jvm.lib.compile")) {
            Lookup::ImportRequired { import, remaining } => {
                assert_eq!(import.kind, DefKind::Import);
                assert_eq!(remaining, tokens("lib.compile"));
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(
            table.lookup(ScopeId::ROOT, &tokens("x.field")),
            Lookup::TargetMember { remaining, .. } if remaining == tokens("field")
        ));
        assert!(matches!(
            table.lookup(ScopeId::ROOT, &tokens("Color.red")),
            Lookup::EnumValue { value, .. } if value == "red"
        ));
        assert_eq!(
            table.lookup(ScopeId::ROOT, &tokens("Color.blue")),
            Lookup::NotFound
        );
    }

    #[test]
    fn test_duplicate_name_is_fatal() {
        let ids = AstIds::new();
        let script = Script {
            package: None,
            defs: vec![
                ids.target("x", ids.string("a")),
                ids.target("x", ids.string("b")),
            ],
        };

        let err = NameTable::build(&script, None).unwrap_err();
        assert!(matches!(err, ConstructionError::DuplicateName(name) if name == "x"));
    }

    #[test]
    fn test_prelude_is_searched_last() {
        let ids = AstIds::new();
        let prelude = Script {
            package: Some("prelude".into()),
            defs: vec![
                ids.target("glob", ids.string("prelude")),
                ids.target("x", ids.string("prelude")),
            ],
        };
        let prelude = Arc::new(NameTable::build(&prelude, None).unwrap());
        let table = NameTable::build(&sample(&ids), Some(prelude)).unwrap();

        match table.lookup(ScopeId::ROOT, &tokens("glob")) {
            Lookup::Found(def) => assert_eq!(def.origin, Origin::Prelude),
            other => panic!("unexpected {other:?}"),
        }
        match table.lookup(ScopeId::ROOT, &tokens("x")) {
            Lookup::Found(def) => assert_eq!(def.origin, Origin::Local),
            other => panic!("unexpected {other:?}"),
        }
    }
}
