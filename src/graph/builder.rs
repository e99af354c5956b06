//! Turns a script's syntax tree into its [`TaskGraph`].
//!
//! Every definition becomes one node keyed by its [`AstId`], and every
//! sub-expression becomes a node with required edges to the nodes it reads.
//! Names are resolved with the script's [`NameTable`]; imports are left
//! unresolved and recorded as [`ImportSource`] descriptors, the evaluator
//! resolves them when they are first needed.

use std::collections::HashSet;

use crate::ast::{
    ClassBodyElem, DataClassDef, Def, Expr, ExprKind, ImportDef, ParamDef, RuleDef, Script,
    StrElem, SuperClassDef, TypeExpr, TypeKind, VarDef, VarRedefsDef,
};
use crate::error::ConstructionError;
use crate::graph::{
    DataClassNode, EdgeKind, ImportNode, ImportSource, ListItem, NodeKey, ParamNode, RuleNode,
    StrPart, TaskGraph, TaskId, TaskNode,
};
use crate::name::{DefKind, DefRef, Lookup, Name, NameTable, Origin, ScopeId};
use crate::value::{Type, Value};

/// What a script is allowed to do.
#[derive(Debug, Clone, Default)]
pub struct BuildPolicy {
    /// Whether rules may be implemented with `native:<class>`. Only built-in
    /// projects get this.
    pub native_allowed: bool,
    /// Names of the preloaded plugins, usable without an import.
    pub preloaded: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct Ctx {
    scope: ScopeId,
    this_allowed: bool,
}

impl Ctx {
    fn at(scope: ScopeId) -> Self {
        Ctx {
            scope,
            this_allowed: false,
        }
    }
}

/// Builds the graph of `script`. `names` must have been built from the
/// same script.
pub fn build_graph(
    script: &Script,
    names: &NameTable,
    policy: &BuildPolicy,
) -> Result<TaskGraph, ConstructionError> {
    let mut builder = GraphBuilder {
        names,
        policy,
        graph: TaskGraph::new(),
        redefined: HashSet::new(),
    };
    builder.add_defs(&script.defs, ScopeId::ROOT)?;
    builder.graph.validate()?;
    Ok(builder.graph)
}

struct GraphBuilder<'a> {
    names: &'a NameTable,
    policy: &'a BuildPolicy,
    graph: TaskGraph,
    /// `(import, var)` pairs already redefined by this script.
    redefined: HashSet<(Name, Name)>,
}

impl GraphBuilder<'_> {
    fn add_defs(&mut self, defs: &[Def], scope: ScopeId) -> Result<(), ConstructionError> {
        for def in defs {
            match def {
                Def::Import(import) => self.add_import(import, scope)?,
                Def::Namespace(ns) => {
                    let child = self
                        .names
                        .namespace_scope(scope, &ns.name)
                        .ok_or_else(|| ConstructionError::NameNotFound(ns.name.clone()))?;
                    self.add_defs(&ns.defs, child)?;
                }
                Def::Target(target) => {
                    let name = self.full_name(scope, &target.name);
                    let value = self.add_expr(&target.value, Ctx::at(scope))?;
                    let id = self.graph.add_node(
                        NodeKey::Def(target.id),
                        TaskNode::Target {
                            name: name.clone(),
                            value,
                        },
                    )?;
                    self.graph.add_edge(id, value, EdgeKind::Definition);
                    self.graph.register_def(name, id);
                }
                Def::Action(action) => {
                    let name = self.full_name(scope, &action.name);
                    let body = self.add_expr(&action.body, Ctx::at(scope))?;
                    let id = self.graph.add_node(
                        NodeKey::Def(action.id),
                        TaskNode::Action {
                            name: name.clone(),
                            body,
                        },
                    )?;
                    self.graph.add_edge(id, body, EdgeKind::Definition);
                    self.graph.register_def(name, id);
                }
                Def::BuildRule(rule) => self.add_rule(rule, false, scope)?,
                Def::ActionRule(rule) => self.add_rule(rule, true, scope)?,
                Def::DataClass(class) => self.add_data_class(class, scope)?,
                Def::SuperClass(class) => self.add_super_class(class, scope)?,
                Def::Enum(def) => {
                    let name = self.full_name(scope, &def.name);
                    let id = self.graph.add_node(
                        NodeKey::Def(def.id),
                        TaskNode::Enum {
                            name: name.clone(),
                            values: def.values.clone(),
                        },
                    )?;
                    self.graph.register_def(name, id);
                }
                Def::Var(var) => self.add_var(var, scope)?,
                Def::VarRedefs(redefs) => self.add_var_redefs(redefs, scope)?,
            }
        }
        Ok(())
    }

    fn full_name(&self, scope: ScopeId, name: &str) -> Name {
        self.names.scope_path(scope).child(name)
    }

    fn def_id(&mut self, def: &DefRef) -> TaskId {
        self.graph.id(NodeKey::Def(def.id))
    }

    fn add_import(&mut self, import: &ImportDef, scope: ScopeId) -> Result<(), ConstructionError> {
        let bound = import.bound_name().ok_or(ConstructionError::ImportName)?;
        let name = self.full_name(scope, bound);
        let (source, importing) = match import {
            ImportDef::All { source, .. } => (source, Vec::new()),
            ImportDef::From {
                source, importing, ..
            } => (source, importing.clone()),
        };

        let source = match &source.kind {
            ExprKind::Name(tokens) => self.import_source(import, tokens, scope)?,
            _ => ImportSource::Expr(self.add_expr(source, Ctx::at(scope))?),
        };

        let id = self.graph.add_node(
            NodeKey::Def(import.id()),
            TaskNode::Import(ImportNode {
                name: name.clone(),
                source: source.clone(),
                importing,
            }),
        )?;
        match source {
            ImportSource::Local { import, .. } => self.graph.add_edge(id, import, EdgeKind::Import),
            ImportSource::Expr(expr) => self.graph.add_edge(id, expr, EdgeKind::Value),
            ImportSource::Preloaded(_) => {}
        }
        self.graph.register_def(name, id);
        Ok(())
    }

    fn import_source(
        &mut self,
        import: &ImportDef,
        tokens: &[String],
        scope: ScopeId,
    ) -> Result<ImportSource, ConstructionError> {
        let lookup = match self.names.lookup(scope, tokens) {
            // `import jvm` finds itself first
            Lookup::Found(def) if def.id == import.id() => Lookup::NotFound,
            Lookup::ImportRequired { import: def, .. } if def.id == import.id() => Lookup::NotFound,
            other => other,
        };

        Ok(match lookup {
            Lookup::Found(def) if def.kind == DefKind::Import && def.origin == Origin::Local => {
                ImportSource::Local {
                    import: self.def_id(&def),
                    path: Vec::new(),
                }
            }
            Lookup::ImportRequired { import, remaining } if import.origin == Origin::Local => {
                ImportSource::Local {
                    import: self.def_id(&import),
                    path: remaining,
                }
            }
            Lookup::NotFound => match self.preloaded_head(tokens) {
                Some((plugin, [])) => ImportSource::Preloaded(plugin.to_string()),
                Some((plugin, rest)) => ImportSource::Local {
                    import: self.preloaded_import(plugin)?,
                    path: rest.to_vec(),
                },
                None => return Err(ConstructionError::NameNotFound(tokens.join("."))),
            },
            _ => {
                let expr = Expr {
                    id: import.id(),
                    kind: ExprKind::Name(tokens.to_vec()),
                };
                ImportSource::Expr(self.resolve_name(&expr, tokens, Ctx::at(scope))?)
            }
        })
    }

    /// Splits `tokens` when its first token names a preloaded plugin.
    fn preloaded_head<'t>(&self, tokens: &'t [String]) -> Option<(&'t str, &'t [String])> {
        let (first, rest) = tokens.split_first()?;
        self.policy.preloaded.contains(first).then_some((first.as_str(), rest))
    }

    /// Synthetic import of a preloaded plugin referenced without an import
    /// statement.
    fn preloaded_import(&mut self, plugin: &str) -> Result<TaskId, ConstructionError> {
        self.graph.add_node(
            NodeKey::PreloadedImport(plugin.to_string()),
            TaskNode::Import(ImportNode {
                name: Name::parse(plugin),
                source: ImportSource::Preloaded(plugin.to_string()),
                importing: Vec::new(),
            }),
        )
    }

    fn add_params(
        &mut self,
        owner: TaskId,
        params: &[ParamDef],
        scope: ScopeId,
    ) -> Result<Vec<ParamNode>, ConstructionError> {
        let mut out = Vec::with_capacity(params.len());
        for param in params {
            let ty = self.add_type(&param.ty, scope)?;
            self.graph.add_edge(owner, ty, EdgeKind::Type);

            let default = match &param.default {
                Some(expr) => {
                    let default = self.add_expr(expr, Ctx::at(scope))?;
                    self.graph.add_edge(owner, default, EdgeKind::DefaultValue);
                    Some(default)
                }
                None => None,
            };

            out.push(ParamNode {
                name: param.name.clone(),
                ty,
                optional: param.optional,
                default,
            });
        }
        Ok(out)
    }

    fn add_rule(&mut self, rule: &RuleDef, action: bool, scope: ScopeId) -> Result<(), ConstructionError> {
        let name = self.full_name(scope, &rule.name);
        let id = self.graph.id(NodeKey::Def(rule.id));

        let params = self.add_params(id, &rule.params, scope)?;
        let return_type = self.add_type(&rule.return_type, scope)?;
        self.graph.add_edge(id, return_type, EdgeKind::Type);

        let implementation = if rule.implementation.is_native() {
            if !self.policy.native_allowed {
                return Err(ConstructionError::NativeNotAllowed(name.to_string()));
            }
            let class = rule.implementation.class.clone();
            self.graph.add_node(
                NodeKey::Native(class.clone()),
                TaskNode::NativeImpl { class },
            )?
        } else {
            let target = &rule.implementation.target;
            let expr = Expr {
                id: rule.id,
                kind: ExprKind::Name(target.clone()),
            };
            self.resolve_name(&expr, target, Ctx::at(scope))?
        };
        self.graph.add_edge(id, implementation, EdgeKind::Rule);

        self.graph.add_node(
            NodeKey::Def(rule.id),
            TaskNode::Rule(RuleNode {
                name: name.clone(),
                action,
                params,
                return_type,
                implementation,
                class: rule.implementation.class.clone(),
                method: rule.implementation.method.clone(),
            }),
        )?;
        self.graph.register_def(name, id);
        Ok(())
    }

    fn add_data_class(&mut self, class: &DataClassDef, scope: ScopeId) -> Result<(), ConstructionError> {
        let name = self.full_name(scope, &class.name);
        let id = self.graph.id(NodeKey::Def(class.id));
        let fields = self.add_params(id, &class.fields, scope)?;

        let mut casts = Vec::new();
        for elem in &class.body {
            match elem {
                ClassBodyElem::Cast { ty, expr, .. } => {
                    let ty = self.add_type(ty, scope)?;
                    let ctx = Ctx {
                        scope,
                        this_allowed: true,
                    };
                    let expr = self.add_expr(expr, ctx)?;
                    self.graph.add_edge(id, ty, EdgeKind::Type);
                    self.graph.add_edge(id, expr, EdgeKind::Reference);
                    casts.push((ty, expr));
                }
            }
        }

        self.graph.add_node(
            NodeKey::Def(class.id),
            TaskNode::DataClass(DataClassNode {
                name: name.clone(),
                fields,
                casts,
            }),
        )?;
        self.graph.register_def(name, id);
        Ok(())
    }

    fn add_super_class(&mut self, class: &SuperClassDef, scope: ScopeId) -> Result<(), ConstructionError> {
        let name = self.full_name(scope, &class.name);
        let invalid = |reason: String| ConstructionError::SuperClass {
            name: name.to_string(),
            reason,
        };

        if class.subs.is_empty() {
            return Err(invalid("no sub classes".into()));
        }

        let mut subs = Vec::with_capacity(class.subs.len());
        let mut sub_ids = Vec::with_capacity(class.subs.len());
        for sub in &class.subs {
            match self.names.local(scope, sub) {
                Some(def) if matches!(def.kind, DefKind::DataClass | DefKind::SuperClass) => {
                    subs.push(def.name.clone());
                    sub_ids.push(def.id);
                }
                Some(_) => return Err(invalid(format!("`{sub}` is not a class"))),
                None => return Err(invalid(format!("unknown class `{sub}`"))),
            }
        }

        let id = self.graph.add_node(
            NodeKey::Def(class.id),
            TaskNode::SuperClass {
                name: name.clone(),
                subs,
            },
        )?;
        for sub in sub_ids {
            let sub = self.graph.id(NodeKey::Def(sub));
            self.graph.add_edge(id, sub, EdgeKind::Reference);
        }
        self.graph.register_def(name, id);
        Ok(())
    }

    fn add_var(&mut self, var: &VarDef, scope: ScopeId) -> Result<(), ConstructionError> {
        let name = self.full_name(scope, &var.name);
        let ty = match (&var.ty, &var.default) {
            (Some(ty), _) => self.add_type(ty, scope)?,
            (None, Some(default)) => {
                let inferred = match &default.kind {
                    ExprKind::Bool(_) => Type::Boolean,
                    ExprKind::Str(_) => Type::String,
                    _ => return Err(ConstructionError::VarType(name.to_string())),
                };
                self.add_basic(inferred)?
            }
            (None, None) => return Err(ConstructionError::VarType(name.to_string())),
        };

        let id = self.graph.id(NodeKey::Def(var.id));
        self.graph.add_edge(id, ty, EdgeKind::Type);

        let default = match &var.default {
            Some(expr) => {
                let default = self.add_expr(expr, Ctx::at(scope))?;
                self.graph.add_edge(id, default, EdgeKind::DefaultValue);
                Some(default)
            }
            None => None,
        };

        self.graph.add_node(
            NodeKey::Def(var.id),
            TaskNode::Var {
                name: name.clone(),
                ty,
                default,
            },
        )?;
        self.graph.register_def(name, id);
        Ok(())
    }

    fn add_var_redefs(&mut self, redefs: &VarRedefsDef, scope: ScopeId) -> Result<(), ConstructionError> {
        for redef in &redefs.redefs {
            let shown = redef.name.join(".");
            let invalid = |reason: &str| ConstructionError::VarRedef {
                name: shown.clone(),
                reason: reason.to_string(),
            };

            if scope != ScopeId::ROOT {
                return Err(invalid("only allowed at the script root"));
            }

            let (import, var) = match self.names.lookup(ScopeId::ROOT, &redef.name) {
                Lookup::ImportRequired { import, remaining } if import.origin == Origin::Local => {
                    (import, Name::new(remaining))
                }
                _ => return Err(invalid("must name a var of an imported project")),
            };

            if !self.redefined.insert((import.name.clone(), var.clone())) {
                return Err(invalid("redefined twice"));
            }

            let value = self.add_expr(&redef.value, Ctx::at(scope))?;
            let import_id = self.def_id(&import);
            self.graph.add_edge(import_id, value, EdgeKind::Reference);
            self.graph.add_var_redef(import.name, var, value);
        }
        Ok(())
    }

    fn add_basic(&mut self, ty: Type) -> Result<TaskId, ConstructionError> {
        self.graph
            .add_node(NodeKey::Basic(ty.clone()), TaskNode::BasicType(ty))
    }

    fn add_coercion(&mut self, value: TaskId, ty: TaskId) -> Result<TaskId, ConstructionError> {
        let id = self
            .graph
            .add_node(NodeKey::Coerce { value, ty }, TaskNode::Coerce { value, ty })?;
        self.graph.add_edge(id, value, EdgeKind::Value);
        self.graph.add_edge(id, ty, EdgeKind::Type);
        Ok(id)
    }

    fn add_expr(&mut self, expr: &Expr, ctx: Ctx) -> Result<TaskId, ConstructionError> {
        let key = NodeKey::Expr(expr.id);
        match &expr.kind {
            ExprKind::Cast(value, ty) => {
                let value = self.add_expr(value, ctx)?;
                let ty = self.add_type(ty, ctx.scope)?;
                self.add_coercion(value, ty)
            }
            ExprKind::Merge(lhs, rhs) => {
                let lhs = self.add_expr(lhs, ctx)?;
                let rhs = self.add_expr(rhs, ctx)?;
                let id = self.graph.add_node(key, TaskNode::Merge { lhs, rhs })?;
                self.graph.add_edge(id, lhs, EdgeKind::Value);
                self.graph.add_edge(id, rhs, EdgeKind::Value);
                Ok(id)
            }
            ExprKind::Call {
                callee,
                positional,
                named,
            } => {
                let callee = self.resolve_name(expr, callee, ctx)?;
                let positional = positional
                    .iter()
                    .map(|arg| self.add_expr(arg, ctx))
                    .collect::<Result<Vec<_>, _>>()?;
                let named = named
                    .iter()
                    .map(|(name, arg)| Ok((name.clone(), self.add_expr(arg, ctx)?)))
                    .collect::<Result<Vec<_>, ConstructionError>>()?;

                let id = self.graph.add_node(
                    key,
                    TaskNode::Call {
                        callee,
                        positional: positional.clone(),
                        named: named.clone(),
                    },
                )?;
                self.graph.add_edge(id, callee, EdgeKind::Rule);
                for arg in positional.into_iter().chain(named.into_iter().map(|(_, arg)| arg)) {
                    self.graph.add_edge(id, arg, EdgeKind::Value);
                }
                Ok(id)
            }
            ExprKind::MemberAccess(target, name) => {
                let target = self.add_expr(target, ctx)?;
                let id = self.graph.add_node(
                    key,
                    TaskNode::Member {
                        target,
                        name: name.clone(),
                    },
                )?;
                self.graph.add_edge(id, target, EdgeKind::Value);
                Ok(id)
            }
            ExprKind::Name(tokens) => self.resolve_name(expr, tokens, ctx),
            ExprKind::List(elems) => {
                let mut items = Vec::with_capacity(elems.len());
                for elem in elems {
                    let node = self.add_expr(&elem.expr, ctx)?;
                    items.push(ListItem {
                        node,
                        spread: elem.spread,
                    });
                }
                let id = self.graph.add_node(key, TaskNode::List(items.clone()))?;
                for item in items {
                    self.graph.add_edge(id, item.node, EdgeKind::Value);
                }
                Ok(id)
            }
            ExprKind::Tuple(elems) => {
                let elems = elems
                    .iter()
                    .map(|elem| self.add_expr(elem, ctx))
                    .collect::<Result<Vec<_>, _>>()?;
                let id = self.graph.add_node(key, TaskNode::Tuple(elems.clone()))?;
                for elem in elems {
                    self.graph.add_edge(id, elem, EdgeKind::Value);
                }
                Ok(id)
            }
            ExprKind::NamedTuple(pairs) => {
                let pairs = pairs
                    .iter()
                    .map(|(name, elem)| Ok((name.clone(), self.add_expr(elem, ctx)?)))
                    .collect::<Result<Vec<_>, ConstructionError>>()?;
                let id = self.graph.add_node(key, TaskNode::NamedTuple(pairs.clone()))?;
                for (_, elem) in pairs {
                    self.graph.add_edge(id, elem, EdgeKind::Value);
                }
                Ok(id)
            }
            ExprKind::Str(elems) => {
                let mut parts = Vec::with_capacity(elems.len());
                for elem in elems {
                    match elem {
                        StrElem::Text(text) => parts.push(StrPart::Text(text.clone())),
                        StrElem::Expr(inner) => {
                            let value = self.add_expr(inner, ctx)?;
                            let string = self.add_basic(Type::String)?;
                            parts.push(StrPart::Value(self.add_coercion(value, string)?));
                        }
                    }
                }
                let id = self.graph.add_node(key, TaskNode::Str(parts.clone()))?;
                for part in parts {
                    if let StrPart::Value(value) = part {
                        self.graph.add_edge(id, value, EdgeKind::Value);
                    }
                }
                Ok(id)
            }
            ExprKind::Bool(b) => self
                .graph
                .add_node(key, TaskNode::Literal(Value::Boolean(*b))),
            ExprKind::None => self.graph.add_node(key, TaskNode::Literal(Value::None)),
            ExprKind::This => {
                if !ctx.this_allowed {
                    return Err(ConstructionError::ThisNotAllowed);
                }
                self.graph.add_node(key, TaskNode::This)
            }
            ExprKind::Paren(inner) => self.add_expr(inner, ctx),
        }
    }

    fn resolve_name(&mut self, expr: &Expr, tokens: &[String], ctx: Ctx) -> Result<TaskId, ConstructionError> {
        let shown = || tokens.join(".");
        match self.names.lookup(ctx.scope, tokens) {
            Lookup::Found(def) if def.origin == Origin::Prelude => self.prelude_ref(tokens),
            Lookup::ImportRequired { import, .. } if import.origin == Origin::Prelude => {
                self.prelude_ref(tokens)
            }
            Lookup::TargetMember { target, .. } if target.origin == Origin::Prelude => {
                self.prelude_ref(tokens)
            }
            Lookup::EnumValue { def, .. } if def.origin == Origin::Prelude => self.prelude_ref(tokens),

            Lookup::Found(def) => Ok(self.def_id(&def)),
            Lookup::ImportRequired { import, remaining } => {
                let import = self.def_id(&import);
                self.imported_ref(import, remaining)
            }
            Lookup::TargetMember { target, remaining } => {
                let mut current = self.def_id(&target);
                for name in remaining {
                    let id = self.graph.add_node(
                        NodeKey::Member {
                            target: current,
                            name: name.clone(),
                        },
                        TaskNode::Member {
                            target: current,
                            name,
                        },
                    )?;
                    self.graph.add_edge(id, current, EdgeKind::Value);
                    current = id;
                }
                Ok(current)
            }
            Lookup::EnumValue { def, value } => {
                let def = self.def_id(&def);
                let id = self.graph.add_node(
                    NodeKey::EnumValue {
                        def,
                        value: value.clone(),
                    },
                    TaskNode::EnumValue { def, value },
                )?;
                self.graph.add_edge(id, def, EdgeKind::Type);
                Ok(id)
            }
            Lookup::NamespaceFound(_) => Err(ConstructionError::NamespaceNotValue(shown())),
            Lookup::NotFound => match self.preloaded_head(tokens) {
                Some((plugin, [])) => self.preloaded_import(plugin),
                Some((plugin, rest)) => {
                    let import = self.preloaded_import(plugin)?;
                    self.imported_ref(import, rest.to_vec())
                }
                None => {
                    tracing::debug!(expr = ?expr.id, "unresolved name {}", shown());
                    Err(ConstructionError::NameNotFound(shown()))
                }
            },
        }
    }

    fn imported_ref(&mut self, import: TaskId, path: Vec<String>) -> Result<TaskId, ConstructionError> {
        let id = self.graph.add_node(
            NodeKey::Imported {
                import,
                path: path.clone(),
            },
            TaskNode::Imported { import, path },
        )?;
        self.graph.add_edge(id, import, EdgeKind::Import);
        Ok(id)
    }

    fn prelude_ref(&mut self, tokens: &[String]) -> Result<TaskId, ConstructionError> {
        self.graph.add_node(
            NodeKey::Prelude(tokens.to_vec()),
            TaskNode::Prelude {
                path: tokens.to_vec(),
            },
        )
    }

    fn add_type(&mut self, ty: &TypeExpr, scope: ScopeId) -> Result<TaskId, ConstructionError> {
        let key = NodeKey::Type(ty.id);
        match &ty.kind {
            TypeKind::Name(tokens) => {
                if let [single] = tokens.as_slice()
                    && let Some(basic) = Type::basic(single)
                {
                    return self.add_basic(basic);
                }

                let unknown = || ConstructionError::UnknownType(tokens.join("."));
                match self.names.lookup(scope, tokens) {
                    Lookup::Found(def) if def.origin == Origin::Prelude => self.prelude_ref(tokens),
                    Lookup::ImportRequired { import, .. } if import.origin == Origin::Prelude => {
                        self.prelude_ref(tokens)
                    }
                    Lookup::Found(def) => match def.kind {
                        DefKind::DataClass => self.class_type(&def, false),
                        DefKind::SuperClass => self.class_type(&def, true),
                        DefKind::Enum => Ok(self.def_id(&def)),
                        _ => Err(unknown()),
                    },
                    Lookup::ImportRequired { import, remaining } => {
                        let import = self.def_id(&import);
                        self.imported_ref(import, remaining)
                    }
                    Lookup::NotFound => match self.preloaded_head(tokens) {
                        Some((plugin, rest)) if !rest.is_empty() => {
                            let import = self.preloaded_import(plugin)?;
                            self.imported_ref(import, rest.to_vec())
                        }
                        _ => Err(unknown()),
                    },
                    _ => Err(unknown()),
                }
            }
            TypeKind::Collection(name, params) => {
                let set = match name.as_str() {
                    "set" => true,
                    "list" => false,
                    _ => return Err(ConstructionError::BadCollection(name.clone())),
                };
                let [param] = params.as_slice() else {
                    return Err(ConstructionError::BadCollection(format!(
                        "{name} with {} type parameters",
                        params.len()
                    )));
                };
                let elem = self.add_type(param, scope)?;
                let id = self
                    .graph
                    .add_node(key, TaskNode::CollectionType { set, elem })?;
                self.graph.add_edge(id, elem, EdgeKind::Type);
                Ok(id)
            }
            TypeKind::Tuple(elems) => {
                let elems = elems
                    .iter()
                    .map(|elem| self.add_type(elem, scope))
                    .collect::<Result<Vec<_>, _>>()?;
                let id = self.graph.add_node(key, TaskNode::TupleType(elems.clone()))?;
                for elem in elems {
                    self.graph.add_edge(id, elem, EdgeKind::Type);
                }
                Ok(id)
            }
            TypeKind::NamedTuple(pairs) => {
                let pairs = pairs
                    .iter()
                    .map(|(name, elem)| Ok((name.clone(), self.add_type(elem, scope)?)))
                    .collect::<Result<Vec<_>, ConstructionError>>()?;
                let id = self
                    .graph
                    .add_node(key, TaskNode::NamedTupleType(pairs.clone()))?;
                for (_, elem) in pairs {
                    self.graph.add_edge(id, elem, EdgeKind::Type);
                }
                Ok(id)
            }
            TypeKind::Union(members) => {
                let members = members
                    .iter()
                    .map(|member| self.add_type(member, scope))
                    .collect::<Result<Vec<_>, _>>()?;
                let id = self.graph.add_node(key, TaskNode::UnionType(members.clone()))?;
                for member in members {
                    self.graph.add_edge(id, member, EdgeKind::Type);
                }
                Ok(id)
            }
        }
    }

    /// A class used as a type only needs its name, not its evaluated
    /// descriptor, so self-referencing classes don't form a cycle.
    fn class_type(&mut self, def: &DefRef, superclass: bool) -> Result<TaskId, ConstructionError> {
        let def_id = self.def_id(def);
        let id = self.graph.add_node(
            NodeKey::ClassType(def_id),
            TaskNode::ClassType {
                name: def.name.clone(),
                superclass,
            },
        )?;
        self.graph.add_edge(id, def_id, EdgeKind::Reference);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{AstIds, ImplDef, NamespaceDef, StrElem, VarRedef};

    fn build(script: &Script, policy: &BuildPolicy) -> Result<TaskGraph, ConstructionError> {
        let names = NameTable::build(script, None)?;
        build_graph(script, &names, policy)
    }

    fn pair_script(ids: &AstIds) -> Script {
        let string = || ids.type_name("string");
        Script {
            package: Some("sample".into()),
            defs: vec![
                Def::DataClass(DataClassDef {
                    id: ids.next(),
                    name: "Pair".into(),
                    fields: vec![
                        ids.param("a", string(), None),
                        ids.param("b", string(), Some(ids.string("dflt"))),
                    ],
                    body: vec![],
                }),
                ids.target(
                    "x",
                    ids.call("Pair", vec![ids.string("hello"), ids.string("world")], vec![]),
                ),
            ],
        }
    }

    #[test]
    fn test_builds_definitions_and_edges() {
        let ids = AstIds::new();
        let graph = build(&pair_script(&ids), &BuildPolicy::default()).unwrap();

        let x = graph.def(&Name::parse("x")).unwrap();
        let Some(TaskNode::Target { value, .. }) = graph.node(x) else {
            panic!("x is not a target");
        };
        let Some(TaskNode::Call {
            callee, positional, ..
        }) = graph.node(*value)
        else {
            panic!("x is not a call");
        };

        assert_eq!(Some(*callee), graph.def(&Name::parse("Pair")));
        assert_eq!(positional.len(), 2);

        let required: Vec<_> = graph
            .edges_from(*value)
            .filter(|edge| edge.kind.is_required())
            .collect();
        assert_eq!(required.len(), 3);

        let pair = graph.def(&Name::parse("Pair")).unwrap();
        assert!(
            graph
                .edges_from(pair)
                .any(|edge| edge.kind == EdgeKind::DefaultValue)
        );
    }

    #[test]
    fn test_same_cast_is_one_node() {
        let ids = AstIds::new();
        let string = TypeKind::Name(vec!["string".into()]);
        let value = ids.expr(ExprKind::Bool(true));
        let cast = |value: Expr| ids.expr(ExprKind::Cast(Box::new(value), ids.ty(string.clone())));
        let script = Script {
            package: None,
            defs: vec![
                ids.target("flag", value.clone()),
                ids.target("a", cast(ids.name("flag"))),
                ids.target("b", cast(ids.name("flag"))),
            ],
        };

        let graph = build(&script, &BuildPolicy::default()).unwrap();
        let value_of = |name: &str| match graph.node(graph.def(&Name::parse(name)).unwrap()) {
            Some(TaskNode::Target { value, .. }) => *value,
            _ => panic!("not a target"),
        };
        assert_eq!(value_of("a"), value_of("b"));
    }

    #[test]
    fn test_super_class_subs_must_be_known_classes() {
        let ids = AstIds::new();
        let script = |subs: Vec<&str>| Script {
            package: None,
            defs: vec![
                Def::DataClass(DataClassDef {
                    id: ids.next(),
                    name: "A".into(),
                    fields: vec![],
                    body: vec![],
                }),
                ids.target("t", ids.string("x")),
                Def::SuperClass(SuperClassDef {
                    id: ids.next(),
                    name: "S".into(),
                    subs: subs.into_iter().map(str::to_string).collect(),
                }),
            ],
        };

        assert!(build(&script(vec!["A"]), &BuildPolicy::default()).is_ok());
        for subs in [vec![], vec!["t"], vec!["Missing"]] {
            let err = build(&script(subs), &BuildPolicy::default()).unwrap_err();
            assert!(matches!(err, ConstructionError::SuperClass { .. }));
        }
    }

    #[test]
    fn test_native_requires_policy() {
        let ids = AstIds::new();
        let script = Script {
            package: None,
            defs: vec![Def::BuildRule(RuleDef {
                id: ids.next(),
                name: "glob".into(),
                params: vec![ids.param("pattern", ids.type_name("string"), None)],
                return_type: ids.type_name("file"),
                implementation: ImplDef {
                    target: vec!["native".into()],
                    class: "Glob".into(),
                    method: None,
                },
            })],
        };

        let err = build(&script, &BuildPolicy::default()).unwrap_err();
        assert!(matches!(err, ConstructionError::NativeNotAllowed(_)));

        let policy = BuildPolicy {
            native_allowed: true,
            ..Default::default()
        };
        assert!(build(&script, &policy).is_ok());
    }

    #[test]
    fn test_this_only_inside_class_body() {
        let ids = AstIds::new();
        let script = Script {
            package: None,
            defs: vec![ids.target("t", ids.expr(ExprKind::This))],
        };
        let err = build(&script, &BuildPolicy::default()).unwrap_err();
        assert!(matches!(err, ConstructionError::ThisNotAllowed));

        let script = Script {
            package: None,
            defs: vec![Def::DataClass(DataClassDef {
                id: ids.next(),
                name: "C".into(),
                fields: vec![ids.param("a", ids.type_name("string"), None)],
                body: vec![ClassBodyElem::Cast {
                    id: ids.next(),
                    ty: ids.type_name("string"),
                    expr: ids.expr(ExprKind::MemberAccess(
                        Box::new(ids.expr(ExprKind::This)),
                        "a".into(),
                    )),
                }],
            })],
        };
        assert!(build(&script, &BuildPolicy::default()).is_ok());
    }

    #[test]
    fn test_var_redefinition_rules() {
        let ids = AstIds::new();
        let import = || {
            Def::Import(ImportDef::All {
                id: ids.next(),
                source: ids.name("jvm"),
                rename: None,
            })
        };
        let redef = |name: &str| VarRedef {
            id: ids.next(),
            name: crate::ast::split_dotted(name),
            value: ids.string("17"),
        };
        let policy = BuildPolicy {
            native_allowed: false,
            preloaded: vec!["jvm".into()],
        };

        let ok = Script {
            package: None,
            defs: vec![
                import(),
                Def::VarRedefs(VarRedefsDef {
                    id: ids.next(),
                    redefs: vec![redef("jvm.version")],
                }),
            ],
        };
        let graph = build(&ok, &policy).unwrap();
        assert_eq!(graph.var_redefs(&Name::parse("jvm")).len(), 1);

        let twice = Script {
            package: None,
            defs: vec![
                import(),
                Def::VarRedefs(VarRedefsDef {
                    id: ids.next(),
                    redefs: vec![redef("jvm.version"), redef("jvm.version")],
                }),
            ],
        };
        assert!(matches!(
            build(&twice, &policy).unwrap_err(),
            ConstructionError::VarRedef { reason, .. } if reason == "redefined twice"
        ));

        let nested = Script {
            package: None,
            defs: vec![
                import(),
                Def::Namespace(NamespaceDef {
                    id: ids.next(),
                    name: "ns".into(),
                    defs: vec![Def::VarRedefs(VarRedefsDef {
                        id: ids.next(),
                        redefs: vec![redef("jvm.version")],
                    })],
                }),
            ],
        };
        assert!(matches!(
            build(&nested, &policy).unwrap_err(),
            ConstructionError::VarRedef { .. }
        ));

        let not_import = Script {
            package: None,
            defs: vec![
                ids.target("x", ids.string("a")),
                Def::VarRedefs(VarRedefsDef {
                    id: ids.next(),
                    redefs: vec![redef("x.version")],
                }),
            ],
        };
        assert!(matches!(
            build(&not_import, &policy).unwrap_err(),
            ConstructionError::VarRedef { .. }
        ));
    }

    #[test]
    fn test_string_interpolation_coerces_to_string() {
        let ids = AstIds::new();
        let script = Script {
            package: None,
            defs: vec![
                ids.target("flag", ids.expr(ExprKind::Bool(true))),
                ids.target(
                    "s",
                    ids.expr(ExprKind::Str(vec![
                        StrElem::Text("flag is ".into()),
                        StrElem::Expr(ids.name("flag")),
                    ])),
                ),
            ],
        };

        let graph = build(&script, &BuildPolicy::default()).unwrap();
        let s = graph.def(&Name::parse("s")).unwrap();
        let Some(TaskNode::Target { value, .. }) = graph.node(s) else {
            panic!("s is not a target");
        };
        let Some(TaskNode::Str(parts)) = graph.node(*value) else {
            panic!("s is not a string");
        };
        let StrPart::Value(coerced) = parts[1] else {
            panic!("second part is not a value");
        };
        assert!(matches!(graph.node(coerced), Some(TaskNode::Coerce { .. })));
    }

    #[test]
    fn test_empty_names_are_construction_errors() {
        let ids = AstIds::new();
        let policy = BuildPolicy {
            preloaded: vec!["jvm".into()],
            ..BuildPolicy::default()
        };
        let script = |value: Expr| Script {
            package: None,
            defs: vec![ids.target("x", value)],
        };

        let empty = script(ids.expr(ExprKind::Name(vec![])));
        assert!(matches!(
            build(&empty, &policy),
            Err(ConstructionError::NameNotFound(name)) if name.is_empty()
        ));

        let plugin = script(ids.expr(ExprKind::Name(vec!["jvm".into(), "compile".into()])));
        assert!(build(&plugin, &policy).is_ok());

        let untyped = Script {
            package: None,
            defs: vec![Def::DataClass(DataClassDef {
                id: ids.next(),
                name: "A".into(),
                fields: vec![ids.param("a", ids.ty(TypeKind::Name(vec![])), None)],
                body: vec![],
            })],
        };
        assert!(matches!(build(&untyped, &policy), Err(ConstructionError::UnknownType(_))));
    }
}
