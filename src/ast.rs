//! The syntax tree consumed by the graph builder.
//!
//! Parsing build scripts is not this crate's job: a front end hands over a
//! [`Script`] through [`ScriptParser`](crate::plugin::ScriptParser), or a
//! built-in project assembles one directly with [`AstIds`]. Every node that
//! can become a graph node carries an [`AstId`], unique within its script.

use std::sync::atomic::{AtomicU32, Ordering};

/// Identity of a syntax node, unique within one script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AstId(pub u32);

/// Allocates fresh [`AstId`]s for scripts assembled in code.
#[derive(Debug, Default)]
pub struct AstIds(AtomicU32);

impl AstIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> AstId {
        AstId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    /// Package name declared by the script, e.g. `com.example.jvm`.
    pub package: Option<String>,
    pub defs: Vec<Def>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Def {
    Import(ImportDef),
    Namespace(NamespaceDef),
    Target(TargetDef),
    Action(ActionDef),
    BuildRule(RuleDef),
    ActionRule(RuleDef),
    DataClass(DataClassDef),
    SuperClass(SuperClassDef),
    Enum(EnumDef),
    Var(VarDef),
    VarRedefs(VarRedefsDef),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImportDef {
    /// `import <source> [as <rename>]`
    All {
        id: AstId,
        source: Expr,
        rename: Option<String>,
    },
    /// `from <source> import <importing> [as <rename>]`
    From {
        id: AstId,
        source: Expr,
        importing: Vec<String>,
        rename: Option<String>,
    },
}

impl ImportDef {
    pub fn id(&self) -> AstId {
        match self {
            ImportDef::All { id, .. } | ImportDef::From { id, .. } => *id,
        }
    }

    /// The name the import is bound to in its scope, if one can be derived.
    pub fn bound_name(&self) -> Option<&str> {
        match self {
            ImportDef::All { source, rename, .. } => match (rename, &source.kind) {
                (Some(rename), _) => Some(rename),
                (None, ExprKind::Name(tokens)) => tokens.last().map(String::as_str),
                _ => None,
            },
            ImportDef::From {
                importing, rename, ..
            } => rename.as_deref().or(importing.last().map(String::as_str)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceDef {
    pub id: AstId,
    pub name: String,
    pub defs: Vec<Def>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetDef {
    pub id: AstId,
    pub name: String,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionDef {
    pub id: AstId,
    pub name: String,
    pub body: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamDef {
    pub id: AstId,
    pub name: String,
    pub optional: bool,
    pub ty: TypeExpr,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleDef {
    pub id: AstId,
    pub name: String,
    pub params: Vec<ParamDef>,
    pub return_type: TypeExpr,
    pub implementation: ImplDef,
}

/// `= native:com.example.Glob` or `= impl_target:com.example.Rule:method`.
#[derive(Debug, Clone, PartialEq)]
pub struct ImplDef {
    pub target: Vec<String>,
    pub class: String,
    pub method: Option<String>,
}

impl ImplDef {
    pub fn is_native(&self) -> bool {
        self.target.len() == 1 && self.target[0] == "native"
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataClassDef {
    pub id: AstId,
    pub name: String,
    pub fields: Vec<ParamDef>,
    pub body: Vec<ClassBodyElem>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClassBodyElem {
    /// `as <type> = <expr>`, evaluated with `this` bound to the instance.
    Cast { id: AstId, ty: TypeExpr, expr: Expr },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SuperClassDef {
    pub id: AstId,
    pub name: String,
    pub subs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumDef {
    pub id: AstId,
    pub name: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarDef {
    pub id: AstId,
    pub name: String,
    pub ty: Option<TypeExpr>,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarRedefsDef {
    pub id: AstId,
    pub redefs: Vec<VarRedef>,
}

/// `var jvm.version = "17"`: the first token names an import.
#[derive(Debug, Clone, PartialEq)]
pub struct VarRedef {
    pub id: AstId,
    pub name: Vec<String>,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub id: AstId,
    pub kind: ExprKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Cast(Box<Expr>, TypeExpr),
    Merge(Box<Expr>, Box<Expr>),
    Call {
        callee: Vec<String>,
        positional: Vec<Expr>,
        named: Vec<(String, Expr)>,
    },
    MemberAccess(Box<Expr>, String),
    /// A dotted name, `a.b.c`.
    Name(Vec<String>),
    List(Vec<ListElem>),
    Tuple(Vec<Expr>),
    NamedTuple(Vec<(String, Expr)>),
    Str(Vec<StrElem>),
    Bool(bool),
    None,
    This,
    Paren(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListElem {
    pub spread: bool,
    pub expr: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StrElem {
    Text(String),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeExpr {
    pub id: AstId,
    pub kind: TypeKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
    Name(Vec<String>),
    /// `list<T>` or `set<T>`.
    Collection(String, Vec<TypeExpr>),
    Tuple(Vec<TypeExpr>),
    NamedTuple(Vec<(String, TypeExpr)>),
    Union(Vec<TypeExpr>),
}

/// Small constructors for scripts written in code.
impl AstIds {
    pub fn expr(&self, kind: ExprKind) -> Expr {
        Expr {
            id: self.next(),
            kind,
        }
    }

    pub fn string(&self, text: &str) -> Expr {
        self.expr(ExprKind::Str(vec![StrElem::Text(text.to_string())]))
    }

    pub fn name(&self, dotted: &str) -> Expr {
        self.expr(ExprKind::Name(split_dotted(dotted)))
    }

    pub fn call(&self, callee: &str, positional: Vec<Expr>, named: Vec<(&str, Expr)>) -> Expr {
        self.expr(ExprKind::Call {
            callee: split_dotted(callee),
            positional,
            named: named
                .into_iter()
                .map(|(name, expr)| (name.to_string(), expr))
                .collect(),
        })
    }

    pub fn ty(&self, kind: TypeKind) -> TypeExpr {
        TypeExpr {
            id: self.next(),
            kind,
        }
    }

    pub fn type_name(&self, dotted: &str) -> TypeExpr {
        self.ty(TypeKind::Name(split_dotted(dotted)))
    }

    pub fn param(&self, name: &str, ty: TypeExpr, default: Option<Expr>) -> ParamDef {
        ParamDef {
            id: self.next(),
            name: name.to_string(),
            optional: false,
            ty,
            default,
        }
    }

    pub fn target(&self, name: &str, value: Expr) -> Def {
        Def::Target(TargetDef {
            id: self.next(),
            name: name.to_string(),
            value,
        })
    }
}

pub fn split_dotted(dotted: &str) -> Vec<String> {
    dotted.split('.').map(str::to_string).collect()
}
