use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

/// A runtime build value.
///
/// Values are what targets evaluate to, what rules receive as arguments and
/// what the repo persists as target results. They are plain data: equality,
/// hashing and serialization are structural, which is what makes
/// [`TargetId`](crate::repo::TargetId) derivation deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    None,
    Boolean(bool),
    String(String),
    Path(Utf8PathBuf),
    File(Utf8PathBuf),
    Directory(Utf8PathBuf),
    Enum {
        package: String,
        name: String,
        value: String,
    },
    List(Vec<Value>),
    /// Insertion ordered, without duplicates. Build it with [`Value::set`].
    Set(Vec<Value>),
    Tuple(Vec<Value>),
    NamedTuple(Vec<(String, Value)>),
    ClassInstance {
        package: String,
        class: String,
        fields: BTreeMap<String, Value>,
    },
    Rule(RuleRef),
    Type(Type),
}

/// Reference to a build or action rule definition, used when a rule itself is
/// passed around as a value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleRef {
    pub package: String,
    pub name: String,
    pub action: bool,
}

impl Value {
    pub fn string(value: impl Into<String>) -> Self {
        Value::String(value.into())
    }

    /// Builds a set, dropping repeated elements but keeping the first
    /// occurrence order.
    pub fn set(values: impl IntoIterator<Item = Value>) -> Self {
        let mut out: Vec<Value> = Vec::new();
        for value in values {
            if !out.contains(&value) {
                out.push(value);
            }
        }
        Value::Set(out)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Boolean(_) => "boolean",
            Value::String(_) => "string",
            Value::Path(_) => "path",
            Value::File(_) => "file",
            Value::Directory(_) => "directory",
            Value::Enum { .. } => "enum",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Tuple(_) => "tuple",
            Value::NamedTuple(_) => "named tuple",
            Value::ClassInstance { .. } => "class instance",
            Value::Rule(rule) if rule.action => "action rule",
            Value::Rule(_) => "build rule",
            Value::Type(_) => "type",
        }
    }

    /// Looks up a field of a class instance or an element of a named tuple.
    pub fn member(&self, name: &str) -> Option<&Value> {
        match self {
            Value::ClassInstance { fields, .. } => fields.get(name),
            Value::NamedTuple(pairs) => pairs.iter().find(|(k, _)| k == name).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Calls `f` for every path-like value reachable from this one.
    pub fn visit_paths<'a>(&'a self, f: &mut impl FnMut(&'a Utf8Path)) {
        match self {
            Value::Path(path) | Value::File(path) | Value::Directory(path) => f(path),
            Value::List(items) | Value::Set(items) | Value::Tuple(items) => {
                for item in items {
                    item.visit_paths(f);
                }
            }
            Value::NamedTuple(pairs) => {
                for (_, item) in pairs {
                    item.visit_paths(f);
                }
            }
            Value::ClassInstance { fields, .. } => {
                for item in fields.values() {
                    item.visit_paths(f);
                }
            }
            _ => {}
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fn list(f: &mut Formatter<'_>, open: &str, items: &[Value], close: &str) -> fmt::Result {
            f.write_str(open)?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{item}")?;
            }
            f.write_str(close)
        }

        match self {
            Value::None => f.write_str("none"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Path(p) => write!(f, "path({p})"),
            Value::File(p) => write!(f, "file({p})"),
            Value::Directory(p) => write!(f, "directory({p})"),
            Value::Enum { name, value, .. } => write!(f, "{name}.{value}"),
            Value::List(items) => list(f, "[", items, "]"),
            Value::Set(items) => list(f, "set[", items, "]"),
            Value::Tuple(items) => list(f, "(", items, ")"),
            Value::NamedTuple(pairs) => {
                f.write_str("(")?;
                for (i, (name, value)) in pairs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{name}: {value}")?;
                }
                f.write_str(")")
            }
            Value::ClassInstance {
                package,
                class,
                fields,
            } => {
                write!(f, "{package}:{class}(")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{name}={value}")?;
                }
                f.write_str(")")
            }
            Value::Rule(rule) => write!(f, "{}:{}", rule.package, rule.name),
            Value::Type(ty) => write!(f, "type({ty})"),
        }
    }
}

/// A declared type: parameter, field, var and return types all resolve to
/// one of these before any value is coerced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Any,
    Boolean,
    String,
    Path,
    File,
    Directory,
    List(Box<Type>),
    Set(Box<Type>),
    Tuple(Vec<Type>),
    NamedTuple(Vec<(String, Type)>),
    DataClass { package: String, name: String },
    SuperClass { package: String, name: String },
    Enum { package: String, name: String },
    Union(Vec<Type>),
    None,
    BuildRule,
    ActionRule,
    Type,
}

impl Type {
    /// Resolves a single-token built-in type name.
    pub fn basic(name: &str) -> Option<Type> {
        Some(match name {
            "any" => Type::Any,
            "boolean" => Type::Boolean,
            "string" => Type::String,
            "path" => Type::Path,
            "file" => Type::File,
            "directory" => Type::Directory,
            "buildrule" => Type::BuildRule,
            "actionrule" => Type::ActionRule,
            "type" => Type::Type,
            "none" => Type::None,
            _ => return None,
        })
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fn join(f: &mut Formatter<'_>, items: &[Type], sep: &str) -> fmt::Result {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str(sep)?;
                }
                write!(f, "{item}")?;
            }
            Ok(())
        }

        match self {
            Type::Any => f.write_str("any"),
            Type::Boolean => f.write_str("boolean"),
            Type::String => f.write_str("string"),
            Type::Path => f.write_str("path"),
            Type::File => f.write_str("file"),
            Type::Directory => f.write_str("directory"),
            Type::List(elem) => write!(f, "list<{elem}>"),
            Type::Set(elem) => write!(f, "set<{elem}>"),
            Type::Tuple(items) => {
                f.write_str("(")?;
                join(f, items, ", ")?;
                f.write_str(")")
            }
            Type::NamedTuple(pairs) => {
                f.write_str("(")?;
                for (i, (name, ty)) in pairs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{name}: {ty}")?;
                }
                f.write_str(")")
            }
            Type::DataClass { package, name }
            | Type::SuperClass { package, name }
            | Type::Enum { package, name } => write!(f, "{package}:{name}"),
            Type::Union(items) => {
                f.write_str("{")?;
                join(f, items, ", ")?;
                f.write_str("}")
            }
            Type::None => f.write_str("none"),
            Type::BuildRule => f.write_str("buildrule"),
            Type::ActionRule => f.write_str("actionrule"),
            Type::Type => f.write_str("type"),
        }
    }
}
