//! Value coercion: fitting a [`Value`] to a declared [`Type`].
//!
//! Coercion is pure apart from two things it needs from its caller, both
//! behind [`CoercionEnv`]: the project root that relative paths resolve
//! against, and results of other tasks (class descriptors, field defaults,
//! cast expressions). A result that isn't available yet makes the whole
//! coercion [`Coerced::Pending`], and the caller retries once it is.

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::Utf8Path;

use crate::core::normalize_lexically;
use crate::engine::results::DataClassDescriptor;
use crate::error::CoercionError;
use crate::graph::global::GlobalTaskId;
use crate::name::Name;
use crate::value::{Type, Value};

/// A task result the environment may not have yet.
#[derive(Debug, Clone, PartialEq)]
pub enum Need<T> {
    Ready(T),
    Pending(GlobalTaskId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Coerced {
    Done(Value),
    Pending(Vec<GlobalTaskId>),
}

pub trait CoercionEnv {
    /// Root of the project doing the coercion.
    fn project_root(&self) -> Option<&Utf8Path>;

    fn data_class(&self, package: &str, name: &str) -> Result<Need<Arc<DataClassDescriptor>>, CoercionError>;

    /// Direct members of a super class, or `None` if `name` isn't one.
    fn super_class_subs(&self, package: &str, name: &str) -> Option<Vec<Name>>;

    fn enum_values(&self, package: &str, name: &str) -> Option<Vec<String>>;

    /// Evaluates the default of a field in the class's own context.
    fn field_default(
        &self,
        class: &DataClassDescriptor,
        field: &str,
    ) -> Result<Need<Value>, CoercionError>;

    /// Evaluates the cast expression at `index` with `this` bound to
    /// `instance`.
    fn cast(
        &self,
        class: &DataClassDescriptor,
        index: usize,
        instance: &Value,
    ) -> Result<Need<Value>, CoercionError>;
}

pub fn coerce(value: &Value, ty: &Type, env: &dyn CoercionEnv) -> Result<Coerced, CoercionError> {
    let fail = |reason: &str| Err(CoercionError::new(value, ty, reason));
    let done = |value: Value| Ok(Coerced::Done(value));

    match (value, ty) {
        (Value::None, _) => done(Value::None),
        (_, Type::Any) => done(value.clone()),
        (_, Type::Union(members)) => {
            for member in members {
                match coerce(value, member, env) {
                    Ok(Coerced::Done(value)) => return done(value),
                    Ok(pending) => return Ok(pending),
                    Err(_) => continue,
                }
            }
            fail("no member of the union matches")
        }
        (Value::Boolean(_), Type::Boolean) => done(value.clone()),

        (Value::String(_), Type::String) => done(value.clone()),
        (Value::Path(p) | Value::File(p) | Value::Directory(p), Type::String) => {
            done(Value::String(p.to_string()))
        }
        (Value::String(s), Type::Path | Type::File | Type::Directory) => {
            let path = Utf8Path::new(s);
            let path = match env.project_root() {
                Some(root) if path.is_relative() => root.join(path),
                _ if path.is_relative() => return fail("relative path without a project root"),
                _ => path.to_path_buf(),
            };
            done(path_value(normalize_lexically(&path), ty))
        }
        (Value::Path(p) | Value::File(p) | Value::Directory(p), Type::Path | Type::File | Type::Directory) => {
            done(path_value(p.clone(), ty))
        }

        (Value::List(items) | Value::Set(items), Type::List(elem)) => {
            Ok(coerce_all(items.iter().map(|item| (item, elem.as_ref())), env)?.map(Value::List))
        }
        (Value::List(items) | Value::Set(items), Type::Set(elem)) => {
            Ok(coerce_all(items.iter().map(|item| (item, elem.as_ref())), env)?.map(|items| Value::set(items)))
        }

        (Value::Tuple(items), Type::Tuple(types)) => {
            if items.len() != types.len() {
                return fail("arity differs");
            }
            Ok(coerce_all(items.iter().zip(types), env)?.map(Value::Tuple))
        }
        (Value::NamedTuple(pairs), Type::Tuple(types)) => {
            if pairs.len() != types.len() {
                return fail("arity differs");
            }
            let items = pairs.iter().map(|(_, item)| item);
            Ok(coerce_all(items.zip(types), env)?.map(Value::Tuple))
        }
        (Value::Tuple(items), Type::NamedTuple(types)) => {
            if items.len() != types.len() {
                return fail("arity differs");
            }
            let coerced = coerce_all(items.iter().zip(types.iter().map(|(_, ty)| ty)), env)?;
            Ok(coerced.map(|items| name_items(types, items)))
        }
        (Value::NamedTuple(pairs), Type::NamedTuple(types)) => {
            if pairs.len() != types.len() {
                return fail("arity differs");
            }
            let mut ordered = Vec::with_capacity(types.len());
            for (name, ty) in types {
                match pairs.iter().find(|(k, _)| k == name) {
                    Some((_, item)) => ordered.push((item, ty)),
                    None => return fail(&format!("missing field `{name}`")),
                }
            }
            Ok(coerce_all(ordered, env)?.map(|items| name_items(types, items)))
        }

        (Value::ClassInstance { package, class, .. }, Type::DataClass { package: p, name })
            if package == p && class == name =>
        {
            complete_instance(value, env)
        }
        (Value::ClassInstance { package, class, .. }, Type::SuperClass { package: p, name })
            if package == p && is_member(env, p, name, class) =>
        {
            done(value.clone())
        }
        (Value::ClassInstance { .. }, _) => cast_instance(value, ty, env),

        (Value::Enum { package, name, .. }, Type::Enum { package: p, name: n }) if package == p && name == n => {
            done(value.clone())
        }
        (Value::String(s), Type::Enum { package, name }) => match env.enum_values(package, name) {
            Some(values) if values.contains(s) => done(Value::Enum {
                package: package.clone(),
                name: name.clone(),
                value: s.clone(),
            }),
            Some(_) => fail("not a value of the enum"),
            None => fail("unknown enum"),
        },

        (Value::Rule(rule), Type::BuildRule) if !rule.action => done(value.clone()),
        (Value::Rule(rule), Type::ActionRule) if rule.action => done(value.clone()),
        (Value::Type(_), Type::Type) => done(value.clone()),

        _ => fail("no conversion"),
    }
}

impl Coerced {
    fn map(self, f: impl FnOnce(Vec<Value>) -> Value) -> Coerced {
        self.map_value(|value| match value {
            Value::List(items) => f(items),
            other => other,
        })
    }

    fn map_value(self, f: impl FnOnce(Value) -> Value) -> Coerced {
        match self {
            Coerced::Done(value) => Coerced::Done(f(value)),
            pending => pending,
        }
    }
}

fn path_value(path: camino::Utf8PathBuf, ty: &Type) -> Value {
    match ty {
        Type::File => Value::File(path),
        Type::Directory => Value::Directory(path),
        _ => Value::Path(path),
    }
}

fn name_items(types: &[(String, Type)], items: Vec<Value>) -> Value {
    Value::NamedTuple(
        types
            .iter()
            .map(|(name, _)| name.clone())
            .zip(items)
            .collect(),
    )
}

/// Coerces every pair; the values come back wrapped in a [`Value::List`].
/// All pending tasks are reported together.
fn coerce_all<'a>(
    pairs: impl IntoIterator<Item = (&'a Value, &'a Type)>,
    env: &dyn CoercionEnv,
) -> Result<Coerced, CoercionError> {
    let mut values = Vec::new();
    let mut pending = Vec::new();
    for (value, ty) in pairs {
        match coerce(value, ty, env)? {
            Coerced::Done(value) => values.push(value),
            Coerced::Pending(tasks) => pending.extend(tasks),
        }
    }
    if pending.is_empty() {
        Ok(Coerced::Done(Value::List(values)))
    } else {
        Ok(Coerced::Pending(pending))
    }
}

fn is_member(env: &dyn CoercionEnv, package: &str, super_class: &str, class: &str) -> bool {
    let Some(subs) = env.super_class_subs(package, super_class) else {
        return false;
    };
    subs.iter().any(|sub| {
        let sub = sub.to_string();
        sub == class || is_member(env, package, &sub, class)
    })
}

/// Coerces the fields of a class instance to their declared types and
/// fills in the ones left out.
fn complete_instance(value: &Value, env: &dyn CoercionEnv) -> Result<Coerced, CoercionError> {
    let Value::ClassInstance {
        package,
        class,
        fields,
    } = value
    else {
        return Err(CoercionError::new(value, &Type::Any, "not a class instance"));
    };
    let descriptor = match env.data_class(package, class)? {
        Need::Ready(descriptor) => descriptor,
        Need::Pending(task) => return Ok(Coerced::Pending(vec![task])),
    };
    let ty = descriptor.ty();

    if let Some(unknown) = fields
        .keys()
        .find(|name| !descriptor.fields.iter().any(|field| &field.name == *name))
    {
        return Err(CoercionError::new(value, &ty, format!("unknown field `{unknown}`")));
    }

    let mut out = BTreeMap::new();
    let mut pending = Vec::new();
    for field in &descriptor.fields {
        let given = match fields.get(&field.name) {
            Some(given) => given.clone(),
            None if field.default.is_some() => match env.field_default(&descriptor, &field.name)? {
                Need::Ready(value) => value,
                Need::Pending(task) => {
                    pending.push(task);
                    continue;
                }
            },
            None if field.optional => Value::None,
            None => {
                let reason = format!("missing field `{}`", field.name);
                return Err(CoercionError::new(value, &ty, reason));
            }
        };
        match coerce(&given, &field.ty, env)? {
            Coerced::Done(coerced) => {
                out.insert(field.name.clone(), coerced);
            }
            Coerced::Pending(tasks) => pending.extend(tasks),
        }
    }

    if !pending.is_empty() {
        return Ok(Coerced::Pending(pending));
    }
    Ok(Coerced::Done(Value::ClassInstance {
        package: package.clone(),
        class: class.clone(),
        fields: out,
    }))
}

/// Tries the class's own cast rules for a type it doesn't otherwise match.
fn cast_instance(value: &Value, ty: &Type, env: &dyn CoercionEnv) -> Result<Coerced, CoercionError> {
    let Value::ClassInstance { package, class, .. } = value else {
        return Err(CoercionError::new(value, ty, "not a class instance"));
    };
    let descriptor = match env.data_class(package, class)? {
        Need::Ready(descriptor) => descriptor,
        Need::Pending(task) => return Ok(Coerced::Pending(vec![task])),
    };

    let Some(index) = descriptor.casts.iter().position(|(cast, _)| cast == ty) else {
        return Err(CoercionError::new(value, ty, "no conversion"));
    };
    match env.cast(&descriptor, index, value)? {
        Need::Ready(cast) => coerce(&cast, ty, env),
        Need::Pending(task) => Ok(Coerced::Pending(vec![task])),
    }
}
