//! Method registry.
//!
//! Maps method names to their parameter schema and handler.
//!
//! ## Concurrency contract
//!
//! The registry has a single writer and many readers. Methods are registered
//! through `&mut MethodRegistry` while the process starts up. The server then
//! freezes it behind an `Arc`, after which it is only ever read, so lookups
//! during dispatch take no lock. Nothing can be removed once registered.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use super::coerce::{Arg, ParamType};
use super::protocol::WirePayload;

/// Method names with this prefix are reserved for built-in methods.
pub const RESERVED_PREFIX: &str = "rpc.";

/// One declared parameter of a method.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub ty: ParamType,
    pub required: bool,
}

impl ParamSpec {
    /// A parameter that must be supplied.
    pub fn required(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: true,
        }
    }

    /// A parameter that may be left out; it then reads as [`Arg::Absent`].
    pub fn optional(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: false,
        }
    }
}

/// Error returned when reading a coerced argument as a Rust type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ArgError {
    #[error("argument '{0}' is not declared by this method")]
    Undeclared(String),
    #[error("argument '{name}' cannot be read as {wanted}")]
    WrongType { name: String, wanted: &'static str },
}

/// Conversion from a coerced [`Arg`] into a Rust value.
pub trait FromArg: Sized {
    const TYPE_NAME: &'static str;

    fn from_arg(arg: &Arg) -> Option<Self>;
}

impl FromArg for bool {
    const TYPE_NAME: &'static str = "bool";

    fn from_arg(arg: &Arg) -> Option<Self> {
        match arg {
            Arg::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl FromArg for i64 {
    const TYPE_NAME: &'static str = "i64";

    fn from_arg(arg: &Arg) -> Option<Self> {
        match arg {
            Arg::Int(i) => Some(*i),
            Arg::Address(a) => i64::try_from(*a).ok(),
            _ => None,
        }
    }
}

impl FromArg for u64 {
    const TYPE_NAME: &'static str = "u64";

    fn from_arg(arg: &Arg) -> Option<Self> {
        match arg {
            Arg::Address(a) => Some(*a),
            Arg::Int(i) => u64::try_from(*i).ok(),
            _ => None,
        }
    }
}

impl FromArg for f64 {
    const TYPE_NAME: &'static str = "f64";

    fn from_arg(arg: &Arg) -> Option<Self> {
        match arg {
            Arg::Float(f) => Some(*f),
            Arg::Int(i) => Some(*i as f64),
            _ => None,
        }
    }
}

impl FromArg for String {
    const TYPE_NAME: &'static str = "string";

    fn from_arg(arg: &Arg) -> Option<Self> {
        match arg {
            Arg::Str(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl FromArg for Value {
    const TYPE_NAME: &'static str = "JSON value";

    fn from_arg(arg: &Arg) -> Option<Self> {
        Some(arg.to_wire())
    }
}

impl FromArg for Map<String, Value> {
    const TYPE_NAME: &'static str = "object";

    fn from_arg(arg: &Arg) -> Option<Self> {
        match arg {
            Arg::Object(map) => Some(map.clone()),
            Arg::Any(Value::Object(map)) => Some(map.clone()),
            _ => None,
        }
    }
}

impl<T: FromArg> FromArg for Vec<T> {
    const TYPE_NAME: &'static str = "list";

    fn from_arg(arg: &Arg) -> Option<Self> {
        match arg {
            Arg::List(items) => items.iter().map(T::from_arg).collect(),
            _ => None,
        }
    }
}

impl<T: FromArg> FromArg for Option<T> {
    const TYPE_NAME: &'static str = T::TYPE_NAME;

    fn from_arg(arg: &Arg) -> Option<Self> {
        match arg {
            Arg::Absent => Some(None),
            other => T::from_arg(other).map(Some),
        }
    }
}

/// Coerced arguments handed to a handler, in schema order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    values: Vec<(String, Arg)>,
}

impl Args {
    pub fn new(values: Vec<(String, Arg)>) -> Self {
        Self { values }
    }

    pub fn raw(&self, name: &str) -> Option<&Arg> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, arg)| arg)
    }

    /// Read argument `name` as `T`.
    pub fn get<T: FromArg>(&self, name: &str) -> Result<T, ArgError> {
        let arg = self
            .raw(name)
            .ok_or_else(|| ArgError::Undeclared(name.to_string()))?;
        T::from_arg(arg).ok_or_else(|| ArgError::WrongType {
            name: name.to_string(),
            wanted: T::TYPE_NAME,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arg)> {
        self.values.iter().map(|(n, a)| (n.as_str(), a))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Type-erased handler.
pub type BoxedHandler =
    Arc<dyn Fn(&Args) -> anyhow::Result<Box<dyn WirePayload>> + Send + Sync + 'static>;

/// Everything the dispatcher needs to invoke one method.
pub struct MethodDescriptor {
    pub name: String,
    pub description: Option<String>,
    pub params: Vec<ParamSpec>,
    handler: BoxedHandler,
}

impl std::fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl MethodDescriptor {
    pub fn invoke(&self, args: &Args) -> anyhow::Result<Box<dyn WirePayload>> {
        (self.handler)(args)
    }

    pub fn info(&self) -> MethodInfo {
        MethodInfo {
            name: self.name.clone(),
            description: self.description.clone(),
            params: self
                .params
                .iter()
                .map(|p| ParamInfo {
                    name: p.name.clone(),
                    ty: p.ty.to_string(),
                    required: p.required,
                    note: p.ty.note().map(str::to_string),
                })
                .collect(),
        }
    }
}

/// Serializable summary of a method, used by `rpc.methods`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub params: Vec<ParamInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Errors from registering or looking up methods.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("method '{0}' is already registered")]
    DuplicateMethod(String),
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("method name '{0}' uses the reserved \"rpc.\" prefix")]
    ReservedName(String),
    #[error("invalid schema for '{method}': {reason}")]
    InvalidSchema { method: String, reason: String },
}

/// Method name → descriptor.
#[derive(Debug, Default)]
pub struct MethodRegistry {
    methods: BTreeMap<String, Arc<MethodDescriptor>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`.
    pub fn register<F, R>(
        &mut self,
        name: &str,
        params: Vec<ParamSpec>,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&Args) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Serialize + Send + 'static,
    {
        self.register_described(name, None::<String>, params, handler)
    }

    /// Like [`register`](Self::register), with a description shown by `rpc.methods`.
    pub fn register_described<F, R>(
        &mut self,
        name: &str,
        description: Option<impl Into<String>>,
        params: Vec<ParamSpec>,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&Args) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Serialize + Send + 'static,
    {
        if name.starts_with(RESERVED_PREFIX) {
            return Err(RegistryError::ReservedName(name.to_string()));
        }
        self.insert(name, description.map(Into::into), params, box_handler(handler))
    }

    /// Registration path for built-in `rpc.*` methods.
    pub(crate) fn register_builtin<F, R>(
        &mut self,
        name: &str,
        description: &str,
        params: Vec<ParamSpec>,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&Args) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Serialize + Send + 'static,
    {
        self.insert(
            name,
            Some(description.to_string()),
            params,
            box_handler(handler),
        )
    }

    fn insert(
        &mut self,
        name: &str,
        description: Option<String>,
        params: Vec<ParamSpec>,
        handler: BoxedHandler,
    ) -> Result<(), RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::InvalidSchema {
                method: name.to_string(),
                reason: "method name must not be empty".to_string(),
            });
        }
        if self.methods.contains_key(name) {
            return Err(RegistryError::DuplicateMethod(name.to_string()));
        }
        for (i, param) in params.iter().enumerate() {
            if params[..i].iter().any(|p| p.name == param.name) {
                return Err(RegistryError::InvalidSchema {
                    method: name.to_string(),
                    reason: format!("parameter '{}' is declared twice", param.name),
                });
            }
        }

        self.methods.insert(
            name.to_string(),
            Arc::new(MethodDescriptor {
                name: name.to_string(),
                description,
                params,
                handler,
            }),
        );
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<&Arc<MethodDescriptor>, RegistryError> {
        self.methods
            .get(name)
            .ok_or_else(|| RegistryError::MethodNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Method names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn describe(&self) -> Vec<MethodInfo> {
        self.methods.values().map(|m| m.info()).collect()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

fn box_handler<F, R>(handler: F) -> BoxedHandler
where
    F: Fn(&Args) -> anyhow::Result<R> + Send + Sync + 'static,
    R: Serialize + Send + 'static,
{
    Arc::new(move |args: &Args| {
        handler(args).map(|result| Box::new(result) as Box<dyn WirePayload>)
    })
}
