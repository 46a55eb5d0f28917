//! Parameter type schema and wire value coercion.
//!
//! Every registered method declares its parameters as [`ParamType`] values.
//! Incoming JSON values are checked against those declarations before a
//! handler ever sees them, so handlers only deal with well-typed [`Arg`]s.

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Number, Value};

/// Leaf types a parameter can be declared as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Primitive {
    Bool,
    /// Signed 64-bit integer. Floats are rejected, out-of-range numbers fail to parse.
    Int,
    /// 64-bit float. Integers widen.
    Float,
    Str,
    /// Unsigned 64-bit address, given as a number or a decimal / `0x` hex string.
    Address,
    Object,
    Any,
}

impl Primitive {
    fn name(self) -> &'static str {
        match self {
            Primitive::Bool => "bool",
            Primitive::Int => "int",
            Primitive::Float => "float",
            Primitive::Str => "string",
            Primitive::Address => "address",
            Primitive::Object => "object",
            Primitive::Any => "any",
        }
    }
}

/// Declared type of a handler parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamType {
    Primitive(Primitive),
    /// `null` coerces to [`Arg::Absent`], anything else to the inner type.
    Optional(Box<ParamType>),
    /// Alternatives are tried in declaration order.
    Union(Vec<ParamType>),
    /// Inner type plus a free-form note. The note never affects coercion.
    Annotated(Box<ParamType>, String),
    /// Homogeneous list; `null` elements are rejected.
    List(Box<ParamType>),
}

impl ParamType {
    pub fn bool() -> Self {
        ParamType::Primitive(Primitive::Bool)
    }

    pub fn int() -> Self {
        ParamType::Primitive(Primitive::Int)
    }

    pub fn float() -> Self {
        ParamType::Primitive(Primitive::Float)
    }

    pub fn string() -> Self {
        ParamType::Primitive(Primitive::Str)
    }

    pub fn address() -> Self {
        ParamType::Primitive(Primitive::Address)
    }

    pub fn object() -> Self {
        ParamType::Primitive(Primitive::Object)
    }

    pub fn any() -> Self {
        ParamType::Primitive(Primitive::Any)
    }

    pub fn list_of(element: ParamType) -> Self {
        ParamType::List(Box::new(element))
    }

    pub fn union(alternatives: impl IntoIterator<Item = ParamType>) -> Self {
        ParamType::Union(alternatives.into_iter().collect())
    }

    pub fn optional(self) -> Self {
        ParamType::Optional(Box::new(self))
    }

    pub fn annotated(self, note: impl Into<String>) -> Self {
        ParamType::Annotated(Box::new(self), note.into())
    }

    /// The type with any annotation layers removed.
    pub fn strip_annotations(&self) -> &ParamType {
        match self {
            ParamType::Annotated(inner, _) => inner.strip_annotations(),
            other => other,
        }
    }

    /// The outermost annotation note, if any.
    pub fn note(&self) -> Option<&str> {
        match self {
            ParamType::Annotated(_, note) => Some(note),
            _ => None,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Primitive(p) => f.write_str(p.name()),
            ParamType::Optional(inner) => write!(f, "{} | null", inner),
            ParamType::Union(alternatives) => {
                for (i, alt) in alternatives.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" | ")?;
                    }
                    write!(f, "{}", alt)?;
                }
                Ok(())
            }
            ParamType::Annotated(inner, _) => write!(f, "{}", inner),
            ParamType::List(element) => write!(f, "list[{}]", element),
        }
    }
}

/// A parameter value after coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// Optional parameter that was `null` or not supplied.
    Absent,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Address(u64),
    List(Vec<Arg>),
    Object(Map<String, Value>),
    Any(Value),
}

impl Arg {
    /// Re-encode as a wire value.
    pub fn to_wire(&self) -> Value {
        match self {
            Arg::Absent => Value::Null,
            Arg::Bool(b) => Value::Bool(*b),
            Arg::Int(i) => Value::from(*i),
            Arg::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
            Arg::Str(s) => Value::String(s.clone()),
            Arg::Address(a) => Value::from(*a),
            Arg::List(items) => Value::Array(items.iter().map(Arg::to_wire).collect()),
            Arg::Object(map) => Value::Object(map.clone()),
            Arg::Any(value) => value.clone(),
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Arg::Absent)
    }
}

/// Failure to coerce a wire value into a declared type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoercionError {
    #[error("parameter '{param}': expected {expected}, received {received}")]
    TypeMismatch {
        param: String,
        expected: String,
        received: String,
    },

    #[error("parameter '{param}': invalid {expected}: {reason}")]
    Parse {
        param: String,
        expected: String,
        reason: String,
    },
}

impl CoercionError {
    pub fn param(&self) -> &str {
        match self {
            CoercionError::TypeMismatch { param, .. } | CoercionError::Parse { param, .. } => param,
        }
    }

    fn mismatch(param: &str, expected: &ParamType, value: &Value) -> Self {
        CoercionError::TypeMismatch {
            param: param.to_string(),
            expected: expected.to_string(),
            received: describe_value(value),
        }
    }

    fn parse(param: &str, expected: Primitive, reason: impl Into<String>) -> Self {
        CoercionError::Parse {
            param: param.to_string(),
            expected: expected.name().to_string(),
            reason: reason.into(),
        }
    }
}

/// Coerce `value` into `ty`. `param` names the parameter in error messages.
pub fn coerce(param: &str, ty: &ParamType, value: &Value) -> Result<Arg, CoercionError> {
    match ty {
        ParamType::Annotated(inner, _) => coerce(param, inner, value),
        ParamType::Optional(inner) => match value {
            Value::Null => Ok(Arg::Absent),
            _ => coerce(param, inner, value),
        },
        ParamType::Union(alternatives) => {
            // A value that looked like some alternative but failed to parse
            // reports that reason rather than a bare mismatch.
            let mut parse_failure = None;
            for alt in alternatives {
                match coerce(param, alt, value) {
                    Ok(arg) => return Ok(arg),
                    Err(err @ CoercionError::Parse { .. }) => parse_failure = Some(err),
                    Err(CoercionError::TypeMismatch { .. }) => {}
                }
            }
            Err(parse_failure.unwrap_or_else(|| CoercionError::mismatch(param, ty, value)))
        }
        ParamType::List(element) => {
            let Value::Array(items) = value else {
                return Err(CoercionError::mismatch(param, ty, value));
            };
            items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    let name = format!("{}[{}]", param, i);
                    if item.is_null() {
                        return Err(CoercionError::mismatch(&name, element, item));
                    }
                    coerce(&name, element, item)
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Arg::List)
        }
        ParamType::Primitive(p) => coerce_primitive(param, *p, ty, value),
    }
}

fn coerce_primitive(
    param: &str,
    primitive: Primitive,
    ty: &ParamType,
    value: &Value,
) -> Result<Arg, CoercionError> {
    match (primitive, value) {
        (Primitive::Any, v) => Ok(Arg::Any(v.clone())),
        (Primitive::Bool, Value::Bool(b)) => Ok(Arg::Bool(*b)),
        (Primitive::Str, Value::String(s)) => Ok(Arg::Str(s.clone())),
        (Primitive::Object, Value::Object(map)) => Ok(Arg::Object(map.clone())),
        (Primitive::Float, Value::Number(n)) => n
            .as_f64()
            .map(Arg::Float)
            .ok_or_else(|| CoercionError::parse(param, primitive, format!("{} is not representable", n))),
        (Primitive::Int, Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                Ok(Arg::Int(i))
            } else if n.is_u64() || is_integral_beyond(n, I64_LIMIT) {
                Err(CoercionError::parse(
                    param,
                    primitive,
                    format!("{} overflows a 64-bit signed integer", n),
                ))
            } else {
                Err(CoercionError::mismatch(param, ty, value))
            }
        }
        (Primitive::Address, Value::Number(n)) => {
            if let Some(a) = n.as_u64() {
                Ok(Arg::Address(a))
            } else if n.is_i64() || n.as_f64().is_some_and(|f| f < 0.0 && f.fract() == 0.0) {
                Err(CoercionError::parse(param, primitive, format!("{} is negative", n)))
            } else if is_integral_beyond(n, U64_LIMIT) {
                Err(CoercionError::parse(
                    param,
                    primitive,
                    format!("{} overflows a 64-bit address", n),
                ))
            } else {
                Err(CoercionError::mismatch(param, ty, value))
            }
        }
        (Primitive::Address, Value::String(s)) => parse_address(s)
            .map(Arg::Address)
            .map_err(|reason| CoercionError::parse(param, primitive, reason)),
        _ => Err(CoercionError::mismatch(param, ty, value)),
    }
}

// 2^63 and 2^64 are exact as f64.
const I64_LIMIT: f64 = 9_223_372_036_854_775_808.0;
const U64_LIMIT: f64 = 18_446_744_073_709_551_616.0;

/// serde_json stores integers outside the 64-bit ranges as floats. Such a
/// value is whole and at least `limit` in magnitude.
fn is_integral_beyond(n: &serde_json::Number, limit: f64) -> bool {
    n.is_f64()
        && n.as_f64()
            .is_some_and(|f| f.is_finite() && f.fract() == 0.0 && f.abs() >= limit)
}

/// Parse a decimal or `0x`-prefixed hexadecimal address string.
pub fn parse_address(input: &str) -> Result<u64, String> {
    let trimmed = input.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => trimmed.parse::<u64>(),
    };
    parsed.map_err(|e| format!("{:?}: {}", input, e))
}

/// Short human-readable description of a wire value for error messages.
pub fn describe_value(value: &Value) -> String {
    const PREVIEW: usize = 32;
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => format!("bool {}", b),
        Value::Number(n) if n.is_f64() => format!("float {}", n),
        Value::Number(n) => format!("integer {}", n),
        Value::String(s) if s.chars().count() > PREVIEW => {
            let head: String = s.chars().take(PREVIEW).collect();
            format!("string {:?}...", head)
        }
        Value::String(s) => format!("string {:?}", s),
        Value::Array(items) => format!("array of {} element(s)", items.len()),
        Value::Object(map) => format!("object with {} key(s)", map.len()),
    }
}
