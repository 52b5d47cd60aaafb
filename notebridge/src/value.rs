//! Value vocabularies on both sides of the managed/native boundary.
//!
//! The native runtime speaks [`NativeValue`]: primitives, date/times, lists,
//! raw handle descriptors, and opaque markers for native types the bridge
//! does not manage. Calling code only ever sees [`Value`], where every
//! handle has been swapped for a typed proxy. The conversion in both
//! directions lives in the proxy layer.

use chrono::{DateTime, Utc};

use crate::handle::HandleDescriptor;
use crate::proxy::AnyProxy;

/// What the native layer produces and consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    DateTime(DateTime<Utc>),
    List(Vec<NativeValue>),
    Handle(HandleDescriptor),
    /// A native type that is neither a primitive nor a managed handle
    /// category. The tag names the native type for diagnostics.
    Opaque(String),
}

/// What calling code sees. Same shape as [`NativeValue`], with handles
/// replaced by proxies. `Opaque` survives the crossing as an explicit
/// marker — unmanageable native state is never silently passed through.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    DateTime(DateTime<Utc>),
    List(Vec<Value>),
    Proxy(AnyProxy),
    Opaque(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_proxy(&self) -> Option<&AnyProxy> {
        match self {
            Value::Proxy(p) => Some(p),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(dt: DateTime<Utc>) -> Self {
        Value::DateTime(dt)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl From<AnyProxy> for Value {
    fn from(p: AnyProxy) -> Self {
        Value::Proxy(p)
    }
}
