use std::fmt::Display;

use crate::heap::HeapRef;

/// VM-internal representation of Lox value.
#[derive(Debug, Clone)]
pub enum Value {
    /// Nil is a type and a value in Lox.
    Nil,
    /// Boolean backed by Rust bool,
    Boolean(bool),
    /// Lox has a single 'number' base type, backed by f64.
    /// Even though pos/neg infinity and NaN are allowed, we make no guarantees about how they work.
    Number(f64),
    /// Object is a heap-allocated, garbage collected value
    Object(HeapRef),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            // Lox is lax about comparing NaNs and stuff
            #[allow(clippy::float_cmp)]
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Nil, Self::Nil) => true,
            // Strings are interned, so identity is content equality for them too.
            (Self::Object(a), Self::Object(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(val) => write!(f, "{}", val),
            Self::Boolean(b) => write!(f, "{}", b),
            Self::Nil => write!(f, "nil"),
            Self::Object(o) => Display::fmt(o, f),
        }
    }
}

impl Value {
    /// Only nil and false are falsey.
    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::Nil | Value::Boolean(false))
    }

    /// The number inside, if this is one.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The heap reference inside, if this is an object.
    pub fn as_object(&self) -> Option<&HeapRef> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Same value, compared bit-for-bit for numbers. Used to deduplicate constants,
    /// where `0 == -0` must not merge the two.
    pub(crate) fn is_same_constant(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a.to_bits() == b.to_bits(),
            _ => self == other,
        }
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Number(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<HeapRef> for Value {
    fn from(r: HeapRef) -> Self {
        Value::Object(r)
    }
}
