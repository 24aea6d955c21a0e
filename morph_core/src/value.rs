//! Dynamic values flowing through specialization dispatch.
//!
//! Guards, cache initializers and bodies all see arguments as [`Value`]s.
//! Equality is *identity-like*: doubles compare by bit pattern (so a cached
//! `NaN` key still matches itself) and objects compare by reference. This is
//! the equality the cache store uses when deciding whether an existing cache
//! instance already covers a key.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Value Type Tags
// =============================================================================

/// Runtime type tag of a [`Value`].
///
/// Specialization parameter lists and implicit casts are declared in terms
/// of these tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueType {
    /// The null value.
    Null = 0,
    /// Boolean.
    Bool = 1,
    /// 32-bit signed integer.
    Int = 2,
    /// 64-bit signed integer.
    Long = 3,
    /// 64-bit float.
    Double = 4,
    /// Immutable string.
    Str = 5,
    /// Host object reference.
    Object = 6,
}

impl ValueType {
    /// Human readable name used in error messages.
    pub const fn name(self) -> &'static str {
        match self {
            ValueType::Null => "null",
            ValueType::Bool => "bool",
            ValueType::Int => "int",
            ValueType::Long => "long",
            ValueType::Double => "double",
            ValueType::Str => "str",
            ValueType::Object => "object",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Object References
// =============================================================================

/// Shared reference to a host object.
///
/// Two `ObjectRef`s are equal only if they point at the same allocation.
#[derive(Clone)]
pub struct ObjectRef {
    inner: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl ObjectRef {
    /// Wrap a host value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Wrap an already shared host value.
    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self {
            inner: value,
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Downcast to the concrete host type.
    #[inline]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Whether the referenced object has type `T`.
    #[inline]
    pub fn is<T: Any>(&self) -> bool {
        self.inner.is::<T>()
    }

    /// Rust type name of the referenced object.
    #[inline]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Address of the referenced allocation (identity key).
    #[inline]
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    /// Reference identity.
    #[inline]
    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        self.addr() == other.addr()
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for ObjectRef {}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:#x}", self.type_name, self.addr())
    }
}

// =============================================================================
// Value
// =============================================================================

/// A dynamically typed value.
#[derive(Clone, Default)]
pub enum Value {
    /// Null / absent.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// 32-bit integer.
    Int(i32),
    /// 64-bit integer.
    Long(i64),
    /// 64-bit float.
    Double(f64),
    /// Immutable shared string.
    Str(Arc<str>),
    /// Host object.
    Object(ObjectRef),
}

impl Value {
    /// Build a string value.
    pub fn str(s: &str) -> Self {
        Value::Str(Arc::from(s))
    }

    /// Build an object value.
    pub fn object<T: Any + Send + Sync>(value: T) -> Self {
        Value::Object(ObjectRef::new(value))
    }

    /// Type tag of this value.
    #[inline]
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Null,
            Value::Bool(_) => ValueType::Bool,
            Value::Int(_) => ValueType::Int,
            Value::Long(_) => ValueType::Long,
            Value::Double(_) => ValueType::Double,
            Value::Str(_) => ValueType::Str,
            Value::Object(_) => ValueType::Object,
        }
    }

    /// Whether this value is the zero value of its representation.
    ///
    /// Cache parameters declared `never_default` must never hold such a value.
    pub fn is_default(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Bool(b) => !*b,
            Value::Int(i) => *i == 0,
            Value::Long(l) => *l == 0,
            Value::Double(d) => d.to_bits() == 0,
            Value::Str(s) => s.is_empty(),
            Value::Object(_) => false,
        }
    }

    /// Whether this is `Null`.
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Boolean payload.
    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Int payload.
    #[inline]
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Long payload.
    #[inline]
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(l) => Some(*l),
            _ => None,
        }
    }

    /// Double payload.
    #[inline]
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    /// String payload.
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Object payload.
    #[inline]
    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Any integral payload widened to `i64`.
    #[inline]
    pub fn as_integral(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i as i64),
            Value::Long(l) => Some(*l),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl Eq for Value {}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Long(l) => write!(f, "{}L", l),
            Value::Double(d) => write!(f, "{:?}", d),
            Value::Str(s) => write!(f, "{:?}", &**s),
            Value::Object(o) => write!(f, "{:?}", o),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            other => write!(f, "{:?}", other),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i)
    }
}

impl From<i64> for Value {
    fn from(l: i64) -> Self {
        Value::Long(l)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl From<ObjectRef> for Value {
    fn from(o: ObjectRef) -> Self {
        Value::Object(o)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_types() {
        assert_eq!(Value::Null.value_type(), ValueType::Null);
        assert_eq!(Value::from(1).value_type(), ValueType::Int);
        assert_eq!(Value::from(1i64).value_type(), ValueType::Long);
        assert_eq!(Value::from(1.5).value_type(), ValueType::Double);
        assert_eq!(Value::from("a").value_type(), ValueType::Str);
        assert_eq!(Value::object(5u8).value_type(), ValueType::Object);
    }

    #[test]
    fn test_default_values() {
        assert!(Value::Null.is_default());
        assert!(Value::Int(0).is_default());
        assert!(Value::Long(0).is_default());
        assert!(Value::Bool(false).is_default());
        assert!(Value::Double(0.0).is_default());
        assert!(Value::str("").is_default());

        assert!(!Value::Int(1).is_default());
        assert!(!Value::Double(-0.0).is_default());
        assert!(!Value::object(0u32).is_default());
    }

    #[test]
    fn test_double_equality_is_bitwise() {
        assert_eq!(Value::Double(f64::NAN), Value::Double(f64::NAN));
        assert_ne!(Value::Double(0.0), Value::Double(-0.0));
    }

    #[test]
    fn test_object_identity() {
        let a = ObjectRef::new(String::from("x"));
        let b = ObjectRef::new(String::from("x"));
        assert_eq!(Value::Object(a.clone()), Value::Object(a.clone()));
        assert_ne!(Value::Object(a.clone()), Value::Object(b));
        assert_eq!(a.downcast_ref::<String>().map(String::as_str), Some("x"));
        assert!(!a.is::<u32>());
    }

    #[test]
    fn test_mixed_kinds_never_equal() {
        assert_ne!(Value::Int(1), Value::Long(1));
        assert_ne!(Value::Int(1), Value::Double(1.0));
    }

    #[test]
    fn test_integral_widening() {
        assert_eq!(Value::Int(7).as_integral(), Some(7));
        assert_eq!(Value::Long(-7).as_integral(), Some(-7));
        assert_eq!(Value::Double(7.0).as_integral(), None);
    }
}
