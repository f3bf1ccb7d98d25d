//! Dynamic value model

use crate::object::{ClassDef, Instance};
use std::sync::Arc;

/// A managed value.
///
/// Primitives are stored inline; strings, arrays, instances and type
/// objects are reference-counted. Instance lifetime is decided by the
/// reference count alone — the bridge's handle table only aliases values,
/// it never owns them exclusively.
#[derive(Clone, Debug)]
pub enum Value {
    /// Absence of a value (null reference)
    Null,
    /// Boolean
    Bool(bool),
    /// Signed 8-bit integer
    I8(i8),
    /// Unsigned 8-bit integer
    U8(u8),
    /// Signed 16-bit integer
    I16(i16),
    /// Unsigned 16-bit integer
    U16(u16),
    /// Signed 32-bit integer
    I32(i32),
    /// Unsigned 32-bit integer
    U32(u32),
    /// Signed 64-bit integer
    I64(i64),
    /// Unsigned 64-bit integer
    U64(u64),
    /// 32-bit float
    F32(f32),
    /// 64-bit float
    F64(f64),
    /// Immutable string
    Str(Arc<str>),
    /// Array of values with a declared element type
    Array(Arc<ArrayValue>),
    /// Object instance
    Object(Arc<Instance>),
    /// Type object (the managed face of a class definition)
    Type(Arc<ClassDef>),
}

/// Array payload: element type name plus items.
#[derive(Debug)]
pub struct ArrayValue {
    /// Canonical element type name (e.g. `i32`, `string`)
    pub elem_type: String,
    /// Array contents
    pub items: Vec<Value>,
}

impl Value {
    /// Build a string value.
    pub fn str(s: impl AsRef<str>) -> Self {
        Value::Str(Arc::from(s.as_ref()))
    }

    /// Build an array value.
    pub fn array(elem_type: impl Into<String>, items: Vec<Value>) -> Self {
        Value::Array(Arc::new(ArrayValue {
            elem_type: elem_type.into(),
            items,
        }))
    }

    /// Whether this is the null value.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Borrow the instance if this is an object value.
    pub fn as_object(&self) -> Option<&Arc<Instance>> {
        match self {
            Value::Object(inst) => Some(inst),
            _ => None,
        }
    }

    /// Borrow the class definition if this is a type object.
    pub fn as_type(&self) -> Option<&Arc<ClassDef>> {
        match self {
            Value::Type(class) => Some(class),
            _ => None,
        }
    }

    /// Borrow the string payload if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Canonical runtime type name of this value.
    pub fn type_name(&self) -> String {
        match self {
            Value::Null => "object".into(),
            Value::Bool(_) => "bool".into(),
            Value::I8(_) => "i8".into(),
            Value::U8(_) => "u8".into(),
            Value::I16(_) => "i16".into(),
            Value::U16(_) => "u16".into(),
            Value::I32(_) => "i32".into(),
            Value::U32(_) => "u32".into(),
            Value::I64(_) => "i64".into(),
            Value::U64(_) => "u64".into(),
            Value::F32(_) => "f32".into(),
            Value::F64(_) => "f64".into(),
            Value::Str(_) => "string".into(),
            Value::Array(a) => format!("{}[]", a.elem_type),
            Value::Object(inst) => inst.class().name.clone(),
            Value::Type(_) => "core.Type".into(),
        }
    }

    /// Identity comparison across the reference table.
    ///
    /// Reference values compare by pointer identity; inline values compare
    /// structurally. Used to decide whether two table entries alias the
    /// same target.
    pub fn identity_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::I8(a), Value::I8(b)) => a == b,
            (Value::U8(a), Value::U8(b)) => a == b,
            (Value::I16(a), Value::I16(b)) => a == b,
            (Value::U16(a), Value::U16(b)) => a == b,
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::U32(a), Value::U32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::U64(a), Value::U64(b)) => a == b,
            (Value::F32(a), Value::F32(b)) => a.to_bits() == b.to_bits(),
            (Value::F64(a), Value::F64(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Type(a), Value::Type(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ClassBuilder;

    #[test]
    fn test_type_names() {
        assert_eq!(Value::Bool(true).type_name(), "bool");
        assert_eq!(Value::I32(1).type_name(), "i32");
        assert_eq!(Value::str("x").type_name(), "string");
        assert_eq!(
            Value::array("i32", vec![Value::I32(1)]).type_name(),
            "i32[]"
        );
    }

    #[test]
    fn test_identity_objects_by_pointer() {
        let class = ClassBuilder::new("t.A").build();
        let a = Value::Object(Instance::new(class.clone()));
        let b = Value::Object(Instance::new(class));
        assert!(a.identity_eq(&a.clone()));
        assert!(!a.identity_eq(&b));
    }

    #[test]
    fn test_identity_strings_by_value() {
        assert!(Value::str("abc").identity_eq(&Value::str("abc")));
        assert!(!Value::str("abc").identity_eq(&Value::str("abd")));
    }
}
