// Sidetrack - side-effect capture for speculative evaluation
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Values read from or written to the debuggee.

use std::{
    fmt,
    hash::{Hash, Hasher},
};

use serde::{Deserialize, Serialize};

use super::{ObjectId, PrimitiveKind};

/// Runtime shape of a referenced object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RefKind {
    /// A plain instance (including strings and boxed primitives)
    Instance,
    /// An array; `dimensions` is 1 for `int[]`, 2 for `int[][]`, ...
    Array {
        /// Declared dimensionality of the array object
        dimensions: u8,
    },
}

/// A reference to a heap object together with its runtime shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    /// VM-assigned unique id
    pub id: ObjectId,
    /// Instance or array
    pub kind: RefKind,
}

impl ObjectRef {
    /// Reference to a plain instance
    pub fn instance(id: impl Into<ObjectId>) -> Self {
        Self { id: id.into(), kind: RefKind::Instance }
    }

    /// Reference to an array of the given dimensionality
    pub fn array(id: impl Into<ObjectId>, dimensions: u8) -> Self {
        Self { id: id.into(), kind: RefKind::Array { dimensions } }
    }

    /// Array dimensionality, `None` for instances
    pub fn dimensions(&self) -> Option<u8> {
        match self.kind {
            RefKind::Array { dimensions } => Some(dimensions),
            RefKind::Instance => None,
        }
    }

    /// Whether the referenced object is an array
    pub fn is_array(&self) -> bool {
        matches!(self.kind, RefKind::Array { .. })
    }
}

/// A single VM value.
///
/// Floating point values compare and hash by bit pattern, so `NaN == NaN` and `0.0 != -0.0`.
/// This is the identity a debugger needs: writing a value back must reproduce the exact bits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum Value {
    /// The null reference
    Null,
    /// `boolean`
    Boolean(bool),
    /// `byte`
    Byte(i8),
    /// `char` (UTF-16 code unit)
    Char(u16),
    /// `short`
    Short(i16),
    /// `int`
    Int(i32),
    /// `long`
    Long(i64),
    /// `float`
    Float(f32),
    /// `double`
    Double(f64),
    /// A non-null reference
    Object(ObjectRef),
}

impl Value {
    /// Whether this is the null reference
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The referenced object, if any
    pub fn as_object(&self) -> Option<ObjectRef> {
        match self {
            Self::Object(obj) => Some(*obj),
            _ => None,
        }
    }

    /// The referenced object, only if it is an array
    pub fn as_array(&self) -> Option<ObjectRef> {
        self.as_object().filter(ObjectRef::is_array)
    }

    /// Id of the referenced object, if any
    pub fn object_id(&self) -> Option<ObjectId> {
        self.as_object().map(|obj| obj.id)
    }

    /// Primitive kind of this value, `None` for references and null
    pub fn primitive_kind(&self) -> Option<PrimitiveKind> {
        Some(match self {
            Self::Boolean(_) => PrimitiveKind::Boolean,
            Self::Byte(_) => PrimitiveKind::Byte,
            Self::Char(_) => PrimitiveKind::Char,
            Self::Short(_) => PrimitiveKind::Short,
            Self::Int(_) => PrimitiveKind::Int,
            Self::Long(_) => PrimitiveKind::Long,
            Self::Float(_) => PrimitiveKind::Float,
            Self::Double(_) => PrimitiveKind::Double,
            Self::Null | Self::Object(_) => return None,
        })
    }

    /// Apply an identity or widening primitive conversion to `target`.
    ///
    /// Returns `None` when no such conversion exists (narrowing, boolean to numeric, references).
    pub fn widen_to(&self, target: PrimitiveKind) -> Option<Self> {
        use PrimitiveKind as K;

        if self.primitive_kind()? == target {
            return Some(*self);
        }

        let widened = match (*self, target) {
            (Self::Byte(v), K::Short) => Self::Short(v.into()),
            (Self::Byte(v), K::Int) => Self::Int(v.into()),
            (Self::Byte(v), K::Long) => Self::Long(v.into()),
            (Self::Byte(v), K::Float) => Self::Float(v.into()),
            (Self::Byte(v), K::Double) => Self::Double(v.into()),
            (Self::Short(v), K::Int) => Self::Int(v.into()),
            (Self::Short(v), K::Long) => Self::Long(v.into()),
            (Self::Short(v), K::Float) => Self::Float(v.into()),
            (Self::Short(v), K::Double) => Self::Double(v.into()),
            (Self::Char(v), K::Int) => Self::Int(v.into()),
            (Self::Char(v), K::Long) => Self::Long(v.into()),
            (Self::Char(v), K::Float) => Self::Float(v.into()),
            (Self::Char(v), K::Double) => Self::Double(v.into()),
            (Self::Int(v), K::Long) => Self::Long(v.into()),
            (Self::Int(v), K::Float) => Self::Float(v as f32),
            (Self::Int(v), K::Double) => Self::Double(v.into()),
            (Self::Long(v), K::Float) => Self::Float(v as f32),
            (Self::Long(v), K::Double) => Self::Double(v as f64),
            (Self::Float(v), K::Double) => Self::Double(v.into()),
            _ => return None,
        };
        Some(widened)
    }

    fn discriminant(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Boolean(_) => 1,
            Self::Byte(_) => 2,
            Self::Char(_) => 3,
            Self::Short(_) => 4,
            Self::Int(_) => 5,
            Self::Long(_) => 6,
            Self::Float(_) => 7,
            Self::Double(_) => 8,
            Self::Object(_) => 9,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Byte(a), Self::Byte(b)) => a == b,
            (Self::Char(a), Self::Char(b)) => a == b,
            (Self::Short(a), Self::Short(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Long(a), Self::Long(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Double(a), Self::Double(b)) => a.to_bits() == b.to_bits(),
            (Self::Object(a), Self::Object(b)) => a.id == b.id,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.discriminant().hash(state);
        match self {
            Self::Null => {}
            Self::Boolean(v) => v.hash(state),
            Self::Byte(v) => v.hash(state),
            Self::Char(v) => v.hash(state),
            Self::Short(v) => v.hash(state),
            Self::Int(v) => v.hash(state),
            Self::Long(v) => v.hash(state),
            Self::Float(v) => v.to_bits().hash(state),
            Self::Double(v) => v.to_bits().hash(state),
            Self::Object(obj) => obj.id.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Byte(v) => write!(f, "{v}"),
            Self::Char(v) => match char::from_u32(u32::from(*v)) {
                Some(c) => write!(f, "'{c}'"),
                None => write!(f, "'\\u{v:04x}'"),
            },
            Self::Short(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Long(v) => write!(f, "{v}L"),
            Self::Float(v) => write!(f, "{v}f"),
            Self::Double(v) => write!(f, "{v}"),
            Self::Object(obj) => write!(f, "{}", obj.id),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<ObjectRef> for Value {
    fn from(obj: ObjectRef) -> Self {
        Self::Object(obj)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_float_equality_is_bitwise() {
        crate::logging::ensure_test_logging(None);
        assert_eq!(Value::Double(f64::NAN), Value::Double(f64::NAN));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
        assert_ne!(Value::Int(1), Value::Long(1));
    }

    #[test]
    fn test_object_identity() {
        crate::logging::ensure_test_logging(None);
        // Shape is metadata; identity alone decides equality
        let a = Value::Object(ObjectRef::array(5u64, 1));
        let b = Value::Object(ObjectRef::array(5u64, 1));
        let c = Value::Object(ObjectRef::instance(6u64));

        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert!(a.as_array().is_some());
        assert!(c.as_array().is_none());
        assert_eq!(c.object_id(), Some(ObjectId(6)));
    }

    #[test]
    fn test_widening() {
        crate::logging::ensure_test_logging(None);
        assert_eq!(Value::Int(3).widen_to(PrimitiveKind::Long), Some(Value::Long(3)));
        assert_eq!(Value::Char(65).widen_to(PrimitiveKind::Int), Some(Value::Int(65)));
        assert_eq!(Value::Byte(-1).widen_to(PrimitiveKind::Double), Some(Value::Double(-1.0)));
        assert_eq!(Value::Long(3).widen_to(PrimitiveKind::Int), None);
        assert_eq!(Value::Boolean(true).widen_to(PrimitiveKind::Int), None);
        assert_eq!(Value::Null.widen_to(PrimitiveKind::Int), None);
        assert_eq!(Value::Short(2).widen_to(PrimitiveKind::Short), Some(Value::Short(2)));
    }

    #[test]
    fn test_display() {
        crate::logging::ensure_test_logging(None);
        assert_eq!(Value::Long(4).to_string(), "4L");
        assert_eq!(Value::Char(u16::from(b'x')).to_string(), "'x'");
        assert_eq!(Value::Object(ObjectRef::instance(2u64)).to_string(), "obj#2");
        assert_eq!(Value::Null.to_string(), "null");
    }
}
