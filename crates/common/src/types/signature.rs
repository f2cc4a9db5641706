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

//! Declared types of fields and locals, in the VM's descriptor notation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Primitive value kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimitiveKind {
    /// `Z`
    Boolean,
    /// `B`
    Byte,
    /// `C`
    Char,
    /// `S`
    Short,
    /// `I`
    Int,
    /// `J`
    Long,
    /// `F`
    Float,
    /// `D`
    Double,
}

impl PrimitiveKind {
    /// Descriptor character of this kind
    pub fn descriptor(&self) -> char {
        match self {
            Self::Boolean => 'Z',
            Self::Byte => 'B',
            Self::Char => 'C',
            Self::Short => 'S',
            Self::Int => 'I',
            Self::Long => 'J',
            Self::Float => 'F',
            Self::Double => 'D',
        }
    }

    fn from_descriptor(c: char) -> Option<Self> {
        Some(match c {
            'Z' => Self::Boolean,
            'B' => Self::Byte,
            'C' => Self::Char,
            'S' => Self::Short,
            'I' => Self::Int,
            'J' => Self::Long,
            'F' => Self::Float,
            'D' => Self::Double,
            _ => return None,
        })
    }

    /// Resolve the kind targeted by a typed reflective setter such as `setInt`
    pub fn from_accessor_suffix(suffix: &str) -> Option<Self> {
        Some(match suffix {
            "Boolean" => Self::Boolean,
            "Byte" => Self::Byte,
            "Char" => Self::Char,
            "Short" => Self::Short,
            "Int" => Self::Int,
            "Long" => Self::Long,
            "Float" => Self::Float,
            "Double" => Self::Double,
            _ => return None,
        })
    }
}

/// Declared type of a field, local or array component
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeSignature {
    /// A primitive type
    Primitive(PrimitiveKind),
    /// An array with the given component type
    Array(Box<TypeSignature>),
    /// A class or interface, by dotted name (e.g. `java.lang.Object`)
    Reference(String),
}

impl TypeSignature {
    /// Parse a descriptor such as `I`, `[[J` or `Ljava/lang/String;`.
    pub fn parse(descriptor: &str) -> Option<Self> {
        let (sig, rest) = Self::parse_prefix(descriptor)?;
        rest.is_empty().then_some(sig)
    }

    fn parse_prefix(s: &str) -> Option<(Self, &str)> {
        let mut chars = s.chars();
        match chars.next()? {
            '[' => {
                let (component, rest) = Self::parse_prefix(&s[1..])?;
                Some((Self::Array(Box::new(component)), rest))
            }
            'L' => {
                let end = s.find(';')?;
                let name = s[1..end].replace('/', ".");
                if name.is_empty() {
                    return None;
                }
                Some((Self::Reference(name), &s[end + 1..]))
            }
            c => Some((Self::Primitive(PrimitiveKind::from_descriptor(c)?), &s[1..])),
        }
    }

    /// Render back to descriptor notation
    pub fn descriptor(&self) -> String {
        match self {
            Self::Primitive(kind) => kind.descriptor().to_string(),
            Self::Array(component) => format!("[{}", component.descriptor()),
            Self::Reference(name) => format!("L{};", name.replace('.', "/")),
        }
    }

    /// Number of array dimensions, zero for non-array types
    pub fn dimensions(&self) -> u8 {
        match self {
            Self::Array(component) => component.dimensions().saturating_add(1),
            _ => 0,
        }
    }

    /// The primitive kind, if this is a primitive type
    pub fn primitive(&self) -> Option<PrimitiveKind> {
        match self {
            Self::Primitive(kind) => Some(*kind),
            _ => None,
        }
    }

    /// Whether a value of this declared type may be an array at runtime.
    ///
    /// True for array types and for the reference types listed in `array_supertypes`
    /// (the root types every array is assignable to).
    pub fn could_hold_array(&self, array_supertypes: &[String]) -> bool {
        match self {
            Self::Array(_) => true,
            Self::Reference(name) => array_supertypes.iter().any(|s| s == name),
            Self::Primitive(_) => false,
        }
    }
}

impl fmt::Display for TypeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primitive(kind) => write!(f, "{}", format!("{kind:?}").to_lowercase()),
            Self::Array(component) => write!(f, "{component}[]"),
            Self::Reference(name) => write!(f, "{name}"),
        }
    }
}
