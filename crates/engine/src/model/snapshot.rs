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

//! Immutable deep copies of values, used to diff and restore debuggee state.

use std::{
    fmt,
    hash::{Hash, Hasher},
};

use itertools::Itertools;
use sidetrack_common::types::{ObjectId, ObjectRef, Value};

use crate::{Debuggee, VmResult};

/// A value frozen at a point in time.
///
/// Array snapshots copy the array's contents, recursing into nested arrays up to the array's
/// dimensionality. They also remember which array object they were taken from, so that the
/// contents can later be written back into that very object; this identity does not take part
/// in equality, which is purely structural.
#[derive(Debug, Clone)]
pub enum Snapshot {
    /// A primitive, `null`, or a reference to a non-array object
    Scalar(Value),
    /// A one-dimensional array and its elements
    SimpleArray {
        /// The array the contents were read from
        array: ObjectRef,
        /// Element values
        elements: Vec<Value>,
    },
    /// A multi-dimensional array; each element is a nested snapshot (or a `null` scalar)
    NestedArray {
        /// The array the contents were read from
        array: ObjectRef,
        /// Element snapshots
        elements: Vec<Snapshot>,
    },
}

impl Snapshot {
    /// Snapshot `value`, reading array contents from the debuggee
    pub fn capture(vm: &dyn Debuggee, value: Value) -> VmResult<Self> {
        let Some(array) = value.as_array() else {
            return Ok(Self::Scalar(value));
        };

        let values = vm.array_values(array.id)?;
        if array.dimensions().unwrap_or(1) <= 1 {
            return Ok(Self::SimpleArray { array, elements: values });
        }

        let elements =
            values.into_iter().map(|v| Self::capture(vm, v)).collect::<VmResult<Vec<_>>>()?;
        Ok(Self::NestedArray { array, elements })
    }

    /// Re-read the contents of the snapshotted array. Scalars are returned unchanged.
    pub fn refresh(&self, vm: &dyn Debuggee) -> VmResult<Self> {
        match self.array() {
            Some(array) => Self::capture(vm, Value::Object(array)),
            None => Ok(self.clone()),
        }
    }

    /// The snapshotted array, if this is an array snapshot
    pub fn array(&self) -> Option<ObjectRef> {
        match self {
            Self::Scalar(_) => None,
            Self::SimpleArray { array, .. } | Self::NestedArray { array, .. } => Some(*array),
        }
    }

    /// Whether this is an array snapshot
    pub fn is_array(&self) -> bool {
        self.array().is_some()
    }

    /// The top-level value: the scalar itself, or a reference to the snapshotted array
    pub fn as_value(&self) -> Value {
        match self {
            Self::Scalar(value) => *value,
            Self::SimpleArray { array, .. } | Self::NestedArray { array, .. } => {
                Value::Object(*array)
            }
        }
    }

    /// Every object this snapshot refers to, directly or through array elements
    pub fn referenced_objects(&self) -> Vec<ObjectId> {
        let mut ids = Vec::new();
        self.collect_objects(&mut ids);
        ids.into_iter().unique().collect()
    }

    fn collect_objects(&self, ids: &mut Vec<ObjectId>) {
        match self {
            Self::Scalar(value) => ids.extend(value.object_id()),
            Self::SimpleArray { array, elements } => {
                ids.push(array.id);
                ids.extend(elements.iter().filter_map(Value::object_id));
            }
            Self::NestedArray { array, elements } => {
                ids.push(array.id);
                elements.iter().for_each(|e| e.collect_objects(ids));
            }
        }
    }

    /// Write the snapshotted contents back into the snapshotted array object, in place.
    ///
    /// For nested arrays the row references are restored first, then each row's contents.
    /// Scalars have no contents and are a no-op.
    pub fn restore_contents(&self, vm: &dyn Debuggee) -> VmResult<()> {
        match self {
            Self::Scalar(_) => Ok(()),
            Self::SimpleArray { array, elements } => vm.set_array_values(array.id, elements),
            Self::NestedArray { array, elements } => {
                let rows: Vec<Value> = elements.iter().map(Self::as_value).collect();
                vm.set_array_values(array.id, &rows)?;
                elements.iter().try_for_each(|row| row.restore_contents(vm))
            }
        }
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Scalar(a), Self::Scalar(b)) => a == b,
            (Self::SimpleArray { elements: a, .. }, Self::SimpleArray { elements: b, .. }) => {
                a == b
            }
            (Self::NestedArray { elements: a, .. }, Self::NestedArray { elements: b, .. }) => {
                a == b
            }
            _ => false,
        }
    }
}

impl Eq for Snapshot {}

impl Hash for Snapshot {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Scalar(value) => value.hash(state),
            Self::SimpleArray { elements, .. } => elements.hash(state),
            Self::NestedArray { elements, .. } => elements.hash(state),
        }
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(value) => write!(f, "{value}"),
            Self::SimpleArray { elements, .. } => write!(f, "[{}]", elements.iter().join(", ")),
            Self::NestedArray { elements, .. } => write!(f, "[{}]", elements.iter().join(", ")),
        }
    }
}
