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

//! Addressable places in the debuggee whose value an effect can change.

use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use sidetrack_common::types::{ObjectRef, ThreadId, Value};

use crate::{Debuggee, FieldInfo, Snapshot, VmError, VmResult};

/// A place holding a value.
///
/// Locations compare by VM identity: two `InstanceField` locations are equal when they name the
/// same field of the same object, regardless of what the field currently holds. A location is a
/// back-reference only; it is valid while the referenced object is alive or pinned.
#[derive(Debug, Clone)]
pub enum Location {
    /// A local variable in the current frame of a thread
    Variable {
        /// Variable name
        name: String,
        /// Owning thread
        thread: ThreadId,
    },
    /// An instance field of a specific object
    InstanceField {
        /// Receiver
        object: ObjectRef,
        /// The field
        field: Arc<FieldInfo>,
    },
    /// A static field
    StaticField {
        /// The field
        field: Arc<FieldInfo>,
    },
    /// One element of an array
    ArraySlot {
        /// The array
        array: ObjectRef,
        /// Element index
        index: usize,
    },
    /// The contents of an array, independent of any variable referencing it
    WholeArray {
        /// The array
        array: ObjectRef,
    },
}

impl Location {
    /// Location of a field; `object` is `None` for statics
    pub fn field(object: Option<ObjectRef>, field: Arc<FieldInfo>) -> Self {
        match object {
            Some(object) => Self::InstanceField { object, field },
            None => Self::StaticField { field },
        }
    }

    /// Whether writes to this location are reported by field watchpoints
    pub fn is_watched(&self) -> bool {
        matches!(self, Self::InstanceField { .. } | Self::StaticField { .. })
    }

    /// Read the raw value currently stored at this location
    pub fn read(&self, vm: &dyn Debuggee) -> VmResult<Value> {
        match self {
            Self::Variable { name, thread } => vm.get_local(*thread, name),
            Self::InstanceField { object, field } => vm.get_field(Some(object.id), field.id),
            Self::StaticField { field } => vm.get_field(None, field.id),
            Self::ArraySlot { array, index } => {
                let values = vm.array_values(array.id)?;
                values.get(*index).copied().ok_or(VmError::IndexOutOfBounds {
                    array: array.id,
                    index: *index,
                    length: values.len(),
                })
            }
            Self::WholeArray { array } => Ok(Value::Object(*array)),
        }
    }

    /// Snapshot the current value, including array contents
    pub fn snapshot(&self, vm: &dyn Debuggee) -> VmResult<Snapshot> {
        Snapshot::capture(vm, self.read(vm)?)
    }

    fn store(&self, vm: &dyn Debuggee, value: Value) -> VmResult<()> {
        match self {
            Self::Variable { name, thread } => vm.set_local(*thread, name, value),
            Self::InstanceField { object, field } => vm.set_field(Some(object.id), field.id, value),
            Self::StaticField { field } => vm.set_field(None, field.id, value),
            Self::ArraySlot { array, index } => vm.set_array_value(array.id, *index, value),
            Self::WholeArray { array } => match value.object_id() {
                Some(id) if id == array.id => Ok(()),
                _ => Err(VmError::TypeMismatch {
                    target: self.to_string(),
                    expected: "the same array".to_string(),
                    value: value.to_string(),
                }),
            },
        }
    }

    /// Make this location hold `snapshot`.
    ///
    /// Scalars are stored directly. Array snapshots are written element by element into the array
    /// object currently reachable from the location when it is the snapshotted array; otherwise the
    /// reference is first pointed back at the snapshotted array, whose contents are then restored.
    /// Either way no new array is ever created, so other aliases observe the restored contents.
    pub fn write(&self, vm: &dyn Debuggee, snapshot: &Snapshot) -> VmResult<()> {
        let Some(array) = snapshot.array() else {
            return self.store(vm, snapshot.as_value());
        };

        let current = self.read(vm)?;
        if current.object_id() != Some(array.id) {
            self.store(vm, Value::Object(array))?;
        }
        snapshot.restore_contents(vm)
    }
}

impl PartialEq for Location {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Variable { name: a, thread: ta },
                Self::Variable { name: b, thread: tb },
            ) => a == b && ta == tb,
            (
                Self::InstanceField { object: oa, field: fa },
                Self::InstanceField { object: ob, field: fb },
            ) => oa.id == ob.id && fa.id == fb.id,
            (Self::StaticField { field: a }, Self::StaticField { field: b }) => a.id == b.id,
            (
                Self::ArraySlot { array: a, index: ia },
                Self::ArraySlot { array: b, index: ib },
            ) => a.id == b.id && ia == ib,
            (Self::WholeArray { array: a }, Self::WholeArray { array: b }) => a.id == b.id,
            _ => false,
        }
    }
}

impl Eq for Location {}

impl Hash for Location {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Variable { name, thread } => {
                name.hash(state);
                thread.hash(state);
            }
            Self::InstanceField { object, field } => {
                object.id.hash(state);
                field.id.hash(state);
            }
            Self::StaticField { field } => field.id.hash(state),
            Self::ArraySlot { array, index } => {
                array.id.hash(state);
                index.hash(state);
            }
            Self::WholeArray { array } => array.id.hash(state),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Variable { name, thread } => write!(f, "{name}@{thread}"),
            Self::InstanceField { object, field } => write!(f, "{}.{}", object.id, field.name),
            Self::StaticField { field } => write!(f, "static {}", field.qualified_name()),
            Self::ArraySlot { array, index } => write!(f, "{}[{index}]", array.id),
            Self::WholeArray { array } => write!(f, "{}[*]", array.id),
        }
    }
}
