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

//! Decoding of reflective field accesses.
//!
//! Writes made through the reflection API bypass field watchpoints, so the engine intercepts
//! method entry on the reflective field type and rebuilds the access from the call itself:
//! `field.set(target, value)`, `field.setInt(target, 3)`, `field.get(target)` and so on.

use sidetrack_common::types::{ObjectRef, PrimitiveKind, Value};

use crate::{Debuggee, FieldInfo, VmResult};

/// Which member of the reflective accessor family was entered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Accessor {
    /// `set`, or a typed setter such as `setLong` carrying its parameter kind
    Set(Option<PrimitiveKind>),
    /// `get` or a typed getter
    Get,
}

impl Accessor {
    /// Classify a method name; anything outside the set/get family (`setAccessible`,
    /// `getName`, ...) yields `None`
    pub(crate) fn classify(method: &str) -> Option<Self> {
        if method == "set" {
            return Some(Self::Set(None));
        }
        if method == "get" {
            return Some(Self::Get);
        }
        if let Some(suffix) = method.strip_prefix("set") {
            return PrimitiveKind::from_accessor_suffix(suffix).map(|kind| Self::Set(Some(kind)));
        }
        method
            .strip_prefix("get")
            .and_then(PrimitiveKind::from_accessor_suffix)
            .map(|_| Self::Get)
    }
}

/// A field access reconstructed from a reflective call
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ReflectiveAccess {
    /// The call is about to store `new` over `old`
    Write { object: Option<ObjectRef>, field: FieldInfo, old: Value, new: Value },
    /// The call is about to read `value`
    Read { object: Option<ObjectRef>, field: FieldInfo, value: Value },
}

/// Rebuild the access performed by a reflective call on the field mirror `receiver`.
///
/// Returns `None` for calls that will fail in the target before touching the field: a missing
/// or null target object for an instance field, or a value the field cannot accept.
pub(crate) fn decode(
    vm: &dyn Debuggee,
    accessor: Accessor,
    receiver: ObjectRef,
    arguments: &[Value],
) -> VmResult<Option<ReflectiveAccess>> {
    let field = vm.reflected_field(receiver.id)?;

    let object = if field.is_static {
        None
    } else {
        match arguments.first().and_then(Value::as_object) {
            Some(object) => Some(object),
            None => return Ok(None),
        }
    };
    let current = vm.get_field(object.map(|o| o.id), field.id)?;

    match accessor {
        Accessor::Get => Ok(Some(ReflectiveAccess::Read { object, field, value: current })),
        Accessor::Set(kind) => {
            let Some(raw) = arguments.get(1).copied() else {
                return Ok(None);
            };
            let Some(new) = convert(vm, &field, kind, raw)? else {
                return Ok(None);
            };
            Ok(Some(ReflectiveAccess::Write { object, field, old: current, new }))
        }
    }
}

/// Convert the argument of a setter to the value the field will actually hold
fn convert(
    vm: &dyn Debuggee,
    field: &FieldInfo,
    setter_kind: Option<PrimitiveKind>,
    raw: Value,
) -> VmResult<Option<Value>> {
    let Some(field_kind) = field.signature.primitive() else {
        // Typed setters only apply to primitive fields
        return Ok(setter_kind.is_none().then_some(raw));
    };

    let value = match (setter_kind, raw) {
        (None, Value::Object(boxed)) => vm.unbox(boxed.id)?,
        (None, Value::Null) => return Ok(None),
        _ => raw,
    };
    Ok(value.widen_to(field_kind))
}
