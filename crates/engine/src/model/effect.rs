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

//! Recorded mutations and sets of them.

use std::{fmt, ops::Deref, sync::Arc};

use sidetrack_common::{sidetrack_assert_ne, types::ObjectId};
use tracing::trace;

use crate::{CaptureError, Debuggee, Location, Pin, PinTable, Snapshot, VmResult};

/// One observed mutation: `location` went from `before` to `after`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Effect {
    location: Location,
    before: Snapshot,
    after: Snapshot,
}

impl Effect {
    /// Create an effect, or `None` if `before` and `after` are structurally equal
    pub fn new(location: Location, before: Snapshot, after: Snapshot) -> Option<Self> {
        (before != after).then_some(Self { location, before, after })
    }

    /// The mutated location
    pub fn location(&self) -> &Location {
        &self.location
    }

    /// State before the mutation
    pub fn before(&self) -> &Snapshot {
        &self.before
    }

    /// State after the mutation
    pub fn after(&self) -> &Snapshot {
        &self.after
    }

    /// Whether this effect changed array contents in place rather than rebinding a location
    pub fn is_content_change(&self) -> bool {
        match (self.before.array(), self.after.array()) {
            (Some(a), Some(b)) => a.id == b.id,
            _ => false,
        }
    }

    /// Write `before` back
    pub fn undo(&self, vm: &dyn Debuggee) -> Result<(), CaptureError> {
        sidetrack_assert_ne!(self.before, self.after, "no-op effect on {}", self.location);
        trace!(effect = %self, "undo");
        self.location.write(vm, &self.before).map_err(|source| self.write_back_error(source))
    }

    /// Write `after` back
    pub fn redo(&self, vm: &dyn Debuggee) -> Result<(), CaptureError> {
        trace!(effect = %self, "redo");
        self.location.write(vm, &self.after).map_err(|source| self.write_back_error(source))
    }

    fn write_back_error(&self, source: crate::VmError) -> CaptureError {
        CaptureError::WriteBack { location: self.location.clone(), source }
    }

    /// Objects that must stay alive for this effect to be undone or redone
    pub fn referenced_objects(&self) -> impl Iterator<Item = ObjectId> {
        let mut ids = self.before.referenced_objects();
        ids.extend(self.after.referenced_objects());
        if let Location::InstanceField { object, .. } = &self.location {
            ids.push(object.id);
        }
        ids.into_iter()
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} -> {}", self.location, self.before, self.after)
    }
}

/// The side effects of one evaluation.
///
/// Holds at most one effect per location, in the order the locations were first touched, and
/// keeps every object those effects reference pinned until the set is dropped, so that the set
/// can be redone or undone at any later point.
#[derive(Debug, Clone, Default)]
pub struct EffectSet {
    effects: Vec<Effect>,
    pins: Vec<Pin>,
}

impl EffectSet {
    /// An empty set
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a set from effects, pinning everything they reference
    pub fn pinned(effects: Vec<Effect>, pins: &Arc<PinTable>) -> VmResult<Self> {
        let mut set = Self::empty();
        for effect in effects {
            if set.find(effect.location()).is_some() {
                continue;
            }
            set.pins.extend(pins.acquire_all(effect.referenced_objects())?);
            set.effects.push(effect);
        }
        Ok(set)
    }

    /// Effect recorded for `location`, if any
    pub fn find(&self, location: &Location) -> Option<&Effect> {
        self.effects.iter().find(|e| e.location() == location)
    }

    /// Undo all effects, most recent first
    pub fn undo_all(&self, vm: &dyn Debuggee) -> Result<(), CaptureError> {
        self.effects.iter().rev().try_for_each(|e| e.undo(vm))
    }

    /// Redo all effects, oldest first
    pub fn redo_all(&self, vm: &dyn Debuggee) -> Result<(), CaptureError> {
        self.effects.iter().try_for_each(|e| e.redo(vm))
    }

    /// Consume the set, releasing its pins
    pub fn into_effects(self) -> Vec<Effect> {
        self.effects
    }
}

impl Deref for EffectSet {
    type Target = [Effect];

    fn deref(&self) -> &Self::Target {
        &self.effects
    }
}

impl<'a> IntoIterator for &'a EffectSet {
    type Item = &'a Effect;
    type IntoIter = std::slice::Iter<'a, Effect>;

    fn into_iter(self) -> Self::IntoIter {
        self.effects.iter()
    }
}

impl PartialEq for EffectSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|e| other.contains(e))
    }
}

impl fmt::Display for EffectSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, effect) in self.effects.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{effect}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use sidetrack_common::types::{FieldId, TypeId, TypeSignature, Value};

    use super::*;
    use crate::FieldInfo;

    fn static_field(id: u64) -> Location {
        Location::StaticField {
            field: Arc::new(FieldInfo {
                id: FieldId(id),
                declaring_type: TypeId(1),
                declaring_type_name: "Counter".into(),
                name: "count".into(),
                signature: TypeSignature::parse("I").unwrap(),
                is_static: true,
                is_final: false,
            }),
        }
    }

    #[test]
    fn test_no_op_effects_are_rejected() {
        let loc = static_field(1);
        assert!(Effect::new(
            loc.clone(),
            Snapshot::Scalar(Value::Int(0)),
            Snapshot::Scalar(Value::Int(0))
        )
        .is_none());

        let effect =
            Effect::new(loc, Snapshot::Scalar(Value::Int(0)), Snapshot::Scalar(Value::Int(1)))
                .unwrap();
        assert_eq!(effect.to_string(), "static Counter.count: 0 -> 1");
        assert!(!effect.is_content_change());
    }

    #[test]
    fn test_effect_equality_uses_location_identity() {
        let a = Effect::new(
            static_field(7),
            Snapshot::Scalar(Value::Int(0)),
            Snapshot::Scalar(Value::Int(1)),
        );
        let b = Effect::new(
            static_field(7),
            Snapshot::Scalar(Value::Int(0)),
            Snapshot::Scalar(Value::Int(1)),
        );
        assert_eq!(a, b);
    }
}
