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

//! Opaque identities handed out by the debugged VM.
//!
//! All identities are stable for the lifetime of the mirrored entity. Object ids are assigned
//! in allocation order, which the capture engine relies on to tell objects created during a
//! candidate evaluation apart from pre-existing heap state.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! vm_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Clone,
            Copy,
            Default,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            Serialize,
            Deserialize,
        )]
        pub struct $name(pub u64);

        impl $name {
            /// Raw numeric id as assigned by the VM
            pub fn raw(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }
    };
}

vm_id!(
    /// Unique id of a heap object (instance or array)
    ObjectId,
    "obj"
);

vm_id!(
    /// Id of a thread in the debuggee
    ThreadId,
    "thread"
);

vm_id!(
    /// Id of a field declared by a loaded type
    FieldId,
    "field"
);

vm_id!(
    /// Id of a loaded reference type
    TypeId,
    "type"
);

vm_id!(
    /// Id of an event request registered with the debugger back-end
    RequestId,
    "req"
);

impl ObjectId {
    /// Whether this object was allocated after the given allocation watermark
    pub fn allocated_after(&self, floor: ObjectId) -> bool {
        self.0 > floor.0
    }
}
