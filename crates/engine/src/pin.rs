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

//! Collection pins for objects referenced by pending undo state.
//!
//! An undo snapshot that refers to an object the debuggee has since collected can never be
//! written back. Every object a session or effect set may need to restore is therefore pinned:
//! the first [`Pin`] on an object disables its collection in the debuggee, and dropping the last
//! one re-enables it.

use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::Mutex;
use sidetrack_common::types::ObjectId;
use tracing::{trace, warn};

use crate::{Debuggee, VmResult};

#[derive(Default)]
struct PinCounts {
    generation: u64,
    counts: HashMap<ObjectId, usize>,
}

/// Reference-counted registry of pinned objects
pub struct PinTable {
    vm: Arc<dyn Debuggee>,
    inner: Mutex<PinCounts>,
}

impl fmt::Debug for PinTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PinTable")
            .field("generation", &inner.generation)
            .field("pinned", &inner.counts.len())
            .finish()
    }
}

impl PinTable {
    /// Create an empty table pinning objects of `vm`
    pub fn new(vm: Arc<dyn Debuggee>) -> Arc<Self> {
        Arc::new(Self { vm, inner: Mutex::new(PinCounts::default()) })
    }

    /// Pin `object` until the returned handle is dropped
    pub fn acquire(self: &Arc<Self>, object: ObjectId) -> VmResult<Pin> {
        let mut inner = self.inner.lock();
        let count = inner.counts.get(&object).copied().unwrap_or(0);
        if count == 0 {
            self.vm.disable_collection(object)?;
            trace!(%object, "pinned");
        }
        inner.counts.insert(object, count + 1);
        Ok(Pin { table: Arc::clone(self), object, generation: inner.generation })
    }

    /// Pin every object in `objects`
    pub fn acquire_all(
        self: &Arc<Self>,
        objects: impl IntoIterator<Item = ObjectId>,
    ) -> VmResult<Vec<Pin>> {
        objects.into_iter().map(|id| self.acquire(id)).collect()
    }

    fn release(&self, object: ObjectId, generation: u64) {
        let mut inner = self.inner.lock();
        // Handles from before a `release_all` no longer own anything
        if inner.generation != generation {
            return;
        }
        let Some(count) = inner.counts.get_mut(&object) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            inner.counts.remove(&object);
            if let Err(e) = self.vm.enable_collection(object) {
                warn!(%object, error = %e, "failed to unpin object");
            } else {
                trace!(%object, "unpinned");
            }
        }
    }

    fn retain(&self, object: ObjectId, generation: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }
        match inner.counts.get_mut(&object) {
            Some(count) => {
                *count += 1;
                true
            }
            None => false,
        }
    }

    /// Re-enable collection of every pinned object, invalidating all outstanding handles.
    ///
    /// Returns the number of objects that were unpinned.
    pub fn release_all(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        let objects: Vec<ObjectId> = inner.counts.drain().map(|(id, _)| id).collect();
        for object in &objects {
            if let Err(e) = self.vm.enable_collection(*object) {
                warn!(%object, error = %e, "failed to unpin object");
            }
        }
        objects.len()
    }

    /// Number of live handles on `object`
    pub fn pin_count(&self, object: ObjectId) -> usize {
        self.inner.lock().counts.get(&object).copied().unwrap_or(0)
    }

    /// Number of distinct pinned objects
    pub fn pinned_objects(&self) -> usize {
        self.inner.lock().counts.len()
    }
}

/// Scoped pin on one object; unpins on drop
pub struct Pin {
    table: Arc<PinTable>,
    object: ObjectId,
    generation: u64,
}

impl Pin {
    /// The pinned object
    pub fn object(&self) -> ObjectId {
        self.object
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pin").field(&self.object).finish()
    }
}

impl Clone for Pin {
    fn clone(&self) -> Self {
        let generation = if self.table.retain(self.object, self.generation) {
            self.generation
        } else {
            // The original is stale; so is the clone
            u64::MAX
        };
        Self { table: Arc::clone(&self.table), object: self.object, generation }
    }
}

impl Drop for Pin {
    fn drop(&mut self) {
        self.table.release(self.object, self.generation);
    }
}
