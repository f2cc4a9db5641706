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

//! Recording state of one candidate evaluation
//!
//! A [`CaptureSession`] accumulates three kinds of evidence while a candidate runs:
//!
//! - **writes**: field locations the candidate assigned, with their original and latest value
//! - **array reads**: arrays the candidate fetched out of a field, with their contents at the
//!   time of the first read; element stores never fire field watchpoints, so this baseline is
//!   the only way to notice in-place mutation
//! - **argument arrays**: arrays passed directly to the evaluated call, which the callee can
//!   mutate without touching any watched field
//!
//! Objects allocated after the session's id floor belong to the candidate itself and are never
//! tracked. The session is reused across evaluations: [`CaptureSession::reset`] clears it in place.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use sidetrack_common::{
    sidetrack_assert,
    types::{ObjectId, ObjectRef, Value},
};
use tracing::{debug, trace};

use crate::{CaptureError, Debuggee, Effect, Location, Pin, PinTable, Snapshot};

/// Counters describing what a session observed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Field writes that changed a value
    pub field_writes: usize,
    /// Locations dropped because they were written back to their original value
    pub round_trips: usize,
    /// Array baselines captured from field reads
    pub array_reads: usize,
    /// Argument arrays backed up
    pub argument_arrays: usize,
    /// Reflective field accesses intercepted
    pub reflective_calls: usize,
    /// Events ignored because they concerned objects allocated during the session
    pub skipped_new_objects: usize,
    /// Writes ignored because they ran inside a static initializer
    pub skipped_static_init: usize,
}

#[derive(Debug)]
struct TrackedWrite {
    seq: u64,
    before: Snapshot,
    after: Snapshot,
    pins: Vec<Pin>,
}

#[derive(Debug)]
struct Baseline {
    seq: u64,
    location: Location,
    snapshot: Snapshot,
    pins: Vec<Pin>,
}

/// Recording state for one evaluation attempt
#[derive(Debug, Default)]
pub struct CaptureSession {
    writes: HashMap<Location, TrackedWrite>,
    array_reads: HashMap<Location, Baseline>,
    argument_arrays: HashMap<ObjectId, Baseline>,
    max_id_floor: ObjectId,
    next_seq: u64,
    stats: SessionStats,
    failure: Option<CaptureError>,
}

fn pin_for(
    pins: &Arc<PinTable>,
    location: &Location,
    snapshot: &Snapshot,
) -> Result<Vec<Pin>, CaptureError> {
    let mut objects = snapshot.referenced_objects();
    if let Location::InstanceField { object, .. } = location {
        objects.push(object.id);
    }
    pins.acquire_all(objects).map_err(CaptureError::Inspect)
}

impl CaptureSession {
    /// Clear all recorded state (releasing its pins) and start over with a new id floor
    pub(crate) fn reset(&mut self, max_id_floor: ObjectId) {
        self.writes.clear();
        self.array_reads.clear();
        self.argument_arrays.clear();
        self.max_id_floor = max_id_floor;
        self.next_seq = 0;
        self.stats = SessionStats::default();
        self.failure = None;
    }

    /// Objects with an id above this floor were allocated during the session
    pub fn max_id_floor(&self) -> ObjectId {
        self.max_id_floor
    }

    /// Whether `object` was allocated during this session
    pub fn is_new(&self, object: ObjectId) -> bool {
        object.allocated_after(self.max_id_floor)
    }

    /// What the session has observed so far
    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut SessionStats {
        &mut self.stats
    }

    /// Objects currently pinned on behalf of this session
    pub fn pinned(&self) -> HashSet<ObjectId> {
        let writes = self.writes.values().flat_map(|w| w.pins.iter());
        let reads = self.array_reads.values().flat_map(|r| r.pins.iter());
        let args = self.argument_arrays.values().flat_map(|r| r.pins.iter());
        writes.chain(reads).chain(args).map(Pin::object).collect()
    }

    /// Whether nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.array_reads.is_empty() && self.argument_arrays.is_empty()
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Remember the first failure raised on the event-dispatch thread
    pub(crate) fn fail(&mut self, error: CaptureError) {
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }

    pub(crate) fn failure(&self) -> Option<&CaptureError> {
        self.failure.as_ref()
    }

    pub(crate) fn take_failure(&mut self) -> Option<CaptureError> {
        self.failure.take()
    }

    /// Record that the target is about to overwrite `location`, currently `old`, with `new`
    pub(crate) fn record_field_write(
        &mut self,
        vm: &dyn Debuggee,
        pins: &Arc<PinTable>,
        location: Location,
        old: Value,
        new: Value,
    ) -> Result<(), CaptureError> {
        if old == new {
            return Ok(());
        }
        self.stats.field_writes += 1;
        let after = Snapshot::capture(vm, new).map_err(CaptureError::Inspect)?;

        if let Some(tracked) = self.writes.get_mut(&location) {
            if after != tracked.before {
                trace!(%location, %after, "updated tracked write");
                tracked.after = after;
                return Ok(());
            }
            self.writes.remove(&location);
            self.stats.round_trips += 1;
            debug!(%location, "write restored original value, dropped");
            return Ok(());
        }

        // An earlier read baseline holds the oldest known contents of the array being replaced.
        // It stays in place: if this write is later undone by the target itself, aliases taken
        // from the read can still mutate the array.
        let (seq, before, pinned) = match self.array_reads.get(&location) {
            Some(read) => (read.seq, read.snapshot.clone(), read.pins.clone()),
            None => {
                let before = Snapshot::capture(vm, old).map_err(CaptureError::Inspect)?;
                let pinned = pin_for(pins, &location, &before)?;
                (self.next_seq(), before, pinned)
            }
        };

        debug!(%location, %before, %after, "tracking write");
        self.writes.insert(location, TrackedWrite { seq, before, after, pins: pinned });
        Ok(())
    }

    /// Record that the target read `array` out of `location`
    pub(crate) fn record_array_read(
        &mut self,
        vm: &dyn Debuggee,
        pins: &Arc<PinTable>,
        location: Location,
        array: ObjectRef,
    ) -> Result<(), CaptureError> {
        if self.writes.contains_key(&location) || self.array_reads.contains_key(&location) {
            return Ok(());
        }
        if self.is_new(array.id) {
            self.stats.skipped_new_objects += 1;
            return Ok(());
        }

        let snapshot =
            Snapshot::capture(vm, Value::Object(array)).map_err(CaptureError::Inspect)?;
        let pinned = pin_for(pins, &location, &snapshot)?;
        trace!(%location, baseline = %snapshot, "captured array baseline");

        let seq = self.next_seq();
        self.stats.array_reads += 1;
        self.array_reads
            .insert(location.clone(), Baseline { seq, location, snapshot, pins: pinned });
        Ok(())
    }

    /// Back up an array about to be passed as an argument to the evaluated call
    pub(crate) fn backup_argument(
        &mut self,
        vm: &dyn Debuggee,
        pins: &Arc<PinTable>,
        array: ObjectRef,
    ) -> Result<(), CaptureError> {
        if self.argument_arrays.contains_key(&array.id) || self.is_new(array.id) {
            return Ok(());
        }

        let location = Location::WholeArray { array };
        let snapshot = location.snapshot(vm).map_err(CaptureError::Inspect)?;
        let pinned = pin_for(pins, &location, &snapshot)?;
        trace!(%location, baseline = %snapshot, "backed up argument array");

        let seq = self.next_seq();
        self.stats.argument_arrays += 1;
        self.argument_arrays.insert(array.id, Baseline { seq, location, snapshot, pins: pinned });
        Ok(())
    }

    /// Register an effect that was just redone, so that closing the session reverts it and
    /// reports any further drift relative to the effect's `before`
    pub(crate) fn register_redone(
        &mut self,
        pins: &Arc<PinTable>,
        effect: &Effect,
    ) -> Result<(), CaptureError> {
        let location = effect.location().clone();

        if effect.is_content_change() {
            if self.writes.contains_key(&location) {
                return Ok(());
            }
            let snapshot = effect.before().clone();
            let pinned = pin_for(pins, &location, &snapshot)?;
            let seq = self.next_seq();
            let baseline = Baseline { seq, location: location.clone(), snapshot, pins: pinned };
            match location {
                Location::WholeArray { array } => {
                    self.argument_arrays.entry(array.id).or_insert(baseline);
                }
                other => {
                    self.array_reads.entry(other).or_insert(baseline);
                }
            }
            return Ok(());
        }

        if let Some(tracked) = self.writes.get_mut(&location) {
            if *effect.after() == tracked.before {
                self.writes.remove(&location);
            } else {
                tracked.after = effect.after().clone();
            }
            return Ok(());
        }

        let (seq, before, pinned) = match self.array_reads.get(&location) {
            Some(read) => (read.seq, read.snapshot.clone(), read.pins.clone()),
            None => {
                let before = effect.before().clone();
                let pinned = pin_for(pins, &location, &before)?;
                (self.next_seq(), before, pinned)
            }
        };
        let after = effect.after().clone();
        self.writes.insert(location, TrackedWrite { seq, before, after, pins: pinned });
        Ok(())
    }

    /// Compute the session's effects against the debuggee's current state, without changing it
    pub(crate) fn compute_effects(&self, vm: &dyn Debuggee) -> Result<Vec<Effect>, CaptureError> {
        let mut effects: Vec<(u64, Effect)> = Vec::new();

        for (location, tracked) in &self.writes {
            // Watched locations report every rebinding; only array contents can drift unseen
            let after = if location.is_watched() {
                tracked.after.refresh(vm)
            } else {
                location.snapshot(vm)
            }
            .map_err(CaptureError::Inspect)?;

            if let Some(effect) = Effect::new(location.clone(), tracked.before.clone(), after) {
                effects.push((tracked.seq, effect));
            }
        }

        // A tracked write to the same location already starts from the read baseline
        let reads = self.array_reads.values().filter(|r| !self.writes.contains_key(&r.location));
        for baseline in reads.chain(self.argument_arrays.values()) {
            let live = baseline.snapshot.refresh(vm).map_err(CaptureError::Inspect)?;
            match Effect::new(baseline.location.clone(), baseline.snapshot.clone(), live) {
                Some(effect) => effects.push((baseline.seq, effect)),
                None => trace!(location = %baseline.location, "array unchanged"),
            }
        }

        effects.sort_by_key(|(seq, _)| *seq);
        sidetrack_assert!(effects.iter().all(|(_, e)| e.before() != e.after()));
        Ok(effects.into_iter().map(|(_, effect)| effect).collect())
    }

    /// Watched locations the target rebound to a different array with equal contents.
    ///
    /// These yield no effect, yet the original reference must still be put back when the session
    /// closes, or aliases of the original array would silently stop sharing it.
    pub(crate) fn identity_restores(
        &self,
        vm: &dyn Debuggee,
    ) -> Result<Vec<(Location, Snapshot)>, CaptureError> {
        let mut restores = Vec::new();
        for (location, tracked) in self.writes.iter().filter(|(l, _)| l.is_watched()) {
            let (Some(before), Some(after)) = (tracked.before.array(), tracked.after.array())
            else {
                continue;
            };
            if before.id == after.id {
                continue;
            }
            let live = tracked.after.refresh(vm).map_err(CaptureError::Inspect)?;
            if live == tracked.before {
                restores.push((tracked.seq, location.clone(), tracked.before.clone()));
            }
        }
        restores.sort_by_key(|(seq, ..)| *seq);
        Ok(restores.into_iter().map(|(_, location, before)| (location, before)).collect())
    }
}
