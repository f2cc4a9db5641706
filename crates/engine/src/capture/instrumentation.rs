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

//! Watchpoint installation and the event listener feeding capture sessions.
//!
//! Instrumentation is installed once per debugging session and outlives many capture sessions:
//!
//! 1. the [`Recorder`] is registered as the debuggee's event listener
//! 2. a class-prepare request catches types loaded later, whose static fields get watched on load
//! 3. a method-entry request on the reflective field type catches `Field.set`/`Field.get`
//! 4. every loaded type is scanned and its fields receive modification and access watchpoints
//!
//! Events only feed the session while the engine is recording; class-prepare events are handled
//! at all times so that the watch set stays complete.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use parking_lot::{Mutex, MutexGuard};
use sidetrack_common::types::{FieldId, ObjectRef, RequestId, TypeId, Value};
use tracing::{debug, error, info, trace, warn};

use super::{
    reflection::{self, Accessor, ReflectiveAccess},
    CaptureSession,
};
use crate::{
    CaptureConfig, CaptureError, DebugEvent, Debuggee, EventListener, EventRequest, FieldInfo,
    Location, MethodInfo, PinTable, TypeInfo, VmError, VmResult,
};

/// What the instrumentation covers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Loaded types seen, including ones loaded after installation
    pub types: usize,
    /// Types considered live during the initial scan
    pub live_types: usize,
    /// Types instrumented on load after the initial scan
    pub late_types: usize,
    /// Fields examined
    pub fields: usize,
    /// Modification watchpoints registered
    pub modification_watches: usize,
    /// Access watchpoints registered
    pub access_watches: usize,
}

impl fmt::Display for ScanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} types ({} live, {} late), {} fields, {} modification and {} access watchpoints",
            self.types,
            self.live_types,
            self.late_types,
            self.fields,
            self.modification_watches,
            self.access_watches
        )
    }
}

/// Watchpoints a field needs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct WatchPlan {
    pub modification: bool,
    pub access: bool,
}

impl WatchPlan {
    /// Plan for `field`. Instance fields of types without live instances cannot be reached by
    /// existing state and are skipped; static fields are always planned.
    pub(crate) fn for_field(
        field: &FieldInfo,
        declaring_type_live: bool,
        array_supertypes: &[String],
    ) -> Self {
        if !field.is_static && !declaring_type_live {
            return Self::default();
        }
        Self {
            modification: !field.is_final,
            access: field.signature.could_hold_array(array_supertypes),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        !self.modification && !self.access
    }
}

/// Types with at least one live instance of themselves or of a loaded subtype
pub(crate) fn live_types(vm: &dyn Debuggee, types: &[TypeInfo]) -> VmResult<HashSet<TypeId>> {
    let ids: Vec<TypeId> = types.iter().map(|t| t.id).collect();
    let counts = vm.instance_counts(&ids)?;
    let by_id: HashMap<TypeId, &TypeInfo> = types.iter().map(|t| (t.id, t)).collect();

    let mut live = HashSet::new();
    let mut pending: Vec<TypeId> =
        ids.iter().zip(counts).filter(|(_, count)| *count > 0).map(|(id, _)| *id).collect();
    while let Some(id) = pending.pop() {
        if live.insert(id) {
            if let Some(ty) = by_id.get(&id) {
                pending.extend(ty.supertypes.iter().copied());
            }
        }
    }
    Ok(live)
}

/// State shared between the engine and its listener
#[derive(Debug, Default)]
pub(crate) struct RecorderState {
    /// The reusable capture session
    pub session: CaptureSession,
    /// Whether events currently feed the session
    pub recording: bool,
    /// Every watched field, by id
    pub fields: HashMap<FieldId, Arc<FieldInfo>>,
    /// Watchpoint requests, including ones added on class load
    pub field_requests: Vec<RequestId>,
    pub summary: ScanSummary,
}

/// Event listener translating debugger events into session records
pub(crate) struct Recorder {
    vm: Arc<dyn Debuggee>,
    pins: Arc<PinTable>,
    config: CaptureConfig,
    state: Mutex<RecorderState>,
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Recorder {
    pub(crate) fn new(vm: Arc<dyn Debuggee>, pins: Arc<PinTable>, config: CaptureConfig) -> Self {
        Self { vm, pins, config, state: Mutex::new(RecorderState::default()) }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RecorderState> {
        self.state.lock()
    }

    /// Register the watchpoints `plan` asks for, unless `field` is already watched
    fn watch(&self, state: &mut RecorderState, field: FieldInfo, plan: WatchPlan) -> VmResult<()> {
        if plan.is_empty() || state.fields.contains_key(&field.id) {
            return Ok(());
        }
        if plan.modification {
            let request = self.vm.create_request(EventRequest::FieldModification(field.id))?;
            state.field_requests.push(request);
            state.summary.modification_watches += 1;
        }
        if plan.access {
            let request = self.vm.create_request(EventRequest::FieldAccess(field.id))?;
            state.field_requests.push(request);
            state.summary.access_watches += 1;
        }
        trace!(field = %field.qualified_name(), ?plan, "watching field");
        state.fields.insert(field.id, Arc::new(field));
        Ok(())
    }

    /// Instrument every loaded type
    fn scan(&self) -> VmResult<()> {
        let vm = &*self.vm;
        let types = vm.loaded_types()?;
        let live = if self.config.restrict_to_live_types {
            live_types(vm, &types)?
        } else {
            types.iter().map(|t| t.id).collect()
        };

        let mut state = self.state.lock();
        state.summary.types += types.len();
        state.summary.live_types = live.len();
        for ty in &types {
            for field in vm.declared_fields(ty.id)? {
                state.summary.fields += 1;
                let plan = WatchPlan::for_field(
                    &field,
                    live.contains(&ty.id),
                    &self.config.array_supertypes,
                );
                self.watch(&mut state, field, plan)?;
            }
        }
        let floor = vm.allocation_watermark()?;
        state.session.reset(floor);
        Ok(())
    }

    fn on_class_prepare(&self, state: &mut RecorderState, ty: &TypeInfo) -> VmResult<()> {
        state.summary.types += 1;
        state.summary.late_types += 1;
        let mut watched = 0;
        for field in self.vm.declared_fields(ty.id)? {
            state.summary.fields += 1;
            if !field.is_static {
                continue;
            }
            let plan = WatchPlan::for_field(&field, true, &self.config.array_supertypes);
            if !plan.is_empty() {
                watched += 1;
            }
            self.watch(state, field, plan)?;
        }
        debug!(ty = %ty.name, watched, "instrumented late-loaded type");
        Ok(())
    }

    fn on_field_modification(
        &self,
        state: &mut RecorderState,
        object: Option<ObjectRef>,
        field: FieldId,
        current: Value,
        to_be: Value,
        in_static_initializer: bool,
    ) -> Result<(), CaptureError> {
        let session = &mut state.session;
        if in_static_initializer {
            session.stats_mut().skipped_static_init += 1;
            return Ok(());
        }
        if object.is_some_and(|o| session.is_new(o.id)) {
            session.stats_mut().skipped_new_objects += 1;
            return Ok(());
        }
        let Some(info) = state.fields.get(&field).cloned() else {
            warn!(%field, "modification of unwatched field");
            return Ok(());
        };
        let location = Location::field(object, info);
        session.record_field_write(&*self.vm, &self.pins, location, current, to_be)
    }

    fn on_field_access(
        &self,
        state: &mut RecorderState,
        object: Option<ObjectRef>,
        field: FieldId,
    ) -> Result<(), CaptureError> {
        let session = &mut state.session;
        if object.is_some_and(|o| session.is_new(o.id)) {
            return Ok(());
        }
        let Some(info) = state.fields.get(&field).cloned() else {
            return Ok(());
        };
        let location = Location::field(object, info);
        let value = location.read(&*self.vm).map_err(CaptureError::Inspect)?;
        match value.as_array() {
            Some(array) => session.record_array_read(&*self.vm, &self.pins, location, array),
            None => Ok(()),
        }
    }

    fn on_method_entry(
        &self,
        state: &mut RecorderState,
        method: &MethodInfo,
        receiver: Option<ObjectRef>,
        arguments: &[Value],
    ) -> Result<(), CaptureError> {
        if !self.config.track_reflection || method.declaring_type != self.config.reflection_type {
            return Ok(());
        }
        let (Some(accessor), Some(receiver)) = (Accessor::classify(&method.name), receiver) else {
            return Ok(());
        };

        let vm = &*self.vm;
        let Some(access) =
            reflection::decode(vm, accessor, receiver, arguments).map_err(CaptureError::Inspect)?
        else {
            trace!(method = %method.name, "reflective call will fail in the target, ignored");
            return Ok(());
        };
        state.session.stats_mut().reflective_calls += 1;

        let (object, field) = match &access {
            ReflectiveAccess::Write { object, field, .. }
            | ReflectiveAccess::Read { object, field, .. } => (*object, field),
        };
        if object.is_some_and(|o| state.session.is_new(o.id)) {
            state.session.stats_mut().skipped_new_objects += 1;
            return Ok(());
        }
        let info = match state.fields.get(&field.id) {
            Some(info) => Arc::clone(info),
            None => Arc::new(field.clone()),
        };
        let location = Location::field(object, info);

        match access {
            ReflectiveAccess::Write { old, new, .. } => {
                debug!(%location, %old, %new, "reflective write");
                state.session.record_field_write(vm, &self.pins, location, old, new)
            }
            ReflectiveAccess::Read { value, .. } => match value.as_array() {
                Some(array) => state.session.record_array_read(vm, &self.pins, location, array),
                None => Ok(()),
            },
        }
    }
}

impl EventListener for Recorder {
    fn on_event(&self, event: &DebugEvent) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let result = match event {
            DebugEvent::ClassPrepare { ty, .. } => {
                self.on_class_prepare(state, ty).map_err(CaptureError::Setup)
            }
            _ if !state.recording => Ok(()),
            DebugEvent::FieldModification {
                object,
                field,
                current,
                to_be,
                in_static_initializer,
                ..
            } => self.on_field_modification(
                state,
                *object,
                *field,
                *current,
                *to_be,
                *in_static_initializer,
            ),
            DebugEvent::FieldAccess { object, field, .. } => {
                self.on_field_access(state, *object, *field)
            }
            DebugEvent::MethodEntry { method, receiver, arguments, .. } => {
                self.on_method_entry(state, method, *receiver, arguments)
            }
        };

        if let Err(e) = result {
            error!(error = %e, "instrumentation callback failed");
            state.session.fail(e);
        }
    }
}

/// Requests owned by an installed instrumentation, apart from field watchpoints which the
/// [`Recorder`] tracks because class loads add to them
#[derive(Debug)]
pub(crate) struct Instrumentation {
    class_prepare: Option<RequestId>,
    reflection: Option<RequestId>,
}

impl Instrumentation {
    /// Install all instrumentation. On failure, whatever was installed is removed again.
    pub(crate) fn install(
        vm: &Arc<dyn Debuggee>,
        recorder: &Arc<Recorder>,
    ) -> Result<Self, CaptureError> {
        let listener: Arc<dyn EventListener> = Arc::clone(recorder) as Arc<dyn EventListener>;
        vm.set_event_listener(Some(listener)).map_err(CaptureError::Setup)?;

        let mut installed = Self { class_prepare: None, reflection: None };
        match installed.register(vm.as_ref(), recorder) {
            Ok(()) => {
                info!(summary = %recorder.lock().summary, "instrumentation installed");
                Ok(installed)
            }
            Err(e) => {
                error!(error = %e, "instrumentation setup failed, rolling back");
                if let Err(cleanup) = installed.teardown(vm.as_ref(), recorder) {
                    warn!(error = %cleanup, "rollback incomplete");
                }
                Err(CaptureError::Setup(e))
            }
        }
    }

    fn register(&mut self, vm: &dyn Debuggee, recorder: &Recorder) -> VmResult<()> {
        self.class_prepare = Some(vm.create_request(EventRequest::ClassPrepare)?);
        if recorder.config.track_reflection {
            let class_filter = recorder.config.reflection_type.clone();
            self.reflection = Some(vm.create_request(EventRequest::MethodEntry { class_filter })?);
        }
        recorder.scan()
    }

    /// Remove the class-prepare request, then the reflection interceptor, then every field
    /// watchpoint, and finally the listener. Every step is attempted; the first failure is
    /// reported.
    pub(crate) fn teardown(
        self,
        vm: &dyn Debuggee,
        recorder: &Recorder,
    ) -> Result<(), CaptureError> {
        let mut first: Option<VmError> = None;
        let mut step = |what: &str, result: VmResult<()>| {
            if let Err(e) = result {
                warn!(error = %e, "failed to remove {what}");
                first.get_or_insert(e);
            }
        };

        if let Some(request) = self.class_prepare {
            step("class-prepare request", vm.delete_requests(&[request]));
        }
        if let Some(request) = self.reflection {
            step("reflection interceptor", vm.delete_requests(&[request]));
        }
        let field_requests = {
            let mut state = recorder.lock();
            state.fields.clear();
            std::mem::take(&mut state.field_requests)
        };
        if !field_requests.is_empty() {
            step("field watchpoints", vm.delete_requests(&field_requests));
        }
        step("event listener", vm.set_event_listener(None));
        debug!(watchpoints = field_requests.len(), "instrumentation removed");

        match first {
            Some(e) => Err(CaptureError::Teardown(e)),
            None => Ok(()),
        }
    }
}
