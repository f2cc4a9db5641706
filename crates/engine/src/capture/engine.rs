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

//! The capture engine state machine.
//!
//! ```text
//!            start()               start_capture()
//!  Created ──────────▶ Idle ◀──────────────────────▶ Recording
//!     ▲  │               ▲ │        stop_capture()
//!     │  └─ enable(false)│ └─ enable(false)
//!     │        ▼         │        ▼
//!     └──── Disabled ────┘   (enable(true))
//!
//!  any state ── stop() ──▶ Terminal
//! ```
//!
//! A driver opens one capture session per candidate evaluation. Closing a session computes the
//! candidate's effects, reverts them in the debuggee, and hands them back as an [`EffectSet`]
//! that can later be redone to inspect the state the candidate produced.

use std::{fmt, sync::Arc};

use sidetrack_common::types::{ObjectId, Value};
use tracing::{debug, info, warn};

use super::{
    instrumentation::{Instrumentation, Recorder},
    CaptureSession, ScanSummary, SessionStats,
};
use crate::{
    CandidateOutcome, CaptureConfig, CaptureError, Debuggee, EffectSet, Evaluator, PinTable,
    StackFrame,
};

/// Lifecycle state of a [`CaptureEngine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    /// Constructed; instrumentation not installed yet
    Created,
    /// Every operation is a no-op returning empty results
    Disabled,
    /// Instrumentation installed, no session open
    Idle,
    /// A capture session is open
    Recording,
    /// Instrumentation removed; the engine cannot be used anymore
    Terminal,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Disabled => "disabled",
            Self::Idle => "idle",
            Self::Recording => "recording",
            Self::Terminal => "terminal",
        };
        f.write_str(name)
    }
}

/// Captures, reverts and replays the side effects of candidate evaluations
pub struct CaptureEngine {
    vm: Arc<dyn Debuggee>,
    config: CaptureConfig,
    pins: Arc<PinTable>,
    recorder: Arc<Recorder>,
    instrumentation: Option<Instrumentation>,
    state: EngineState,
    last_stats: SessionStats,
}

impl fmt::Debug for CaptureEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureEngine")
            .field("state", &self.state)
            .field("installed", &self.instrumentation.is_some())
            .field("pins", &self.pins)
            .finish()
    }
}

impl CaptureEngine {
    /// Create an engine for `vm`. Nothing is installed until [`start`](Self::start).
    pub fn new(vm: Arc<dyn Debuggee>, config: CaptureConfig) -> Self {
        let pins = PinTable::new(Arc::clone(&vm));
        let recorder = Arc::new(Recorder::new(Arc::clone(&vm), Arc::clone(&pins), config.clone()));
        let state = if config.enabled { EngineState::Created } else { EngineState::Disabled };
        Self {
            vm,
            config,
            pins,
            recorder,
            instrumentation: None,
            state,
            last_stats: Default::default(),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Whether operations have any effect
    pub fn is_enabled(&self) -> bool {
        !matches!(self.state, EngineState::Disabled | EngineState::Terminal)
    }

    /// The engine's configuration
    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Pins held on behalf of open sessions and live effect sets
    pub fn pin_table(&self) -> &Arc<PinTable> {
        &self.pins
    }

    /// Coverage of the installed instrumentation
    pub fn instrumentation_summary(&self) -> Option<ScanSummary> {
        self.instrumentation.as_ref().map(|_| self.recorder.lock().summary)
    }

    /// Statistics of the open session, or of the last closed one
    pub fn session_stats(&self) -> SessionStats {
        match self.state {
            EngineState::Recording => self.recorder.lock().session.stats(),
            _ => self.last_stats,
        }
    }

    fn invalid(&self, operation: &'static str) -> CaptureError {
        CaptureError::InvalidState { operation, state: self.state }
    }

    /// Install instrumentation
    pub fn start(&mut self) -> Result<(), CaptureError> {
        match self.state {
            EngineState::Created => {}
            EngineState::Disabled => return Ok(()),
            _ => return Err(self.invalid("start")),
        }
        let instrumentation = Instrumentation::install(&self.vm, &self.recorder)?;
        self.instrumentation = Some(instrumentation);
        self.state = EngineState::Idle;
        Ok(())
    }

    /// Enable or disable the engine. Disabling is refused while a session is open.
    pub fn enable(&mut self, enabled: bool) -> Result<(), CaptureError> {
        self.state = match (self.state, enabled) {
            (EngineState::Terminal, _) => return Err(self.invalid("change enablement")),
            (EngineState::Recording, false) => return Err(self.invalid("disable")),
            (EngineState::Created | EngineState::Idle, false) => EngineState::Disabled,
            (EngineState::Disabled, true) if self.instrumentation.is_some() => EngineState::Idle,
            (EngineState::Disabled, true) => EngineState::Created,
            (state, _) => state,
        };
        debug!(state = %self.state, "engine enablement changed");
        Ok(())
    }

    /// Open a capture session
    pub fn start_capture(&mut self) -> Result<(), CaptureError> {
        match self.state {
            EngineState::Idle => {}
            EngineState::Disabled => return Ok(()),
            _ => return Err(self.invalid("start capture")),
        }

        let mut state = self.recorder.lock();
        // A class-load callback may have failed since the last session
        if let Some(failure) = state.session.take_failure() {
            return Err(CaptureError::Callback(Box::new(failure)));
        }
        let floor = self.vm.allocation_watermark().map_err(CaptureError::Inspect)?;
        state.session.reset(floor);
        state.recording = true;
        drop(state);

        self.state = EngineState::Recording;
        debug!(%floor, "capture session opened");
        Ok(())
    }

    /// Back up array arguments of the evaluated call, which it may mutate in place
    pub fn check_arguments(&mut self, values: &[Value]) -> Result<(), CaptureError> {
        match self.state {
            EngineState::Recording => {}
            EngineState::Disabled => return Ok(()),
            _ => return Err(self.invalid("check arguments")),
        }
        let mut state = self.recorder.lock();
        for array in values.iter().filter_map(Value::as_array) {
            state.session.backup_argument(&*self.vm, &self.pins, array)?;
        }
        Ok(())
    }

    /// Effects of the open session so far, without reverting them or closing the session
    pub fn get_side_effects(&self) -> Result<EffectSet, CaptureError> {
        match self.state {
            EngineState::Recording => {}
            EngineState::Disabled => return Ok(EffectSet::empty()),
            _ => return Err(self.invalid("inspect side effects")),
        }
        let state = self.recorder.lock();
        if let Some(failure) = state.session.failure() {
            return Err(CaptureError::Callback(Box::new(failure.clone())));
        }
        let effects = state.session.compute_effects(&*self.vm)?;
        EffectSet::pinned(effects, &self.pins).map_err(CaptureError::Inspect)
    }

    /// Close the session: compute its effects, revert them, and return them
    pub fn stop_capture(&mut self) -> Result<EffectSet, CaptureError> {
        match self.state {
            EngineState::Recording => {}
            EngineState::Disabled => return Ok(EffectSet::empty()),
            _ => return Err(self.invalid("stop capture")),
        }
        self.state = EngineState::Idle;

        let mut state = self.recorder.lock();
        state.recording = false;
        let failure = state.session.take_failure();
        let closed = self.close(&state.session);
        self.last_stats = state.session.stats();
        let floor = state.session.max_id_floor();
        state.session.reset(floor);
        drop(state);

        if let Some(failure) = failure {
            if let Err(e) = &closed {
                warn!(error = %e, "closing failed session");
            }
            return Err(CaptureError::Callback(Box::new(failure)));
        }
        closed
    }

    fn close(&self, session: &CaptureSession) -> Result<EffectSet, CaptureError> {
        let vm = &*self.vm;
        let effects = session.compute_effects(vm)?;
        let restores = session.identity_restores(vm)?;
        let set = EffectSet::pinned(effects, &self.pins).map_err(CaptureError::Inspect)?;
        set.undo_all(vm)?;
        for (location, before) in &restores {
            debug!(%location, "restoring rebound array reference");
            location
                .write(vm, before)
                .map_err(|source| CaptureError::WriteBack { location: location.clone(), source })?;
        }
        info!(
            effects = set.len(),
            restored = restores.len(),
            stats = ?session.stats(),
            "capture session closed"
        );
        Ok(set)
    }

    /// Re-apply `effects` and register them with the open session, so that closing it reverts
    /// them along with anything done afterwards
    pub fn redo_and_record_effects(&mut self, effects: &EffectSet) -> Result<(), CaptureError> {
        match self.state {
            EngineState::Recording => {}
            EngineState::Disabled => return Ok(()),
            _ => return Err(self.invalid("redo effects")),
        }
        let mut state = self.recorder.lock();
        for effect in effects {
            effect.redo(&*self.vm)?;
            state.session.register_redone(&self.pins, effect)?;
        }
        debug!(effects = effects.len(), "redone effects");
        Ok(())
    }

    /// Evaluate one candidate inside a capture session.
    ///
    /// The session is closed and the debuggee restored whether or not the candidate succeeds;
    /// an evaluation failure is reported in [`CandidateOutcome::result`].
    pub fn evaluate_captured<E: Evaluator + ?Sized>(
        &mut self,
        evaluator: &E,
        expression: &str,
        frame: &StackFrame,
        array_arguments: &[Value],
    ) -> Result<CandidateOutcome, CaptureError> {
        self.start_capture()?;
        if let Err(e) = self.check_arguments(array_arguments) {
            if let Err(close) = self.stop_capture() {
                warn!(error = %close, "failed to close session after argument backup failure");
            }
            return Err(e);
        }

        debug!(expression, %frame, "evaluating candidate");
        let result = evaluator.evaluate(expression, frame);
        let effects = self.stop_capture()?;
        Ok(CandidateOutcome { result, effects })
    }

    /// Remove all instrumentation and release every pin. An open session is reverted first.
    ///
    /// Every step is attempted even if an earlier one fails; the first failure is returned.
    pub fn stop(&mut self) -> Result<(), CaptureError> {
        if self.state == EngineState::Terminal {
            return Ok(());
        }
        let mut first: Option<CaptureError> = None;

        if self.state == EngineState::Recording {
            if let Err(e) = self.stop_capture() {
                warn!(error = %e, "failed to revert open session");
                first.get_or_insert(e);
            }
        }
        if let Some(instrumentation) = self.instrumentation.take() {
            if let Err(e) = instrumentation.teardown(self.vm.as_ref(), &self.recorder) {
                first.get_or_insert(e);
            }
        }
        self.recorder.lock().session.reset(ObjectId::default());
        let released = self.pins.release_all();
        self.state = EngineState::Terminal;
        info!(released, "capture engine stopped");

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "failed to stop capture engine on drop");
        }
    }
}
