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

//! Errors raised by the capture engine.
//!
//! Every variant except [`CaptureError::InvalidState`] is fatal for a search campaign: either
//! instrumentation could not be set up, or the debuggee could not be restored and is no longer
//! a trustworthy host for further candidates.

use thiserror::Error;

use crate::{EngineState, Location, VmError};

/// Errors that can occur while capturing, undoing or redoing side effects
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    /// Installing or extending instrumentation failed
    #[error("failed to set up instrumentation: {0}")]
    Setup(#[source] VmError),

    /// Restoring a location during undo or redo failed; the debuggee is now inconsistent
    #[error("failed to write back {location}: {source}")]
    WriteBack {
        /// The location that could not be restored
        location: Location,
        /// Back-end failure
        #[source]
        source: VmError,
    },

    /// Removing instrumentation failed; requests or pins may have been left behind
    #[error("failed to remove instrumentation: {0}")]
    Teardown(#[source] VmError),

    /// Reading debuggee state while recording or computing effects failed
    #[error("failed to inspect debuggee state: {0}")]
    Inspect(#[source] VmError),

    /// An instrumentation callback failed on the event-dispatch thread
    #[error("instrumentation callback failed: {0}")]
    Callback(#[source] Box<CaptureError>),

    /// The operation is not allowed in the engine's current state
    #[error("cannot {operation} while engine is {state}")]
    InvalidState {
        /// Attempted operation
        operation: &'static str,
        /// State at the time of the call
        state: EngineState,
    },
}

impl CaptureError {
    /// Whether the search campaign must be abandoned after this error
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::InvalidState { .. })
    }
}
