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

//! The seam to the external expression evaluator.
//!
//! The engine does not compile or run candidates itself. A driver supplies an [`Evaluator`] and
//! brackets each call with a capture session through
//! [`CaptureEngine::evaluate_captured`](crate::CaptureEngine::evaluate_captured).

use std::fmt;

use serde::{Deserialize, Serialize};
use sidetrack_common::types::{ThreadId, Value};
use thiserror::Error;

use crate::{EffectSet, VmError};

/// The suspended frame a candidate is evaluated in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackFrame {
    /// Suspended thread
    pub thread: ThreadId,
    /// Frame index, 0 being the top of the stack
    pub depth: usize,
}

impl StackFrame {
    /// Top frame of `thread`
    pub fn top(thread: ThreadId) -> Self {
        Self { thread, depth: 0 }
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.thread, self.depth)
    }
}

/// Why a candidate produced no value
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluationError {
    /// The candidate threw
    #[error("candidate threw: {message}")]
    Exception {
        /// Exception description
        message: String,
    },
    /// The candidate could not be compiled in the frame's context
    #[error("candidate does not compile: {0}")]
    Compile(String),
    /// The candidate did not finish in time
    #[error("candidate timed out")]
    Timeout,
    /// The debuggee failed while running the candidate
    #[error(transparent)]
    Vm(#[from] VmError),
}

/// Runs candidate expressions in the debuggee
pub trait Evaluator {
    /// Evaluate `expression` in `frame`, blocking until the target is suspended again
    fn evaluate(&self, expression: &str, frame: &StackFrame) -> Result<Value, EvaluationError>;
}

impl<F> Evaluator for F
where
    F: Fn(&str, &StackFrame) -> Result<Value, EvaluationError>,
{
    fn evaluate(&self, expression: &str, frame: &StackFrame) -> Result<Value, EvaluationError> {
        self(expression, frame)
    }
}

/// Result of one captured evaluation. The debuggee has already been restored.
#[derive(Debug)]
pub struct CandidateOutcome {
    /// Value of the candidate, or why it has none
    pub result: Result<Value, EvaluationError>,
    /// What the candidate changed
    pub effects: EffectSet,
}

impl CandidateOutcome {
    /// Whether the candidate produced a value
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Whether the candidate changed pre-existing state
    pub fn has_side_effects(&self) -> bool {
        !self.effects.is_empty()
    }
}
