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

//! Sidetrack engine - side-effect capture and undo for speculative evaluation
//!
//! The engine lets a driver evaluate arbitrary candidate expressions against a live, suspended
//! debuggee without corrupting it. While a capture session is open, watchpoints report every
//! field write and every array fetched out of a field; when the session closes the engine diffs
//! the observed locations, reverts them in the debuggee, and returns the differences as an
//! [`EffectSet`] that can later be redone.
//!
//! ```text
//!   driver ──start_capture()──▶ CaptureEngine ◀──events── Debuggee (watchpoints, reflection)
//!     │                             │
//!     ├──evaluate(expr)─────────────┼──────────────────▶ target runs, fires events
//!     │                             ▼
//!     └──stop_capture()──▶ compute effects ─▶ undo ─▶ EffectSet
//! ```
//!
//! The debugger back-end is abstracted by the [`Debuggee`] trait. With the `test-utils` feature,
//! [`sim::SimulatedVm`] provides an in-memory implementation.

pub mod capture;
pub use capture::*;

pub mod config;
pub use config::*;

pub mod error;
pub use error::*;

pub mod eval;
pub use eval::*;

pub mod model;
pub use model::*;

pub mod pin;
pub use pin::*;

pub mod vm;
pub use vm::*;

#[cfg(any(test, feature = "test-utils"))]
pub mod sim;
