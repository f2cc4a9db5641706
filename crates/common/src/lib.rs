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

//! Sidetrack common - shared building blocks for the capture engine
//!
//! This crate holds the VM value model that every debugger back-end speaks, plus the
//! logging and invariant-assertion helpers used across the workspace.

/// VM identities, values and declared type signatures
pub mod types;

/// Logging setup and utilities for consistent logging across Sidetrack components
pub mod logging;
/// Path-scoped invariant assertions controlled by `SIDETRACK_ASSERT`
pub mod macros;

pub use logging::*;
pub use types::*;
