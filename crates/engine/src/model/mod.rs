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

//! Location, snapshot and effect model
//!
//! Uniformly represents "what changed" precisely enough to reverse it:
//!
//! - [`Location`] - where a value lives (variable, field, array slot, whole array)
//! - [`Snapshot`] - a frozen copy of a value, including array contents
//! - [`Effect`] - a `(location, before, after)` triple that can be undone and redone
//! - [`EffectSet`] - the effects of one evaluation, keeping referenced objects pinned

mod effect;
mod location;
mod snapshot;

pub use effect::*;
pub use location::*;
pub use snapshot::*;
