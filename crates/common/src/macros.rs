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

//! Path-scoped invariant assertions
//!
//! The capture engine has several invariants (no no-op effects, balanced pins, one open session)
//! that are too expensive to check on every candidate of a large search. These macros only
//! evaluate when the calling module is selected through the `SIDETRACK_ASSERT` environment
//! variable, which accepts a comma-separated list of module path prefixes, or `*` / `all`.
//!
//! ```bash
//! SIDETRACK_ASSERT=sidetrack_engine::capture cargo test
//! ```

use once_cell::sync::Lazy;
use std::env;

/// Environment variable selecting the modules whose assertions are active
pub const ASSERT_ENV_VAR: &str = "SIDETRACK_ASSERT";

static ASSERTION_TARGETS: Lazy<Vec<String>> =
    Lazy::new(|| parse_targets(&env::var(ASSERT_ENV_VAR).unwrap_or_default()));

fn parse_targets(raw: &str) -> Vec<String> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect()
}

fn matches_targets(targets: &[String], module_path: &str) -> bool {
    targets.iter().any(|t| t == "*" || t == "all" || module_path.starts_with(t.as_str()))
}

/// Whether assertions are enabled for `module_path` (usually `module_path!()`)
pub fn is_assertion_enabled(module_path: &str) -> bool {
    matches_targets(&ASSERTION_TARGETS, module_path)
}

/// Marks the assertion branch as unlikely
#[cold]
#[inline(never)]
pub fn cold_path() {}

/// `assert!` that only runs when the calling module is selected by `SIDETRACK_ASSERT`
#[macro_export]
macro_rules! sidetrack_assert {
    ($($arg:tt)*) => {
        if $crate::macros::is_assertion_enabled(module_path!()) {
            $crate::macros::cold_path();
            assert!($($arg)*);
        }
    };
}

/// `assert_eq!` that only runs when the calling module is selected by `SIDETRACK_ASSERT`
#[macro_export]
macro_rules! sidetrack_assert_eq {
    ($($arg:tt)*) => {
        if $crate::macros::is_assertion_enabled(module_path!()) {
            $crate::macros::cold_path();
            assert_eq!($($arg)*);
        }
    };
}

/// `assert_ne!` that only runs when the calling module is selected by `SIDETRACK_ASSERT`
#[macro_export]
macro_rules! sidetrack_assert_ne {
    ($($arg:tt)*) => {
        if $crate::macros::is_assertion_enabled(module_path!()) {
            $crate::macros::cold_path();
            assert_ne!($($arg)*);
        }
    };
}
