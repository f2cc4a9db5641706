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

//! Capture engine configuration
//!
//! [`CaptureConfig`] can be built in code with the `with_*` setters or loaded from a TOML file.
//! Every key is optional; missing keys take their default value.
//!
//! ```toml
//! enabled = true
//! track_reflection = true
//! reflection_type = "java.lang.reflect.Field"
//! array_supertypes = ["java.lang.Object", "java.lang.Cloneable", "java.io.Serializable"]
//! restrict_to_live_types = true
//! ```

use std::{fs, path::Path};

use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Type whose `set`/`get` family is intercepted to observe reflective field accesses
pub const DEFAULT_REFLECTION_TYPE: &str = "java.lang.reflect.Field";

/// Declared reference types that can hold an array at runtime
pub const DEFAULT_ARRAY_SUPERTYPES: [&str; 3] =
    ["java.lang.Object", "java.lang.Cloneable", "java.io.Serializable"];

/// Configuration for a [`CaptureEngine`](crate::CaptureEngine)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Start enabled; a disabled engine turns every operation into a no-op
    pub enabled: bool,
    /// Intercept reflective field accesses
    pub track_reflection: bool,
    /// Declaring type of the reflective accessors
    pub reflection_type: String,
    /// Reference types whose fields get access watchpoints, since they may hold arrays
    pub array_supertypes: Vec<String>,
    /// Only watch instance fields of types with at least one live instance (or live subtype
    /// instance). When off, instance fields of every loaded type are watched.
    pub restrict_to_live_types: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            track_reflection: true,
            reflection_type: DEFAULT_REFLECTION_TYPE.to_string(),
            array_supertypes: DEFAULT_ARRAY_SUPERTYPES.iter().map(|s| s.to_string()).collect(),
            restrict_to_live_types: true,
        }
    }
}

impl CaptureConfig {
    /// Set whether the engine starts enabled
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Enable or disable interception of reflective accesses
    pub fn with_reflection(mut self, track: bool) -> Self {
        self.track_reflection = track;
        self
    }

    /// Set the declaring type of the reflective accessors
    pub fn with_reflection_type(mut self, name: impl Into<String>) -> Self {
        self.reflection_type = name.into();
        self
    }

    /// Set the reference types considered able to hold arrays
    pub fn with_array_supertypes<S: Into<String>>(
        mut self,
        types: impl IntoIterator<Item = S>,
    ) -> Self {
        self.array_supertypes = types.into_iter().map(Into::into).collect();
        self
    }

    /// Enable or disable the live-instance filter for instance fields
    pub fn with_live_type_filter(mut self, restrict: bool) -> Self {
        self.restrict_to_live_types = restrict;
        self
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).wrap_err("Failed to parse capture config as TOML")
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read config file: {path:?}"))?;
        let config = Self::from_toml_str(&content)?;
        debug!("Loaded capture configuration from {:?}", path);
        Ok(config)
    }

    /// Load a configuration file, writing the default configuration there if it does not exist
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("Config file not found, creating default at {:?}", path);
            let config = Self::default();
            config.save(path)?;
            return Ok(config);
        }
        Self::load(path)
    }

    /// Save the configuration as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .wrap_err_with(|| format!("Failed to create config directory: {parent:?}"))?;
        }
        let content =
            toml::to_string_pretty(self).wrap_err("Failed to serialize capture config to TOML")?;
        fs::write(path, content)
            .wrap_err_with(|| format!("Failed to write config file: {path:?}"))?;
        debug!("Saved capture configuration to {:?}", path);
        Ok(())
    }
}
