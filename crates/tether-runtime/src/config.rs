//! Runtime configuration
//!
//! Loaded from the `[gc]` table of a `tether.toml`:
//!
//! ```toml
//! [gc]
//! finalize_order = "globals-first"
//! collect_on_context_destroy = true
//! zeal = false
//! ```

use crate::error::RuntimeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub gc: GcConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GcConfig {
    /// Which kind of finalizer runs first within one collection
    pub finalize_order: FinalizeOrder,
    /// Collect as soon as a context is destroyed instead of waiting for the
    /// next explicit collection
    pub collect_on_context_destroy: bool,
    /// Collect on every allocation and call
    pub zeal: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            finalize_order: FinalizeOrder::default(),
            collect_on_context_destroy: false,
            zeal: false,
        }
    }
}

/// Order of the two finalizer phases within a collection.
///
/// Bridge code must be correct under either order, so the reference engine
/// lets tests pick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinalizeOrder {
    #[default]
    CallablesFirst,
    GlobalsFirst,
}

impl FinalizeOrder {
    pub const ALL: [FinalizeOrder; 2] = [FinalizeOrder::CallablesFirst, FinalizeOrder::GlobalsFirst];

    pub fn as_str(self) -> &'static str {
        match self {
            FinalizeOrder::CallablesFirst => "callables-first",
            FinalizeOrder::GlobalsFirst => "globals-first",
        }
    }
}

impl fmt::Display for FinalizeOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, RuntimeError> {
        Ok(toml::from_str(source)?)
    }

    pub fn load(path: &Path) -> Result<Self, RuntimeError> {
        let source = std::fs::read_to_string(path).map_err(|source| RuntimeError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&source)?;
        log::debug!("loaded runtime config from {}", path.display());
        Ok(config)
    }

    pub fn with_finalize_order(mut self, order: FinalizeOrder) -> Self {
        self.gc.finalize_order = order;
        self
    }

    pub fn with_zeal(mut self, zeal: bool) -> Self {
        self.gc.zeal = zeal;
        self
    }

    pub fn with_collect_on_context_destroy(mut self, collect: bool) -> Self {
        self.gc.collect_on_context_destroy = collect;
        self
    }
}
