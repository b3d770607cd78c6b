//! Adapter configuration.

use crate::error::AdError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Environment variable read by [`AdConfig::from_env`].
pub const FLAVOR_ENV: &str = "ADCOMM_FLAVOR";

/// How received values get their tape index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolFlavor {
    /// Received values become fresh tape inputs.
    #[default]
    Plain,
    /// Received values are registered as outputs of the communication. The
    /// primal they overwrite is remembered and put back in the reverse sweep.
    PrimalRestore,
}

impl ToolFlavor {
    pub fn is_primal_restore(&self) -> bool {
        matches!(self, Self::PrimalRestore)
    }
}

impl FromStr for ToolFlavor {
    type Err = AdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "plain" => Ok(Self::Plain),
            "primal-restore" | "primal_restore" => Ok(Self::PrimalRestore),
            _ => Err(AdError::Config(format!(
                "invalid tool flavor '{s}', valid options are 'plain' and 'primal-restore'"
            ))),
        }
    }
}

impl fmt::Display for ToolFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => write!(f, "plain"),
            Self::PrimalRestore => write!(f, "primal-restore"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdConfig {
    pub flavor: ToolFlavor,
    /// Arm handles even when every contribution is passive. Only useful when
    /// debugging the sweep order, since such handles move nothing but zeros.
    pub record_passive: bool,
}

impl Default for AdConfig {
    fn default() -> Self {
        Self::plain()
    }
}

impl AdConfig {
    pub fn plain() -> Self {
        Self {
            flavor: ToolFlavor::Plain,
            record_passive: false,
        }
    }

    pub fn primal_restore() -> Self {
        Self {
            flavor: ToolFlavor::PrimalRestore,
            record_passive: false,
        }
    }

    /// Defaults, with the flavor taken from `ADCOMM_FLAVOR` when it is set
    /// to a valid value.
    pub fn from_env() -> Self {
        let flavor = std::env::var(FLAVOR_ENV)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        Self {
            flavor,
            ..Self::default()
        }
    }
}
