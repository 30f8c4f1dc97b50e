//! Priority lanes.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ModelError;

/// Named priority partition of the job queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Critical,
    Default,
    Low,
}

impl Lane {
    pub const ALL: [Lane; 3] = [Lane::Critical, Lane::Default, Lane::Low];

    /// Derive the lane from the requested quality.
    pub fn from_quality(quality: &str) -> Self {
        match quality.trim().to_ascii_lowercase().as_str() {
            "4k" | "2160p" => Lane::Critical,
            "1080p" | "best" => Lane::Default,
            _ => Lane::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Critical => "critical",
            Lane::Default => "default",
            Lane::Low => "low",
        }
    }

    /// Default share of worker capacity.
    pub fn default_weight(&self) -> u32 {
        match self {
            Lane::Critical => 6,
            Lane::Default => 3,
            Lane::Low => 1,
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Lane {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Lane::Critical),
            "default" => Ok(Lane::Default),
            "low" => Ok(Lane::Low),
            other => Err(ModelError::InvalidLane(other.to_string())),
        }
    }
}
