//! Identity of this process within a deployment.
//!
//! ```toml
//! [instance]
//! instance_type = "main"
//! role = "leader"
//! ```

use serde::{Deserialize, Serialize};

/// What kind of process this is. Only `main` processes run background
/// maintenance such as compaction.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstanceType {
    #[default]
    Main,
    Worker,
    Webhook,
}

impl std::fmt::Display for InstanceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceType::Main => write!(f, "main"),
            InstanceType::Worker => write!(f, "worker"),
            InstanceType::Webhook => write!(f, "webhook"),
        }
    }
}

/// Leadership role among `main` instances.
///
/// `unset` means leadership has not been decided; background work refuses to
/// initialise in that state.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstanceRole {
    Unset,
    /// Single-instance deployments are their own leader.
    #[default]
    Leader,
    Follower,
}

impl std::fmt::Display for InstanceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceRole::Unset => write!(f, "unset"),
            InstanceRole::Leader => write!(f, "leader"),
            InstanceRole::Follower => write!(f, "follower"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceConfig {
    #[serde(default)]
    pub instance_type: InstanceType,

    /// Role at startup. Changes afterwards arrive as lifecycle events.
    #[serde(default)]
    pub role: InstanceRole,
}
