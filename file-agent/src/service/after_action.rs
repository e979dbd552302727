//! Post-mutation directives for the managed process.

use crate::utils::errors::AgentError;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AfterAction {
    #[default]
    None,
    /// Restart regardless of state; a failed restart is reported, not raised
    Restart,
    /// Restart only when the process is currently running
    RestartIfRunning,
    /// Restart, and fail the request if the restart fails
    MustRestart,
}

impl AfterAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AfterAction::None => "none",
            AfterAction::Restart => "restart",
            AfterAction::RestartIfRunning => "restart-if-running",
            AfterAction::MustRestart => "must-restart",
        }
    }

    /// Legacy numeric codes used by older controllers.
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(AfterAction::None),
            1 => Some(AfterAction::Restart),
            2 => Some(AfterAction::RestartIfRunning),
            3 => Some(AfterAction::MustRestart),
            _ => None,
        }
    }
}

impl fmt::Display for AfterAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AfterAction {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "" | "none" => Ok(AfterAction::None),
            "restart" => Ok(AfterAction::Restart),
            "restart-if-running" => Ok(AfterAction::RestartIfRunning),
            "must-restart" => Ok(AfterAction::MustRestart),
            other => other
                .parse::<u64>()
                .ok()
                .and_then(AfterAction::from_code)
                .ok_or_else(|| AgentError::InvalidArgument(format!("unknown after action: {}", s))),
        }
    }
}

impl<'de> Deserialize<'de> for AfterAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Code(u64),
            Name(String),
        }

        match Wire::deserialize(deserializer)? {
            Wire::Code(code) => AfterAction::from_code(code)
                .ok_or_else(|| serde::de::Error::custom(format!("unknown after action code: {}", code))),
            Wire::Name(name) => name.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Outcome of an after-action, returned with the mutation result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AfterActionReport {
    pub action: AfterAction,
    /// Whether a restart was attempted
    pub performed: bool,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
