//! Runtime policies: exception reactions and deregistration reasons
//!
//! Both sets are closed, so they are plain enums rather than traits.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reaction applied when an event handler returns an error
///
/// The effective reaction is resolved along the chain
/// agent -> cooperation -> environment; `Inherit` defers to the next level
/// and the environment's default is `Abort`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionReaction {
    /// Abort the process immediately after a logged error
    Abort,
    /// Switch the agent to awaiting-deregistration and stop the environment
    ShutdownEnvironment,
    /// Switch the agent to awaiting-deregistration and deregister its
    /// cooperation with reason `Exception`
    DeregisterCoop,
    /// Continue as if the handler had succeeded
    Ignore,
    /// Defer to the next level of the reaction chain
    Inherit,
}

impl Default for ExceptionReaction {
    fn default() -> Self {
        Self::Inherit
    }
}

/// Why a cooperation was (or is being) deregistered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeregReason {
    /// Explicit deregistration by application code
    Normal,
    /// Environment shutdown
    Shutdown,
    /// The parent cooperation was deregistered
    ParentDereg,
    /// An event handler failed with reaction `DeregisterCoop`
    Exception,
    /// Application-defined reason code
    User(u64),
}

impl fmt::Display for DeregReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Shutdown => write!(f, "shutdown"),
            Self::ParentDereg => write!(f, "parent_dereg"),
            Self::Exception => write!(f, "exception"),
            Self::User(code) => write!(f, "user({})", code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dereg_reason_display() {
        assert_eq!(DeregReason::Normal.to_string(), "normal");
        assert_eq!(DeregReason::ParentDereg.to_string(), "parent_dereg");
        assert_eq!(DeregReason::User(7).to_string(), "user(7)");
    }

    #[test]
    fn test_default_reaction_is_inherit() {
        assert_eq!(ExceptionReaction::default(), ExceptionReaction::Inherit);
    }
}
