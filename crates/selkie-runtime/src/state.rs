//! Per-agent finite-state machine support
//!
//! Every agent owns a set of states; index 0 is the distinguished default
//! state, created by the runtime. States are lightweight handles (owner id,
//! index, name) so they can be stored in the agent struct and cloned
//! freely. Using a state with an agent that does not own it is a hard
//! error, checked at every use.

use crate::agent::{AgentContext, AgentId};
use std::fmt;
use std::sync::Arc;

/// Index of the default state inside an agent's state table
pub(crate) const DEFAULT_STATE_INDEX: u32 = 0;

pub(crate) const DEFAULT_STATE_NAME: &str = "<DEFAULT>";

/// Handle to one state of one agent
///
/// `State::default()` is a detached placeholder owned by no agent; it exists
/// so agent structs can derive `Default` and assign real states from
/// [`AgentContext::make_state`] inside `define`. Using the placeholder in
/// `change_state` or a subscription fails with `StateNotOwned`.
#[derive(Debug, Clone)]
pub struct State {
    owner: AgentId,
    index: u32,
    name: Option<Arc<str>>,
}

impl State {
    pub(crate) fn new(owner: AgentId, index: u32, name: Option<Arc<str>>) -> Self {
        Self { owner, index, name }
    }

    pub(crate) fn owner(&self) -> AgentId {
        self.owner
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    /// The state's name; anonymous states report their index
    pub fn name(&self) -> String {
        match &self.name {
            Some(name) => name.to_string(),
            None => format!("<state:{}>", self.index),
        }
    }

    /// True for the agent's default state
    pub fn is_default(&self) -> bool {
        self.index == DEFAULT_STATE_INDEX && self.owner != AgentId::NONE
    }
}

impl Default for State {
    fn default() -> Self {
        Self {
            owner: AgentId::NONE,
            index: u32::MAX,
            name: None,
        }
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.owner == other.owner && self.index == other.index
    }
}

impl Eq for State {}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Metadata the agent keeps per created state
#[derive(Debug, Clone)]
pub(crate) struct StateMeta {
    pub name: Option<Arc<str>>,
}

/// A state-change listener installed on an agent
///
/// Listeners observe `(old, new)` synchronously after the switch, on the
/// working thread. The owned variant is dropped with the agent; the shared
/// variant lets the installer keep using the same listener elsewhere.
pub(crate) enum ListenerEntry {
    Owned(Box<dyn FnMut(&mut AgentContext<'_>, &State, &State) + Send>),
    Shared(Arc<dyn Fn(&mut AgentContext<'_>, &State, &State) + Send + Sync>),
}

impl ListenerEntry {
    pub(crate) fn call(&mut self, ctx: &mut AgentContext<'_>, old: &State, new: &State) {
        match self {
            Self::Owned(f) => f(ctx, old, new),
            Self::Shared(f) => f(ctx, old, new),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_is_detached() {
        let state = State::default();
        assert_eq!(state.owner(), AgentId::NONE);
        assert!(!state.is_default());
    }

    #[test]
    fn test_state_equality_ignores_name() {
        let id = AgentId::NONE;
        let a = State::new(id, 1, Some("one".into()));
        let b = State::new(id, 1, None);
        let c = State::new(id, 2, Some("one".into()));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_state_name() {
        let state = State::new(AgentId::NONE, 3, Some("busy".into()));
        assert_eq!(state.name(), "busy");
        let anon = State::new(AgentId::NONE, 3, None);
        assert_eq!(anon.name(), "<state:3>");
    }
}
