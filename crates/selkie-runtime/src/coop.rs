//! Cooperations
//!
//! A cooperation is the atomic unit of agent registration and teardown:
//! either every agent of the cooperation is defined, bound, and started, or
//! none is. Cooperations form a parent/child hierarchy by name; a child
//! never outlives its parent's deregistration.
//!
//! This module holds the builder side. The registered runtime state lives
//! in the registry.

use crate::agent::{Agent, AgentOptions};
use crate::dispatcher::DispatcherBinder;
use crate::environment::Environment;
use crate::mailbox::Mbox;
use selkie_core::{DeregReason, Error, ExceptionReaction, Result};
use std::sync::Arc;

/// Notification delivered when a cooperation finishes registration
pub struct CoopRegistered {
    /// Name of the registered cooperation
    pub coop: String,
}

/// Notification delivered when a cooperation finishes deregistration
pub struct CoopDeregistered {
    /// Name of the deregistered cooperation
    pub coop: String,
    /// Why it was deregistered
    pub reason: DeregReason,
}

/// Registration notifier, run after a cooperation registers
pub type RegNotifier = Box<dyn Fn(&Environment, &str) -> Result<()> + Send + Sync>;

/// Deregistration notifier, run after a cooperation fully deregisters
///
/// A failing deregistration notifier is fatal: the process aborts after a
/// logged error.
pub type DeregNotifier = Box<dyn Fn(&Environment, &str, DeregReason) -> Result<()> + Send + Sync>;

/// Notifier delivering [`CoopRegistered`] to a mailbox
pub fn reg_notifier_to(mbox: &Mbox) -> RegNotifier {
    let mbox = mbox.clone();
    Box::new(move |_env, coop| {
        match mbox.deliver(CoopRegistered {
            coop: coop.to_string(),
        }) {
            // The installer may already be gone; that race is benign.
            Err(Error::AgentShutDown) | Err(Error::UnknownMessageType { .. }) => Ok(()),
            other => other,
        }
    })
}

/// Notifier delivering [`CoopDeregistered`] to a mailbox
pub fn dereg_notifier_to(mbox: &Mbox) -> DeregNotifier {
    let mbox = mbox.clone();
    Box::new(move |_env, coop, reason| {
        match mbox.deliver(CoopDeregistered {
            coop: coop.to_string(),
            reason,
        }) {
            Err(Error::AgentShutDown) | Err(Error::UnknownMessageType { .. }) => Ok(()),
            other => other,
        }
    })
}

pub(crate) enum CoopNameSpec {
    Named(String),
    Auto,
}

pub(crate) struct AgentDef {
    pub agent: Box<dyn Agent>,
    pub options: AgentOptions,
    pub binder: Option<Arc<dyn DispatcherBinder>>,
}

/// Builder for one cooperation, consumed by
/// [`Environment::register_coop`](crate::environment::Environment::register_coop)
pub struct Cooperation {
    pub(crate) name: CoopNameSpec,
    pub(crate) parent: Option<String>,
    pub(crate) agents: Vec<AgentDef>,
    pub(crate) reg_notifiers: Vec<RegNotifier>,
    pub(crate) dereg_notifiers: Vec<DeregNotifier>,
    pub(crate) exception_reaction: ExceptionReaction,
    pub(crate) default_binder: Option<Arc<dyn DispatcherBinder>>,
}

impl Cooperation {
    /// A cooperation with an explicit, process-unique name
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_name_spec(CoopNameSpec::Named(name.into()))
    }

    /// A cooperation named automatically at registration
    pub fn autonamed() -> Self {
        Self::with_name_spec(CoopNameSpec::Auto)
    }

    fn with_name_spec(name: CoopNameSpec) -> Self {
        Self {
            name,
            parent: None,
            agents: Vec::new(),
            reg_notifiers: Vec::new(),
            dereg_notifiers: Vec::new(),
            exception_reaction: ExceptionReaction::Inherit,
            default_binder: None,
        }
    }

    /// Replace the name
    pub fn set_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = CoopNameSpec::Named(name.into());
        self
    }

    /// Chain this cooperation under a parent
    ///
    /// The parent must be registered and not deregistering when this
    /// cooperation registers; it cannot complete its own deregistration
    /// until this one has.
    pub fn set_parent(&mut self, parent: impl Into<String>) -> &mut Self {
        self.parent = Some(parent.into());
        self
    }

    /// Cooperation level of the exception-reaction chain
    pub fn set_exception_reaction(&mut self, reaction: ExceptionReaction) -> &mut Self {
        self.exception_reaction = reaction;
        self
    }

    /// Binder used for agents that do not carry their own
    pub fn set_default_binder(&mut self, binder: Arc<dyn DispatcherBinder>) -> &mut Self {
        self.default_binder = Some(binder);
        self
    }

    /// Add an agent with default options, bound by the default binder
    pub fn add_agent<A: Agent>(&mut self, agent: A) -> &mut Self {
        self.agents.push(AgentDef {
            agent: Box::new(agent),
            options: AgentOptions::default(),
            binder: None,
        });
        self
    }

    /// Add an agent with explicit options
    pub fn add_agent_with<A: Agent>(&mut self, agent: A, options: AgentOptions) -> &mut Self {
        self.agents.push(AgentDef {
            agent: Box::new(agent),
            options,
            binder: None,
        });
        self
    }

    /// Add an agent with explicit options and its own dispatcher binder
    pub fn add_agent_bound<A: Agent>(
        &mut self,
        agent: A,
        options: AgentOptions,
        binder: Arc<dyn DispatcherBinder>,
    ) -> &mut Self {
        self.agents.push(AgentDef {
            agent: Box::new(agent),
            options,
            binder: Some(binder),
        });
        self
    }

    /// Install a registration notifier
    pub fn add_reg_notifier(&mut self, notifier: RegNotifier) -> &mut Self {
        self.reg_notifiers.push(notifier);
        self
    }

    /// Install a deregistration notifier
    pub fn add_dereg_notifier(&mut self, notifier: DeregNotifier) -> &mut Self {
        self.dereg_notifiers.push(notifier);
        self
    }
}
