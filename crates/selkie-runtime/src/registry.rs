//! Cooperation registry
//!
//! Process-wide index of cooperations for one environment. Enforces name
//! uniqueness, parent/child ordering, and the deregistration protocol:
//! initiation marks the cooperation and its children, drain lets every
//! agent's pending demands execute before its finish demand, and the final
//! phase removes the cooperation and fires notifications only after all
//! its agents finished and all its children completed their own final
//! phase.
//!
//! Locking: one mutex guards the whole index. Nothing under the lock calls
//! user code; finish demands are pushed and notifiers run after release.

use crate::agent::{AgentHandle, AgentStatus};
use crate::coop::{Cooperation, CoopNameSpec, DeregNotifier};
use crate::demand::Demand;
use crate::dispatcher::DispatcherBinder;
use crate::environment::Environment;
use crate::sync::lock;
use selkie_core::{log_error, DeregReason, Error, ExceptionReaction, Result};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoopPhase {
    /// Reserved in the index; agents are being defined and bound.
    /// Registration can still fail and roll back.
    Registering,
    /// Agents are bound and started; registration can no longer fail.
    /// Children may attach, but deregistration is deferred until the
    /// registration notifiers have run.
    Starting,
    /// Fully installed
    Registered,
    /// Teardown initiated; agents are draining
    Deregistering,
}

struct CoopEntry {
    phase: CoopPhase,
    parent: Option<String>,
    agents: Vec<Arc<AgentHandle>>,
    binders: Vec<Arc<dyn DispatcherBinder>>,
    /// Agents that have not yet executed their finish demand
    pending_agents: usize,
    /// Children that have not yet completed their final phase
    live_children: usize,
    reason: Option<DeregReason>,
    /// Deregistration requested while still registering; honored once
    /// registration completes
    pending_dereg: Option<DeregReason>,
    dereg_notifiers: Vec<DeregNotifier>,
    exception_reaction: ExceptionReaction,
}

struct RegistryInner {
    coops: HashMap<String, CoopEntry>,
    closed: bool,
    autoname_seq: u64,
}

pub(crate) struct CoopRegistry {
    inner: Mutex<RegistryInner>,
    drained: Condvar,
}

impl CoopRegistry {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                coops: HashMap::new(),
                closed: false,
                autoname_seq: 0,
            }),
            drained: Condvar::new(),
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register a cooperation: all-or-nothing
    pub(crate) fn register(&self, env: &Environment, coop: Cooperation) -> Result<String> {
        let Cooperation {
            name,
            parent,
            agents,
            reg_notifiers,
            dereg_notifiers,
            exception_reaction,
            default_binder,
        } = coop;

        // Reserve the name and the parent edge.
        let name = {
            let mut inner = lock(&self.inner);
            if inner.closed {
                return Err(Error::ShuttingDown);
            }
            let name = match name {
                CoopNameSpec::Named(name) => {
                    if inner.coops.contains_key(&name) {
                        return Err(Error::DuplicateCoopName { name });
                    }
                    name
                }
                CoopNameSpec::Auto => loop {
                    inner.autoname_seq += 1;
                    let candidate = format!("__auto_{}", inner.autoname_seq);
                    if !inner.coops.contains_key(&candidate) {
                        break candidate;
                    }
                },
            };
            if agents.is_empty() {
                return Err(Error::EmptyCoop { name });
            }
            if let Some(parent_name) = &parent {
                if *parent_name == name {
                    return Err(Error::CyclicParent { name });
                }
                match inner.coops.get_mut(parent_name) {
                    None => {
                        return Err(Error::ParentCoopNotFound {
                            name: parent_name.clone(),
                        })
                    }
                    Some(entry) => match entry.phase {
                        CoopPhase::Deregistering => {
                            return Err(Error::ParentCoopDeregistering {
                                name: parent_name.clone(),
                            })
                        }
                        CoopPhase::Registering => {
                            return Err(Error::ParentCoopNotFound {
                                name: parent_name.clone(),
                            })
                        }
                        CoopPhase::Starting | CoopPhase::Registered => entry.live_children += 1,
                    },
                }
            }
            inner.coops.insert(
                name.clone(),
                CoopEntry {
                    phase: CoopPhase::Registering,
                    parent: parent.clone(),
                    agents: Vec::new(),
                    binders: Vec::new(),
                    pending_agents: agents.len(),
                    live_children: 0,
                    reason: None,
                    pending_dereg: None,
                    dereg_notifiers,
                    exception_reaction,
                },
            );
            name
        };

        // Define every agent on this thread; no registry lock held, so
        // user code in `define` may freely use the environment.
        let mut handles: Vec<Arc<AgentHandle>> = Vec::with_capacity(agents.len());
        let mut binders: Vec<Arc<dyn DispatcherBinder>> = Vec::with_capacity(agents.len());
        let mut failure: Option<Error> = None;
        for def in agents {
            let binder = def
                .binder
                .or_else(|| default_binder.clone())
                .unwrap_or_else(|| env.default_binder());
            let handle = env.create_agent_handle(def.agent, def.options);
            handle.assign_coop(&name);
            handles.push(handle.clone());
            binders.push(binder);
            if let Err(err) = handle.run_define(env) {
                failure = Some(err);
                break;
            }
        }

        // Bind every agent to its dispatcher; partial binds roll back.
        let mut queues = Vec::with_capacity(handles.len());
        if failure.is_none() {
            for (index, (handle, binder)) in handles.iter().zip(binders.iter()).enumerate() {
                match binder.bind(handle) {
                    Ok(queue) => queues.push(queue),
                    Err(err) => {
                        for unbind_index in 0..index {
                            binders[unbind_index].unbind(&handles[unbind_index]);
                        }
                        failure = Some(err);
                        break;
                    }
                }
            }
        }

        if let Some(err) = failure {
            for handle in &handles {
                handle.rollback();
            }
            let mut inner = lock(&self.inner);
            inner.coops.remove(&name);
            if let Some(parent_name) = &parent {
                if let Some(parent_entry) = inner.coops.get_mut(parent_name) {
                    parent_entry.live_children -= 1;
                }
            }
            return Err(err);
        }

        // Publish the agent list and enter `Starting`: the cooperation is
        // now visible as a parent, but a deregistration triggered from an
        // early start demand stays deferred until the notifiers ran, which
        // keeps the registered notification ahead of the deregistered one.
        {
            let mut inner = lock(&self.inner);
            if let Some(entry) = inner.coops.get_mut(&name) {
                entry.phase = CoopPhase::Starting;
                entry.agents = handles.clone();
                entry.binders = binders;
            }
        }
        for (handle, queue) in handles.iter().zip(queues) {
            handle.bind_to_dispatcher(queue);
        }

        for notifier in &reg_notifiers {
            if let Err(err) = notifier(env, &name) {
                log_error!(
                    env.error_logger(),
                    "registration notifier failed for cooperation {}: {}",
                    name,
                    err
                );
            }
        }

        let deferred = {
            let mut inner = lock(&self.inner);
            match inner.coops.get_mut(&name) {
                Some(entry) => {
                    entry.phase = CoopPhase::Registered;
                    entry.pending_dereg.take()
                }
                None => None,
            }
        };
        info!(coop = %name, "cooperation registered");
        if let Some(reason) = deferred {
            self.deregister(env, &name, reason)?;
        }
        Ok(name)
    }

    // =========================================================================
    // Deregistration
    // =========================================================================

    /// Initiate deregistration; idempotent, first reason wins
    pub(crate) fn deregister(
        &self,
        _env: &Environment,
        name: &str,
        reason: DeregReason,
    ) -> Result<()> {
        let finish_targets = {
            let mut inner = lock(&self.inner);
            if !inner.coops.contains_key(name) {
                return Err(Error::CoopNotFound {
                    name: name.to_string(),
                });
            }
            let mut targets = Vec::new();
            mark_deregistering(&mut inner, name, reason, &mut targets);
            targets
        };
        push_finish_demands(finish_targets);
        Ok(())
    }

    /// Close the registry and deregister everything with the given reason
    pub(crate) fn close_and_deregister_all(&self, reason: DeregReason) {
        let finish_targets = {
            let mut inner = lock(&self.inner);
            inner.closed = true;
            let names: Vec<String> = inner.coops.keys().cloned().collect();
            let mut targets = Vec::new();
            for name in names {
                mark_one(&mut inner, &name, reason, &mut targets);
            }
            targets
        };
        push_finish_demands(finish_targets);
    }

    /// Called when one agent has executed its finish demand
    ///
    /// Walks up the parent chain finalizing every cooperation that became
    /// ready; children always finalize (and notify) before their parent.
    pub(crate) fn agent_finished(&self, env: &Environment, coop_name: &str) {
        let (finalized, drained) = {
            let mut inner = lock(&self.inner);
            if let Some(entry) = inner.coops.get_mut(coop_name) {
                debug_assert!(entry.pending_agents > 0, "agent finished twice");
                entry.pending_agents = entry.pending_agents.saturating_sub(1);
            }

            let mut finalized = Vec::new();
            let mut current = Some(coop_name.to_string());
            while let Some(name) = current {
                let ready = inner.coops.get(&name).is_some_and(|entry| {
                    entry.phase == CoopPhase::Deregistering
                        && entry.pending_agents == 0
                        && entry.live_children == 0
                });
                if !ready {
                    break;
                }
                let Some(entry) = inner.coops.remove(&name) else {
                    break;
                };
                let parent = entry.parent.clone();
                if let Some(parent_name) = &parent {
                    if let Some(parent_entry) = inner.coops.get_mut(parent_name) {
                        parent_entry.live_children =
                            parent_entry.live_children.saturating_sub(1);
                    }
                }
                finalized.push((name, entry));
                current = parent;
            }
            (finalized, inner.coops.is_empty())
        };

        for (name, entry) in finalized {
            let reason = entry.reason.unwrap_or(DeregReason::Normal);
            for (agent, binder) in entry.agents.iter().zip(entry.binders.iter()) {
                binder.unbind(agent);
            }
            for notifier in &entry.dereg_notifiers {
                if let Err(err) = notifier(env, &name, reason) {
                    log_error!(
                        env.error_logger(),
                        "deregistration notifier failed for cooperation {}: {}; aborting",
                        name,
                        err
                    );
                    std::process::abort();
                }
            }
            info!(coop = %name, %reason, "cooperation deregistered");
        }

        if drained {
            self.drained.notify_all();
        }
    }

    /// Block until no cooperations remain
    pub(crate) fn wait_until_drained(&self) {
        let mut inner = lock(&self.inner);
        while !inner.coops.is_empty() {
            inner = self
                .drained
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Cooperation level of the exception-reaction chain
    pub(crate) fn coop_exception_reaction(&self, name: &str) -> ExceptionReaction {
        let inner = lock(&self.inner);
        inner
            .coops
            .get(name)
            .map(|entry| entry.exception_reaction)
            .unwrap_or(ExceptionReaction::Inherit)
    }

    /// Number of registered cooperations
    pub(crate) fn coop_count(&self) -> usize {
        lock(&self.inner).coops.len()
    }
}

/// Mark `name` and all its descendants as deregistering
fn mark_deregistering(
    inner: &mut RegistryInner,
    name: &str,
    reason: DeregReason,
    targets: &mut Vec<Arc<AgentHandle>>,
) {
    let mut work = vec![(name.to_string(), reason)];
    while let Some((current, current_reason)) = work.pop() {
        if mark_one(inner, &current, current_reason, targets) {
            for (child, entry) in inner.coops.iter() {
                if entry.parent.as_deref() == Some(&current) {
                    work.push((child.clone(), DeregReason::ParentDereg));
                }
            }
        }
    }
}

/// Mark one cooperation; true if it transitioned to `Deregistering` now
fn mark_one(
    inner: &mut RegistryInner,
    name: &str,
    reason: DeregReason,
    targets: &mut Vec<Arc<AgentHandle>>,
) -> bool {
    let Some(entry) = inner.coops.get_mut(name) else {
        return false;
    };
    match entry.phase {
        CoopPhase::Deregistering => false,
        CoopPhase::Registering | CoopPhase::Starting => {
            if entry.pending_dereg.is_none() {
                entry.pending_dereg = Some(reason);
            }
            false
        }
        CoopPhase::Registered => {
            entry.phase = CoopPhase::Deregistering;
            entry.reason = Some(reason);
            debug!(coop = %name, %reason, "cooperation deregistration initiated");
            for agent in &entry.agents {
                agent.set_status(AgentStatus::AwaitingDeregistration);
                targets.push(agent.clone());
            }
            true
        }
    }
}

/// Enqueue finish demands behind each agent's pending work
fn push_finish_demands(targets: Vec<Arc<AgentHandle>>) {
    for agent in targets {
        let _ = agent.push_event(Demand::finish(agent.clone()));
    }
}

#[cfg(test)]
mod tests {
    use crate::agent::Agent;
    use crate::coop::Cooperation;
    use crate::environment::Environment;
    use selkie_core::{DeregReason, EnvConfig, Error};

    struct Idle;
    impl Agent for Idle {}

    fn unstarted_env() -> Environment {
        // Dispatchers are never started: binds succeed, demands are
        // discarded, which is all these error-path tests need.
        Environment::new(EnvConfig::default()).unwrap()
    }

    #[test]
    fn test_empty_coop_rejected() {
        let env = unstarted_env();
        let coop = Cooperation::new("empty");
        assert!(matches!(
            env.register_coop(coop),
            Err(Error::EmptyCoop { .. })
        ));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let env = unstarted_env();
        let mut first = Cooperation::new("workers");
        first.add_agent(Idle);
        env.register_coop(first).unwrap();

        let mut second = Cooperation::new("workers");
        second.add_agent(Idle);
        assert!(matches!(
            env.register_coop(second),
            Err(Error::DuplicateCoopName { .. })
        ));
    }

    #[test]
    fn test_unknown_parent_rejected() {
        let env = unstarted_env();
        let mut coop = Cooperation::new("orphan");
        coop.set_parent("ghost");
        coop.add_agent(Idle);
        assert!(matches!(
            env.register_coop(coop),
            Err(Error::ParentCoopNotFound { .. })
        ));
    }

    #[test]
    fn test_self_parent_rejected() {
        let env = unstarted_env();
        let mut coop = Cooperation::new("loop");
        coop.set_parent("loop");
        coop.add_agent(Idle);
        assert!(matches!(
            env.register_coop(coop),
            Err(Error::CyclicParent { .. })
        ));
    }

    #[test]
    fn test_deregister_unknown_coop() {
        let env = unstarted_env();
        assert!(matches!(
            env.deregister_coop("ghost", DeregReason::Normal),
            Err(Error::CoopNotFound { .. })
        ));
    }

    #[test]
    fn test_autoname_is_unique() {
        let env = unstarted_env();
        let mut first = Cooperation::autonamed();
        first.add_agent(Idle);
        let mut second = Cooperation::autonamed();
        second.add_agent(Idle);
        let name_a = env.register_coop(first).unwrap();
        let name_b = env.register_coop(second).unwrap();
        assert_ne!(name_a, name_b);
        assert_eq!(env.coop_count(), 2);
    }
}
