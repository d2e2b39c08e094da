//! Environment: the root object wiring registry and dispatchers
//!
//! One process may host any number of independent environments; there is
//! no global state. [`run`] is the entry point: it constructs an
//! environment, starts the default dispatcher, hands control to the init
//! function, and blocks until [`Environment::stop`] and full
//! deregistration of every cooperation.

use crate::agent::{Agent, AgentHandle, AgentId, AgentOptions};
use crate::coop::Cooperation;
use crate::dispatcher::{DispatcherBinder, DispatcherControl, ThreadPoolDispatcher};
use crate::mailbox::{Mbox, MboxId};
use crate::registry::CoopRegistry;
use crate::sync::lock;
use selkie_core::{
    stderr_logger, DeregReason, EnvConfig, ErrorLogger, ExceptionReaction, Result,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use tracing::{debug, info};

pub(crate) struct EnvInner {
    config: EnvConfig,
    logger: Arc<dyn ErrorLogger>,
    registry: CoopRegistry,
    pool: ThreadPoolDispatcher,
    extra_dispatchers: Mutex<Vec<Arc<dyn DispatcherControl>>>,
    mbox_seq: AtomicU64,
    agent_seq: AtomicU64,
    stop_flag: Mutex<bool>,
    stop_cond: Condvar,
}

/// Handle to one runtime environment; cheap to clone
#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvInner>,
}

impl Environment {
    pub(crate) fn new(config: EnvConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(EnvInner {
                config,
                logger: stderr_logger(),
                registry: CoopRegistry::new(),
                pool: ThreadPoolDispatcher::new(),
                extra_dispatchers: Mutex::new(Vec::new()),
                // Ids start at 1; 0 is the "none" sentinel.
                mbox_seq: AtomicU64::new(1),
                agent_seq: AtomicU64::new(1),
                stop_flag: Mutex::new(false),
                stop_cond: Condvar::new(),
            }),
        })
    }

    pub(crate) fn start(&self) -> Result<()> {
        let dispatcher = &self.inner.config.dispatcher;
        self.inner.pool.start(
            self,
            dispatcher.worker_threads_count,
            dispatcher.demand_batch_count,
        )
    }

    // =========================================================================
    // Mailboxes
    // =========================================================================

    /// Create an anonymous MPMC mailbox
    pub fn create_mbox(&self) -> Mbox {
        Mbox::mpmc(self.next_mbox_id(), None, self.inner.logger.clone())
    }

    /// Create a named MPMC mailbox
    pub fn create_named_mbox(&self, name: impl Into<String>) -> Mbox {
        let name: Arc<str> = name.into().into();
        Mbox::mpmc(self.next_mbox_id(), Some(name), self.inner.logger.clone())
    }

    pub(crate) fn next_mbox_id(&self) -> MboxId {
        MboxId(self.inner.mbox_seq.fetch_add(1, Ordering::Relaxed))
    }

    // =========================================================================
    // Cooperations
    // =========================================================================

    /// Register a cooperation; atomic, all-or-nothing
    pub fn register_coop(&self, coop: Cooperation) -> Result<String> {
        self.inner.registry.register(self, coop)
    }

    /// Build and register an anonymous cooperation in one call
    ///
    /// The builder may rename it with
    /// [`Cooperation::set_name`](crate::coop::Cooperation::set_name).
    pub fn introduce_coop<F>(&self, build: F) -> Result<String>
    where
        F: FnOnce(&mut Cooperation) -> Result<()>,
    {
        let mut coop = Cooperation::autonamed();
        build(&mut coop)?;
        self.register_coop(coop)
    }

    /// Register a single agent as its own cooperation
    pub fn register_agent_as_coop<A: Agent>(
        &self,
        name: impl Into<String>,
        agent: A,
    ) -> Result<String> {
        let mut coop = Cooperation::new(name);
        coop.add_agent(agent);
        self.register_coop(coop)
    }

    /// Initiate deregistration of a cooperation
    pub fn deregister_coop(&self, name: &str, reason: DeregReason) -> Result<()> {
        self.inner.registry.deregister(self, name, reason)
    }

    /// Number of currently registered cooperations
    pub fn coop_count(&self) -> usize {
        self.inner.registry.coop_count()
    }

    pub(crate) fn agent_finished(&self, coop_name: &str) {
        self.inner.registry.agent_finished(self, coop_name);
    }

    pub(crate) fn coop_exception_reaction(&self, name: &str) -> ExceptionReaction {
        self.inner.registry.coop_exception_reaction(name)
    }

    // =========================================================================
    // Agents and dispatchers
    // =========================================================================

    pub(crate) fn create_agent_handle(
        &self,
        user: Box<dyn Agent>,
        options: AgentOptions,
    ) -> Arc<AgentHandle> {
        let id = AgentId(self.inner.agent_seq.fetch_add(1, Ordering::Relaxed));
        AgentHandle::create(
            id,
            self.next_mbox_id(),
            self.inner.logger.clone(),
            user,
            options,
        )
    }

    /// Binder targeting the default thread-pool dispatcher
    pub fn default_binder(&self) -> Arc<dyn DispatcherBinder> {
        self.inner.pool.binder()
    }

    pub(crate) fn track_dispatcher(&self, dispatcher: Arc<dyn DispatcherControl>) {
        lock(&self.inner.extra_dispatchers).push(dispatcher);
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Request environment shutdown; callable from any thread
    ///
    /// Returns immediately; [`run`] performs the actual teardown.
    pub fn stop(&self) {
        let mut flag = lock(&self.inner.stop_flag);
        if !*flag {
            info!("environment stop requested");
            *flag = true;
            self.inner.stop_cond.notify_all();
        }
    }

    pub(crate) fn wait_stop_requested(&self) {
        let mut flag = lock(&self.inner.stop_flag);
        while !*flag {
            flag = self
                .inner
                .stop_cond
                .wait(flag)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub(crate) fn shutdown(&self) {
        debug!("environment shutting down");
        self.inner
            .registry
            .close_and_deregister_all(DeregReason::Shutdown);
        self.inner.registry.wait_until_drained();
        for dispatcher in lock(&self.inner.extra_dispatchers).drain(..) {
            dispatcher.stop_and_join();
        }
        self.inner.pool.stop();
        debug!("environment stopped");
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The environment configuration
    pub fn config(&self) -> &EnvConfig {
        &self.inner.config
    }

    /// The error-logger sink
    pub fn error_logger(&self) -> &Arc<dyn ErrorLogger> {
        &self.inner.logger
    }

    pub(crate) fn exception_reaction(&self) -> ExceptionReaction {
        self.inner.config.exception_reaction
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("coops", &self.coop_count())
            .finish()
    }
}

/// Construct an environment, run `init`, and block until shutdown
///
/// Returns once [`Environment::stop`] has been requested, every
/// cooperation has deregistered, and all worker threads have exited. If
/// `init` fails, the environment is torn down and the error is returned.
pub fn run<F>(init: F) -> Result<()>
where
    F: FnOnce(&Environment) -> Result<()>,
{
    run_with_config(EnvConfig::default(), init)
}

/// [`run`] with an explicit configuration
pub fn run_with_config<F>(config: EnvConfig, init: F) -> Result<()>
where
    F: FnOnce(&Environment) -> Result<()>,
{
    let env = Environment::new(config)?;
    env.start()?;
    let init_result = init(&env);
    if init_result.is_ok() {
        env.wait_stop_requested();
    }
    env.shutdown();
    init_result
}
