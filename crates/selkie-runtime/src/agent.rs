//! Agent core
//!
//! An agent is user state plus handlers, driven one demand at a time. The
//! runtime side lives in [`AgentHandle`]: the direct mailbox, the
//! subscription store, the current state, the event-queue slot, and the
//! lifecycle status. User code only ever sees [`AgentContext`], a view
//! constructed for the duration of one hook or handler invocation.
//!
//! Lifecycle: `Created -> Defined -> Bound -> Running ->
//! AwaitingDeregistration -> Finished`. Binding enqueues the synthetic
//! start demand; deregistration enqueues the finish demand behind whatever
//! is already pending, so pending work drains in FIFO order first.

use crate::demand::{Demand, DemandKind, EventQueue};
use crate::environment::Environment;
use crate::limits::{LimitControlBlock, LimitStorage, MessageLimit};
use crate::mailbox::{Mbox, MboxId};
use crate::state::{ListenerEntry, State, StateMeta, DEFAULT_STATE_INDEX, DEFAULT_STATE_NAME};
use crate::subscription::{HandlerEntry, HandlerFn, InsertOutcome, SubscriptionStorage, ThreadSafety};
use crate::sync::{lock, read, write};
use selkie_core::{
    current_thread_id, log_error, resolve_request, DeregReason, Error, ErrorLogger,
    ExceptionReaction, Message, MessageRef, MsgType, RequestEnvelope, Result, Signal,
    THREAD_ID_NONE,
};
use std::any::Any;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use tracing::{debug, warn};

// =============================================================================
// AgentId and Priority
// =============================================================================

/// Unique agent id within one environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AgentId(pub(crate) u64);

impl AgentId {
    /// Sentinel for "no agent" (ids start at 1)
    pub(crate) const NONE: AgentId = AgentId(0);
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "agent:{}", self.0)
    }
}

/// Agent priority, eight discrete levels
///
/// `P0` is the lowest. The canonical dispatchers do not reorder by
/// priority; the attribute is carried for dispatchers that do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    #[default]
    P0,
    P1,
    P2,
    P3,
    P4,
    P5,
    P6,
    P7,
}

// =============================================================================
// Agent trait
// =============================================================================

/// User-implemented agent behavior
///
/// Subscriptions are installed in `define`, which runs on the registering
/// thread before the agent is bound to a dispatcher. `on_start` is the
/// first demand executed on the working thread; `on_finish` is the last.
/// Handlers and hooks report failure by returning `Err`; the runtime
/// consults [`Agent::exception_reaction`] (and then the cooperation's and
/// the environment's) to decide what happens next.
pub trait Agent: Any + Send {
    /// Install subscriptions and states; runs during cooperation
    /// registration
    fn define(&mut self, ctx: &mut AgentContext<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// First demand on the working thread, after binding
    fn on_start(&mut self, ctx: &mut AgentContext<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Last demand before the agent's queue is detached
    fn on_finish(&mut self, ctx: &mut AgentContext<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// This agent's level of the exception-reaction chain
    fn exception_reaction(&self) -> ExceptionReaction {
        ExceptionReaction::Inherit
    }
}

fn downcast_agent<A: Agent>(agent: &mut dyn Agent) -> Result<&mut A> {
    let any: &mut dyn Any = agent;
    any.downcast_mut::<A>()
        .ok_or_else(|| Error::internal("agent type mismatch in event handler"))
}

// =============================================================================
// Agent construction options
// =============================================================================

/// Tuning applied when an agent joins a cooperation
///
/// Message limits are fixed here, before any delivery can race with them.
#[derive(Default)]
pub struct AgentOptions {
    pub(crate) limits: Vec<MessageLimit>,
    pub(crate) priority: Priority,
}

impl AgentOptions {
    /// Empty options: no limits, lowest priority
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message limit
    pub fn limit(mut self, limit: MessageLimit) -> Self {
        self.limits.push(limit);
        self
    }

    /// Set the agent priority
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

// =============================================================================
// AgentHandle
// =============================================================================

/// Runtime lifecycle status of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum AgentStatus {
    Created = 0,
    Defined = 1,
    Bound = 2,
    Running = 3,
    AwaitingDeregistration = 4,
    Finished = 5,
}

impl AgentStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::Defined,
            2 => Self::Bound,
            3 => Self::Running,
            4 => Self::AwaitingDeregistration,
            _ => Self::Finished,
        }
    }
}

pub(crate) struct AgentExec {
    pub user: Box<dyn Agent>,
    pub inner: AgentInner,
}

pub(crate) struct AgentInner {
    pub subscriptions: SubscriptionStorage,
    pub states: Vec<StateMeta>,
    pub current_state: u32,
    pub listeners: Vec<ListenerEntry>,
    pub filters: Vec<(Mbox, MsgType)>,
    pub in_state_listener: bool,
}

impl AgentInner {
    fn new() -> Self {
        Self {
            subscriptions: SubscriptionStorage::new(),
            states: vec![StateMeta {
                name: Some(DEFAULT_STATE_NAME.into()),
            }],
            current_state: DEFAULT_STATE_INDEX,
            listeners: Vec::new(),
            filters: Vec::new(),
            in_state_listener: false,
        }
    }
}

/// Runtime half of one agent
///
/// The user's `Agent` value lives inside, behind the execution lock; the
/// dispatcher guarantees at most one thread holds it at a time. The
/// event-queue slot is guarded by a readers-writer lock: pushes take read,
/// shutdown takes write, and a push after shutdown fails `AgentShutDown`
/// instead of touching a detached queue.
pub struct AgentHandle {
    id: AgentId,
    priority: Priority,
    direct_mbox: Mbox,
    limits: Option<LimitStorage>,
    status: AtomicU8,
    working_thread: AtomicU64,
    queue: RwLock<Option<Arc<dyn EventQueue>>>,
    exec: Mutex<AgentExec>,
    coop: OnceLock<String>,
}

impl AgentHandle {
    pub(crate) fn create(
        id: AgentId,
        mbox_id: MboxId,
        logger: Arc<dyn ErrorLogger>,
        user: Box<dyn Agent>,
        options: AgentOptions,
    ) -> Arc<Self> {
        let limits = if options.limits.is_empty() {
            None
        } else {
            Some(LimitStorage::from_limits(options.limits))
        };
        Arc::new_cyclic(|weak| Self {
            id,
            priority: options.priority,
            direct_mbox: Mbox::direct(mbox_id, weak.clone(), logger),
            limits,
            status: AtomicU8::new(AgentStatus::Created as u8),
            working_thread: AtomicU64::new(THREAD_ID_NONE),
            queue: RwLock::new(None),
            exec: Mutex::new(AgentExec {
                user,
                inner: AgentInner::new(),
            }),
            coop: OnceLock::new(),
        })
    }

    /// The agent id
    pub fn id(&self) -> AgentId {
        self.id
    }

    /// The agent's priority
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// The agent's direct mailbox
    pub fn direct_mbox(&self) -> Mbox {
        self.direct_mbox.clone()
    }

    pub(crate) fn assign_coop(&self, name: &str) {
        let _ = self.coop.set(name.to_string());
    }

    pub(crate) fn coop_name(&self) -> Option<&str> {
        self.coop.get().map(String::as_str)
    }

    pub(crate) fn limit_for(&self, msg_type: MsgType) -> Option<Arc<LimitControlBlock>> {
        self.limits.as_ref()?.lookup(msg_type)
    }

    pub(crate) fn status(&self) -> AgentStatus {
        AgentStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: AgentStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub(crate) fn set_working_thread_current(&self) {
        self.working_thread
            .store(current_thread_id(), Ordering::Release);
    }

    fn on_working_thread(&self) -> bool {
        self.working_thread.load(Ordering::Acquire) == current_thread_id()
    }

    /// Push a demand through the event-queue slot
    ///
    /// Before binding there is no queue yet and the demand is discarded;
    /// after shutdown the push fails so producers can observe the loss.
    pub(crate) fn push_event(&self, demand: Demand) -> Result<()> {
        let queue = read(&self.queue);
        match queue.as_ref() {
            Some(queue) => {
                queue.push(demand);
                Ok(())
            }
            None if self.status() == AgentStatus::Finished => Err(Error::AgentShutDown),
            None => Ok(()),
        }
    }

    /// Attach the event queue and enqueue the synthetic start demand
    pub(crate) fn bind_to_dispatcher(self: &Arc<Self>, queue: Arc<dyn EventQueue>) {
        {
            let mut slot = write(&self.queue);
            *slot = Some(queue);
        }
        self.set_status(AgentStatus::Bound);
        self.working_thread.store(THREAD_ID_NONE, Ordering::Release);
        let _ = self.push_event(Demand::start(self.clone()));
    }

    /// Run `define` on the current (registering) thread
    pub(crate) fn run_define(self: &Arc<Self>, env: &Environment) -> Result<()> {
        self.set_working_thread_current();
        let mut exec = lock(&self.exec);
        let AgentExec { user, inner } = &mut *exec;
        let mut ctx = AgentContext::new(env, self, inner);
        user.define(&mut ctx)?;
        self.set_status(AgentStatus::Defined);
        Ok(())
    }

    /// Undo a partial registration: drop subscriptions and filters
    pub(crate) fn rollback(&self) {
        let mut exec = lock(&self.exec);
        self.teardown(&mut exec.inner);
    }

    /// Remove every trace of this agent from the mailboxes and detach the
    /// event queue; runs under the execution lock
    fn teardown(&self, inner: &mut AgentInner) {
        for (mbox, msg_type) in inner.subscriptions.drain() {
            mbox.unsubscribe_agent(self.id, msg_type);
        }
        for (mbox, msg_type) in inner.filters.drain(..) {
            mbox.drop_filter(self.id, msg_type);
        }
        {
            let mut slot = write(&self.queue);
            *slot = None;
        }
        self.set_status(AgentStatus::Finished);
    }
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("coop", &self.coop.get())
            .finish()
    }
}

// =============================================================================
// Demand execution
// =============================================================================

/// Execute one demand; called by dispatcher workers
pub(crate) fn execute_demand(env: &Environment, demand: Demand) {
    if let Some(limit) = &demand.limit {
        limit.release();
    }
    let target = demand.target.clone();
    match demand.kind {
        DemandKind::Start => execute_start(env, &target),
        DemandKind::Finish => execute_finish(env, &target),
        DemandKind::Message | DemandKind::ServiceRequest => execute_message(env, &target, &demand),
    }
}

fn execute_start(env: &Environment, target: &Arc<AgentHandle>) {
    if target.status() == AgentStatus::Finished {
        return;
    }
    target.set_working_thread_current();
    if target.status() == AgentStatus::Bound {
        target.set_status(AgentStatus::Running);
    }
    let mut exec = lock(&target.exec);
    let AgentExec { user, inner } = &mut *exec;
    let mut ctx = AgentContext::new(env, target, inner);
    if let Err(err) = user.on_start(&mut ctx) {
        let reaction = resolve_reaction(env, target, user.as_ref());
        drop(exec);
        apply_reaction(env, target, reaction, err);
    }
}

fn execute_finish(env: &Environment, target: &Arc<AgentHandle>) {
    if target.status() == AgentStatus::Finished {
        return;
    }
    target.set_working_thread_current();
    {
        let mut exec = lock(&target.exec);
        let AgentExec { user, inner } = &mut *exec;
        let mut ctx = AgentContext::new(env, target, inner);
        if let Err(err) = user.on_finish(&mut ctx) {
            let reaction = resolve_reaction(env, target, user.as_ref());
            apply_reaction(env, target, reaction, err);
        }
        target.teardown(inner);
    }
    if let Some(name) = target.coop_name() {
        env.agent_finished(name);
    }
}

fn execute_message(env: &Environment, target: &Arc<AgentHandle>, demand: &Demand) {
    if target.status() == AgentStatus::Finished {
        if let Some(request) = &demand.request {
            request.reject(Error::AgentShutDown);
        }
        return;
    }
    target.set_working_thread_current();
    let mut exec = lock(&target.exec);
    let AgentExec { user, inner } = &mut *exec;

    let Some(entry) = inner
        .subscriptions
        .find(demand.mbox_id, demand.msg_type, inner.current_state)
    else {
        match &demand.request {
            Some(request) => request.reject(Error::NoHandler {
                msg_type: demand.msg_type.name(),
            }),
            None => debug!(
                agent = %target.id(),
                msg_type = %demand.msg_type,
                "no handler in current or default state, message dropped"
            ),
        }
        return;
    };

    let mut ctx = AgentContext::new(env, target, inner);
    if let Err(err) = (entry.handler)(user.as_mut(), &mut ctx, demand) {
        if demand.kind == DemandKind::ServiceRequest {
            // Request handler outcomes travel through the reply slot, not
            // the reaction chain; an Err here is a dispatch-layer failure.
            if let Some(request) = &demand.request {
                request.reject(Error::handler_failed(err.to_string()));
            }
        } else {
            let reaction = resolve_reaction(env, target, user.as_ref());
            drop(exec);
            apply_reaction(env, target, reaction, err);
        }
    }
}

fn resolve_reaction(
    env: &Environment,
    target: &Arc<AgentHandle>,
    user: &dyn Agent,
) -> ExceptionReaction {
    let mut reaction = user.exception_reaction();
    if reaction == ExceptionReaction::Inherit {
        reaction = match target.coop_name() {
            Some(name) => env.coop_exception_reaction(name),
            None => ExceptionReaction::Inherit,
        };
    }
    if reaction == ExceptionReaction::Inherit {
        reaction = env.exception_reaction();
    }
    if reaction == ExceptionReaction::Inherit {
        reaction = ExceptionReaction::Abort;
    }
    reaction
}

fn apply_reaction(
    env: &Environment,
    target: &Arc<AgentHandle>,
    reaction: ExceptionReaction,
    err: Error,
) {
    match reaction {
        ExceptionReaction::Abort | ExceptionReaction::Inherit => {
            log_error!(
                env.error_logger(),
                "unhandled error from {}: {}; aborting",
                target.id(),
                err
            );
            std::process::abort();
        }
        ExceptionReaction::ShutdownEnvironment => {
            warn!(agent = %target.id(), error = %err, "handler failed, stopping environment");
            target.set_status(AgentStatus::AwaitingDeregistration);
            env.stop();
        }
        ExceptionReaction::DeregisterCoop => {
            warn!(agent = %target.id(), error = %err, "handler failed, deregistering cooperation");
            target.set_status(AgentStatus::AwaitingDeregistration);
            if let Some(name) = target.coop_name() {
                let name = name.to_string();
                if let Err(dereg_err) = env.deregister_coop(&name, DeregReason::Exception) {
                    debug!(coop = %name, error = %dereg_err, "deregistration already underway");
                }
            }
        }
        ExceptionReaction::Ignore => {
            warn!(agent = %target.id(), error = %err, "handler failed, error ignored");
        }
    }
}

// =============================================================================
// AgentContext
// =============================================================================

/// The runtime surface available to agent code
///
/// Constructed for the duration of one `define`/`on_start`/`on_finish`
/// call or one handler invocation, always on the agent's working thread.
pub struct AgentContext<'e> {
    env: &'e Environment,
    handle: &'e Arc<AgentHandle>,
    inner: &'e mut AgentInner,
}

impl<'e> AgentContext<'e> {
    pub(crate) fn new(
        env: &'e Environment,
        handle: &'e Arc<AgentHandle>,
        inner: &'e mut AgentInner,
    ) -> Self {
        Self { env, handle, inner }
    }

    /// The owning environment
    pub fn env(&self) -> &Environment {
        self.env
    }

    /// This agent's id
    pub fn agent_id(&self) -> AgentId {
        self.handle.id()
    }

    /// This agent's priority
    pub fn priority(&self) -> Priority {
        self.handle.priority()
    }

    /// This agent's direct mailbox
    pub fn direct_mbox(&self) -> Mbox {
        self.handle.direct_mbox()
    }

    /// Name of the cooperation this agent belongs to
    pub fn coop_name(&self) -> Result<&str> {
        self.handle
            .coop_name()
            .ok_or_else(|| Error::internal("agent is not bound to a cooperation"))
    }

    /// Deregister this agent's own cooperation
    pub fn deregister_own_coop(&self, reason: DeregReason) -> Result<()> {
        let name = self.coop_name()?.to_string();
        self.env.deregister_coop(&name, reason)
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Begin a subscription on `mbox`
    pub fn subscribe<'c>(&'c mut self, mbox: &Mbox) -> SubscribeTo<'c, 'e> {
        SubscribeTo {
            mbox: mbox.clone(),
            ctx: self,
            states: Vec::new(),
            thread_safety: ThreadSafety::NotSafe,
            deferred_error: None,
        }
    }

    /// Drop the subscription for (mailbox, `M`, state); silent if absent
    pub fn unsubscribe<M: Message>(&mut self, mbox: &Mbox, state: &State) -> Result<()> {
        self.ensure_working_thread("unsubscribe")?;
        self.check_state_owned(state)?;
        if let Some(mbox) =
            self.inner
                .subscriptions
                .remove(mbox.id(), MsgType::of::<M>(), state.index())
        {
            mbox.unsubscribe_agent(self.handle.id(), MsgType::of::<M>());
        }
        Ok(())
    }

    /// Drop the subscription for (mailbox, `M`) in the default state
    pub fn unsubscribe_default<M: Message>(&mut self, mbox: &Mbox) -> Result<()> {
        let state = self.default_state();
        self.unsubscribe::<M>(mbox, &state)
    }

    /// Drop the subscriptions for (mailbox, `M`) in every state
    pub fn unsubscribe_all_states<M: Message>(&mut self, mbox: &Mbox) -> Result<()> {
        self.ensure_working_thread("unsubscribe_all_states")?;
        if let Some(mbox) = self
            .inner
            .subscriptions
            .remove_all_states(mbox.id(), MsgType::of::<M>())
        {
            mbox.unsubscribe_agent(self.handle.id(), MsgType::of::<M>());
        }
        Ok(())
    }

    // =========================================================================
    // States
    // =========================================================================

    /// Create a named state owned by this agent
    pub fn make_state(&mut self, name: impl Into<String>) -> Result<State> {
        self.ensure_working_thread("make_state")?;
        let name: Arc<str> = name.into().into();
        self.inner.states.push(StateMeta {
            name: Some(name.clone()),
        });
        let index = (self.inner.states.len() - 1) as u32;
        Ok(State::new(self.handle.id(), index, Some(name)))
    }

    /// Create an anonymous state owned by this agent
    pub fn make_unnamed_state(&mut self) -> Result<State> {
        self.ensure_working_thread("make_unnamed_state")?;
        self.inner.states.push(StateMeta { name: None });
        let index = (self.inner.states.len() - 1) as u32;
        Ok(State::new(self.handle.id(), index, None))
    }

    /// The agent's default state
    pub fn default_state(&self) -> State {
        self.state_at(DEFAULT_STATE_INDEX)
    }

    /// The agent's current state
    pub fn current_state(&self) -> State {
        self.state_at(self.inner.current_state)
    }

    fn state_at(&self, index: u32) -> State {
        let name = self
            .inner
            .states
            .get(index as usize)
            .and_then(|meta| meta.name.clone());
        State::new(self.handle.id(), index, name)
    }

    fn check_state_owned(&self, state: &State) -> Result<()> {
        if state.owner() != self.handle.id() || (state.index() as usize) >= self.inner.states.len()
        {
            return Err(Error::StateNotOwned {
                state: state.name(),
            });
        }
        Ok(())
    }

    /// Switch the agent to another of its own states
    ///
    /// Listeners observe the change synchronously; switching to the
    /// current state is a no-op.
    pub fn change_state(&mut self, target: &State) -> Result<()> {
        self.ensure_working_thread("change_state")?;
        if self.inner.in_state_listener {
            return Err(Error::ReentrantStateChange);
        }
        self.check_state_owned(target)?;
        if self.inner.current_state == target.index() {
            return Ok(());
        }

        let old = self.state_at(self.inner.current_state);
        self.inner.current_state = target.index();
        let new = self.state_at(target.index());
        debug!(agent = %self.handle.id(), from = %old, to = %new, "state changed");

        let mut listeners = std::mem::take(&mut self.inner.listeners);
        self.inner.in_state_listener = true;
        for listener in &mut listeners {
            listener.call(self, &old, &new);
        }
        self.inner.in_state_listener = false;
        // Listeners may have installed more listeners meanwhile.
        let added = std::mem::replace(&mut self.inner.listeners, listeners);
        self.inner.listeners.extend(added);
        Ok(())
    }

    /// Install a state listener owned by the agent
    pub fn add_state_listener<F>(&mut self, listener: F)
    where
        F: FnMut(&mut AgentContext<'_>, &State, &State) + Send + 'static,
    {
        self.inner
            .listeners
            .push(ListenerEntry::Owned(Box::new(listener)));
    }

    /// Install a state listener shared with the caller
    pub fn add_shared_state_listener(
        &mut self,
        listener: Arc<dyn Fn(&mut AgentContext<'_>, &State, &State) + Send + Sync>,
    ) {
        self.inner.listeners.push(ListenerEntry::Shared(listener));
    }

    // =========================================================================
    // Delivery filters
    // =========================================================================

    /// Install a delivery filter for `M` on an MPMC mailbox
    ///
    /// The predicate runs on producer threads; a panic inside it aborts
    /// the process.
    pub fn set_delivery_filter<M, F>(&mut self, mbox: &Mbox, filter: F) -> Result<()>
    where
        M: Message,
        F: Fn(&M) -> bool + Send + Sync + 'static,
    {
        self.ensure_working_thread("set_delivery_filter")?;
        let wrapped: crate::mailbox::DeliveryFilterFn = Arc::new(move |payload: &MessageRef| {
            payload.downcast_ref::<M>().map(&filter).unwrap_or(false)
        });
        mbox.set_filter(self.handle, MsgType::of::<M>(), wrapped)?;
        let record = (mbox.clone(), MsgType::of::<M>());
        if !self
            .inner
            .filters
            .iter()
            .any(|(m, t)| m.id() == record.0.id() && *t == record.1)
        {
            self.inner.filters.push(record);
        }
        Ok(())
    }

    /// Remove the delivery filter for `M`; silent if absent
    pub fn drop_delivery_filter<M: Message>(&mut self, mbox: &Mbox) -> Result<()> {
        self.ensure_working_thread("drop_delivery_filter")?;
        mbox.drop_filter(self.handle.id(), MsgType::of::<M>());
        self.inner
            .filters
            .retain(|(m, t)| !(m.id() == mbox.id() && *t == MsgType::of::<M>()));
        Ok(())
    }

    fn ensure_working_thread(&self, operation: &'static str) -> Result<()> {
        if self.handle.on_working_thread() {
            Ok(())
        } else {
            Err(Error::NotOnWorkingThread { operation })
        }
    }
}

// =============================================================================
// Subscription builder
// =============================================================================

fn make_handler<F>(f: F) -> Arc<HandlerFn>
where
    F: Fn(&mut dyn Agent, &mut AgentContext<'_>, &Demand) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Fluent subscription builder returned by [`AgentContext::subscribe`]
///
/// `in_state` may be chained for several states; with none, the
/// subscription lands in the default state. The terminal methods install
/// the handler.
pub struct SubscribeTo<'c, 'e> {
    ctx: &'c mut AgentContext<'e>,
    mbox: Mbox,
    states: Vec<u32>,
    thread_safety: ThreadSafety,
    deferred_error: Option<Error>,
}

impl<'c, 'e> SubscribeTo<'c, 'e> {
    /// Restrict the subscription to `state`
    pub fn in_state(mut self, state: &State) -> Self {
        if self.deferred_error.is_none() {
            match self.ctx.check_state_owned(state) {
                Ok(()) => self.states.push(state.index()),
                Err(err) => self.deferred_error = Some(err),
            }
        }
        self
    }

    /// Mark the handler as safe for concurrent execution (reserved)
    pub fn thread_safe(mut self) -> Self {
        self.thread_safety = ThreadSafety::Safe;
        self
    }

    /// Subscribe a message handler
    ///
    /// The handler also serves service requests whose result type is `()`.
    pub fn message<A, M, F>(self, handler: F) -> Result<()>
    where
        A: Agent,
        M: Message,
        F: Fn(&mut A, &mut AgentContext<'_>, &M) -> Result<()> + Send + Sync + 'static,
    {
        let wrapped = make_handler(
            move |agent: &mut dyn Agent, ctx: &mut AgentContext<'_>, demand: &Demand| {
            let this = downcast_agent::<A>(agent)?;
            match demand.kind {
                DemandKind::ServiceRequest => {
                    let request = demand
                        .request
                        .as_ref()
                        .ok_or_else(|| Error::internal("service request demand without envelope"))?;
                    match request.as_any().downcast_ref::<RequestEnvelope<M, ()>>() {
                        Some(envelope) => {
                            let outcome = handler(this, ctx, envelope.param());
                            resolve_request(envelope, outcome);
                            Ok(())
                        }
                        None => {
                            request.reject(Error::handler_failed(
                                "handler does not produce the requested result type",
                            ));
                            Ok(())
                        }
                    }
                }
                _ => {
                    let payload = demand
                        .payload
                        .as_ref()
                        .ok_or_else(|| Error::internal("message demand without payload"))?;
                    let msg = payload
                        .downcast_ref::<M>()
                        .ok_or_else(|| Error::internal("payload type mismatch in handler"))?;
                    handler(this, ctx, msg)
                }
            }
        });
        self.install(MsgType::of::<M>(), wrapped)
    }

    /// Subscribe a signal handler
    pub fn signal<S, A, F>(self, handler: F) -> Result<()>
    where
        S: Signal,
        A: Agent,
        F: Fn(&mut A, &mut AgentContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        let wrapped = make_handler(
            move |agent: &mut dyn Agent, ctx: &mut AgentContext<'_>, demand: &Demand| {
            let this = downcast_agent::<A>(agent)?;
            match demand.kind {
                DemandKind::ServiceRequest => {
                    if let Some(request) = &demand.request {
                        request
                            .reject(Error::handler_failed("signal handlers cannot serve requests"));
                    }
                    Ok(())
                }
                _ => handler(this, ctx),
            }
        });
        self.install(MsgType::of::<S>(), wrapped)
    }

    /// Subscribe a service-request handler returning `R`
    ///
    /// Plain deliveries of `M` run the handler and discard the result.
    pub fn request<A, M, R, F>(self, handler: F) -> Result<()>
    where
        A: Agent,
        M: Message,
        R: Message,
        F: Fn(&mut A, &mut AgentContext<'_>, &M) -> Result<R> + Send + Sync + 'static,
    {
        let wrapped = make_handler(
            move |agent: &mut dyn Agent, ctx: &mut AgentContext<'_>, demand: &Demand| {
            let this = downcast_agent::<A>(agent)?;
            match demand.kind {
                DemandKind::ServiceRequest => {
                    let request = demand
                        .request
                        .as_ref()
                        .ok_or_else(|| Error::internal("service request demand without envelope"))?;
                    match request.as_any().downcast_ref::<RequestEnvelope<M, R>>() {
                        Some(envelope) => {
                            let outcome = handler(this, ctx, envelope.param());
                            resolve_request(envelope, outcome);
                            Ok(())
                        }
                        None => {
                            request.reject(Error::handler_failed(
                                "handler does not produce the requested result type",
                            ));
                            Ok(())
                        }
                    }
                }
                _ => {
                    let payload = demand
                        .payload
                        .as_ref()
                        .ok_or_else(|| Error::internal("message demand without payload"))?;
                    let msg = payload
                        .downcast_ref::<M>()
                        .ok_or_else(|| Error::internal("payload type mismatch in handler"))?;
                    handler(this, ctx, msg).map(|_| ())
                }
            }
        });
        self.install(MsgType::of::<M>(), wrapped)
    }

    fn install(self, msg_type: MsgType, handler: Arc<HandlerFn>) -> Result<()> {
        if let Some(err) = self.deferred_error {
            return Err(err);
        }
        self.ctx.ensure_working_thread("subscribe")?;

        let states = if self.states.is_empty() {
            vec![DEFAULT_STATE_INDEX]
        } else {
            self.states
        };

        // Direct mailboxes keep exactly one handler per (type, state)
        // across their lifetime; re-subscription does not replace.
        if self.mbox.is_direct() {
            for state_index in &states {
                if self
                    .ctx
                    .inner
                    .subscriptions
                    .contains_state(self.mbox.id(), msg_type, *state_index)
                {
                    return Err(Error::DuplicateHandler {
                        msg_type: msg_type.name(),
                    });
                }
            }
        }

        let entry = HandlerEntry {
            handler,
            thread_safety: self.thread_safety,
        };
        for state_index in states {
            let outcome =
                self.ctx
                    .inner
                    .subscriptions
                    .insert(&self.mbox, msg_type, state_index, entry.clone());
            if outcome == InsertOutcome::NewEntry {
                if let Err(err) = self.mbox.subscribe_agent(self.ctx.handle, msg_type) {
                    self.ctx
                        .inner
                        .subscriptions
                        .remove(self.mbox.id(), msg_type, state_index);
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            AgentStatus::Created,
            AgentStatus::Defined,
            AgentStatus::Bound,
            AgentStatus::Running,
            AgentStatus::AwaitingDeregistration,
            AgentStatus::Finished,
        ] {
            assert_eq!(AgentStatus::from_u8(status as u8), status);
        }
    }

    #[test]
    fn test_priority_levels() {
        assert_eq!(Priority::default(), Priority::P0);
        assert!(Priority::P0 < Priority::P7);
    }

    #[test]
    fn test_agent_options_builder() {
        let options = AgentOptions::new()
            .limit(MessageLimit::drop_after::<String>(3))
            .priority(Priority::P5);
        assert_eq!(options.limits.len(), 1);
        assert_eq!(options.priority, Priority::P5);
    }
}
