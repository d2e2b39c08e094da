//! Dispatchers and worker threads
//!
//! A dispatcher owns OS threads and drives event queues. Two canonical
//! flavors:
//!
//! - [`OneThreadDispatcher`]: one worker, one shared demand queue; all
//!   bound agents execute strictly FIFO on the same thread.
//! - [`ThreadPoolDispatcher`]: N workers and one per-agent channel each;
//!   a shared ready-queue hands whole agents to workers, so at any time at
//!   most one worker executes demands for a given agent, in push order.
//!
//! Shutdown is cooperative: `stop` flips the service flag, wakes waiters,
//! and joins. The environment stops dispatchers only after the registry
//! has drained, so every finish demand has executed by then.

use crate::agent::{execute_demand, AgentHandle};
use crate::demand::{Demand, EventQueue};
use crate::environment::Environment;
use crate::sync::lock;
use selkie_core::{Error, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::thread::JoinHandle;
use tracing::debug;

/// Chooses and wires an event queue for each agent of a cooperation
///
/// Supplied per agent (or per cooperation) at build time; the environment's
/// default binder targets the default thread-pool dispatcher.
pub trait DispatcherBinder: Send + Sync {
    /// Produce the event queue the agent will be bound to
    fn bind(&self, agent: &Arc<AgentHandle>) -> Result<Arc<dyn EventQueue>>;

    /// Release whatever `bind` allocated; called after the agent finished
    fn unbind(&self, agent: &Arc<AgentHandle>);
}

/// Stop handle the environment keeps for every dispatcher it must tear down
pub(crate) trait DispatcherControl: Send + Sync {
    fn stop_and_join(&self);
}

// =============================================================================
// Demand queue (shared, blocking)
// =============================================================================

pub(crate) enum PopOutcome {
    /// At least one demand was extracted
    Extracted,
    /// The queue is out of service
    ShuttingDown,
}

struct DemandQueueInner {
    demands: VecDeque<Demand>,
    in_service: bool,
}

/// Blocking MPSC demand queue with a shutdown flag
///
/// Many producers push; one worker pops batches, sleeping on the condition
/// variable while the queue is empty. Pushes outside the service window are
/// dropped.
pub(crate) struct DemandQueue {
    inner: Mutex<DemandQueueInner>,
    not_empty: Condvar,
}

impl DemandQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(DemandQueueInner {
                demands: VecDeque::new(),
                in_service: false,
            }),
            not_empty: Condvar::new(),
        }
    }

    pub(crate) fn start_service(&self) {
        lock(&self.inner).in_service = true;
    }

    pub(crate) fn stop_service(&self) {
        lock(&self.inner).in_service = false;
        self.not_empty.notify_all();
    }

    /// Extract up to `max` demands, blocking while the queue is empty
    pub(crate) fn pop_batch(&self, out: &mut Vec<Demand>, max: usize) -> PopOutcome {
        debug_assert!(max >= 1, "batch must be at least one");
        let mut inner = lock(&self.inner);
        loop {
            if !inner.in_service {
                return PopOutcome::ShuttingDown;
            }
            if !inner.demands.is_empty() {
                for _ in 0..max {
                    match inner.demands.pop_front() {
                        Some(demand) => out.push(demand),
                        None => break,
                    }
                }
                return PopOutcome::Extracted;
            }
            inner = self
                .not_empty
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl EventQueue for DemandQueue {
    fn push(&self, demand: Demand) {
        let mut inner = lock(&self.inner);
        if inner.in_service {
            inner.demands.push_back(demand);
            self.not_empty.notify_one();
        }
    }
}

// =============================================================================
// One-thread dispatcher
// =============================================================================

/// One worker thread consuming one shared queue
///
/// All agents bound here execute strictly FIFO across agents, which also
/// makes their relative ordering deterministic.
pub struct OneThreadDispatcher {
    queue: Arc<DemandQueue>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl OneThreadDispatcher {
    /// Spawn a private one-thread dispatcher in `env`
    ///
    /// The environment stops it during shutdown.
    pub fn spawn(env: &Environment) -> Result<Arc<Self>> {
        let queue = Arc::new(DemandQueue::new());
        queue.start_service();

        let worker_env = env.clone();
        let worker_queue = queue.clone();
        let batch = env.config().dispatcher.demand_batch_count;
        let handle = std::thread::Builder::new()
            .name("selkie-one-thread".to_string())
            .spawn(move || work_thread_body(worker_env, worker_queue, batch))
            .map_err(|e| Error::internal(format!("failed to spawn worker thread: {}", e)))?;

        let dispatcher = Arc::new(Self {
            queue,
            worker: Mutex::new(Some(handle)),
        });
        env.track_dispatcher(dispatcher.clone());
        Ok(dispatcher)
    }

    /// Binder placing agents on this dispatcher
    pub fn binder(self: &Arc<Self>) -> Arc<dyn DispatcherBinder> {
        Arc::new(OneThreadBinder {
            queue: self.queue.clone(),
        })
    }
}

impl DispatcherControl for OneThreadDispatcher {
    fn stop_and_join(&self) {
        self.queue.stop_service();
        if let Some(handle) = lock(&self.worker).take() {
            let _ = handle.join();
        }
    }
}

struct OneThreadBinder {
    queue: Arc<DemandQueue>,
}

impl DispatcherBinder for OneThreadBinder {
    fn bind(&self, _agent: &Arc<AgentHandle>) -> Result<Arc<dyn EventQueue>> {
        Ok(self.queue.clone())
    }

    fn unbind(&self, _agent: &Arc<AgentHandle>) {}
}

/// Worker body shared by the one-thread dispatcher
fn work_thread_body(env: Environment, queue: Arc<DemandQueue>, batch: usize) {
    let mut demands = Vec::with_capacity(batch);
    loop {
        demands.clear();
        match queue.pop_batch(&mut demands, batch) {
            PopOutcome::Extracted => {
                for demand in demands.drain(..) {
                    execute_demand(&env, demand);
                }
            }
            PopOutcome::ShuttingDown => break,
        }
    }
    debug!("worker thread stopped");
}

// =============================================================================
// Thread-pool dispatcher
// =============================================================================

struct ReadyState {
    queue: VecDeque<Arc<AgentChannel>>,
    in_service: bool,
}

/// Shared half of the pool: the ready-queue of agents with pending demands
struct PoolShared {
    ready: Mutex<ReadyState>,
    not_empty: Condvar,
}

impl PoolShared {
    fn enqueue(&self, channel: Arc<AgentChannel>) {
        let mut ready = lock(&self.ready);
        if ready.in_service {
            ready.queue.push_back(channel);
            self.not_empty.notify_one();
        }
    }

    fn dequeue(&self) -> Option<Arc<AgentChannel>> {
        let mut ready = lock(&self.ready);
        loop {
            if !ready.in_service {
                return None;
            }
            if let Some(channel) = ready.queue.pop_front() {
                return Some(channel);
            }
            ready = self
                .not_empty
                .wait(ready)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn stop(&self) {
        lock(&self.ready).in_service = false;
        self.not_empty.notify_all();
    }
}

struct ChannelState {
    demands: VecDeque<Demand>,
    /// True while the channel is in the ready-queue or owned by a worker;
    /// guarantees at most one worker executes this agent at a time
    scheduled: bool,
}

/// Per-agent FIFO channel feeding the pool's ready-queue
pub(crate) struct AgentChannel {
    pool: Weak<PoolShared>,
    self_ref: Weak<AgentChannel>,
    state: Mutex<ChannelState>,
}

impl AgentChannel {
    fn new(pool: &Arc<PoolShared>) -> Arc<Self> {
        let pool = Arc::downgrade(pool);
        Arc::new_cyclic(|self_ref| Self {
            pool,
            self_ref: self_ref.clone(),
            state: Mutex::new(ChannelState {
                demands: VecDeque::new(),
                scheduled: false,
            }),
        })
    }

    /// Take up to `max` demands for execution
    fn take_batch(&self, out: &mut Vec<Demand>, max: usize) {
        let mut state = lock(&self.state);
        for _ in 0..max {
            match state.demands.pop_front() {
                Some(demand) => out.push(demand),
                None => break,
            }
        }
    }

    /// Re-queue if more demands arrived during the batch, else park
    fn finish_batch(&self) {
        let requeue = {
            let mut state = lock(&self.state);
            if state.demands.is_empty() {
                state.scheduled = false;
                false
            } else {
                true
            }
        };
        if requeue {
            if let (Some(pool), Some(me)) = (self.pool.upgrade(), self.self_ref.upgrade()) {
                pool.enqueue(me);
            }
        }
    }
}

impl EventQueue for AgentChannel {
    fn push(&self, demand: Demand) {
        let newly_scheduled = {
            let mut state = lock(&self.state);
            state.demands.push_back(demand);
            if state.scheduled {
                false
            } else {
                state.scheduled = true;
                true
            }
        };
        if newly_scheduled {
            if let (Some(pool), Some(me)) = (self.pool.upgrade(), self.self_ref.upgrade()) {
                pool.enqueue(me);
            }
        }
    }
}

/// The environment's default dispatcher: N workers over per-agent channels
pub struct ThreadPoolDispatcher {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPoolDispatcher {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(PoolShared {
                ready: Mutex::new(ReadyState {
                    queue: VecDeque::new(),
                    in_service: false,
                }),
                not_empty: Condvar::new(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Start the worker threads
    pub(crate) fn start(&self, env: &Environment, threads: usize, batch: usize) -> Result<()> {
        debug_assert!(threads >= 1, "pool needs at least one worker");
        lock(&self.shared.ready).in_service = true;

        let mut workers = lock(&self.workers);
        for index in 0..threads {
            let worker_env = env.clone();
            let shared = self.shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("selkie-pool-{}", index))
                .spawn(move || pool_worker_body(worker_env, shared, batch))
                .map_err(|e| Error::internal(format!("failed to spawn worker thread: {}", e)))?;
            workers.push(handle);
        }
        Ok(())
    }

    /// Stop the workers and join them
    pub(crate) fn stop(&self) {
        self.shared.stop();
        for handle in lock(&self.workers).drain(..) {
            let _ = handle.join();
        }
    }

    /// Binder placing agents on this pool
    pub(crate) fn binder(&self) -> Arc<dyn DispatcherBinder> {
        Arc::new(ThreadPoolBinder {
            pool: self.shared.clone(),
        })
    }
}

struct ThreadPoolBinder {
    pool: Arc<PoolShared>,
}

impl DispatcherBinder for ThreadPoolBinder {
    fn bind(&self, _agent: &Arc<AgentHandle>) -> Result<Arc<dyn EventQueue>> {
        Ok(AgentChannel::new(&self.pool))
    }

    fn unbind(&self, _agent: &Arc<AgentHandle>) {}
}

fn pool_worker_body(env: Environment, shared: Arc<PoolShared>, batch: usize) {
    let mut demands = Vec::with_capacity(batch);
    while let Some(channel) = shared.dequeue() {
        demands.clear();
        channel.take_batch(&mut demands, batch);
        for demand in demands.drain(..) {
            execute_demand(&env, demand);
        }
        channel.finish_batch();
    }
    debug!("pool worker stopped");
}
