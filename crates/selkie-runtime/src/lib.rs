//! Selkie Runtime
//!
//! The engine of the Selkie actor runtime: agents, mailboxes,
//! cooperations, event queues, and dispatchers.
//!
//! # Overview
//!
//! Application code is written as [`Agent`]s: values that own private
//! state, subscribe to typed messages on [`Mbox`]es, and react by running
//! handlers. Agents are grouped into [`Cooperation`]s, the atomic unit of
//! registration and teardown, and assigned to dispatchers that own worker
//! threads and drive per-agent demand queues.
//!
//! Demands for one agent execute in FIFO order, one thread at a time;
//! handler lookup is state-machine-aware with a default-state fallback;
//! failures route through a uniform exception-reaction policy
//! (agent -> cooperation -> environment).
//!
//! ```no_run
//! use selkie_runtime::{run, Agent, AgentContext};
//! use selkie_core::{Result, Signal};
//!
//! struct Done;
//! impl Signal for Done {}
//!
//! #[derive(Default)]
//! struct Greeter;
//!
//! impl Agent for Greeter {
//!     fn define(&mut self, ctx: &mut AgentContext<'_>) -> Result<()> {
//!         let mbox = ctx.direct_mbox();
//!         ctx.subscribe(&mbox).signal::<Done, _, _>(
//!             |_agent: &mut Self, ctx: &mut AgentContext<'_>| {
//!                 ctx.env().stop();
//!                 Ok(())
//!             },
//!         )
//!     }
//!
//!     fn on_start(&mut self, ctx: &mut AgentContext<'_>) -> Result<()> {
//!         ctx.direct_mbox().deliver_signal::<Done>()
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     run(|env| {
//!         env.register_agent_as_coop("greeter", Greeter)?;
//!         Ok(())
//!     })
//! }
//! ```

pub mod agent;
pub mod coop;
pub mod demand;
pub mod dispatcher;
pub mod environment;
pub mod limits;
pub mod mailbox;
pub mod state;

mod registry;
mod subscription;
mod sync;

pub use agent::{Agent, AgentContext, AgentHandle, AgentId, AgentOptions, Priority, SubscribeTo};
pub use coop::{
    dereg_notifier_to, reg_notifier_to, CoopDeregistered, CoopRegistered, Cooperation,
    DeregNotifier, RegNotifier,
};
pub use demand::{Demand, EventQueue};
pub use dispatcher::{DispatcherBinder, OneThreadDispatcher};
pub use environment::{run, run_with_config, Environment};
pub use limits::{MessageLimit, TransformedMessage};
pub use mailbox::{Mbox, MboxId};
pub use state::State;
pub use subscription::ThreadSafety;

// Re-export the core vocabulary so embedders need only this crate.
pub use selkie_core::{
    DeregReason, EnvConfig, Error, ExceptionReaction, Message, MsgType, ReplyFuture, Result,
    Signal,
};
