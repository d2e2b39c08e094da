//! Selkie Core
//!
//! Core types, errors, and constants for the Selkie actor runtime.
//!
//! # Overview
//!
//! Selkie is an in-process actor runtime: application code is written as
//! agents that own private state, subscribe to typed messages on mailboxes,
//! and are grouped into cooperations for atomic registration and teardown.
//! This crate holds everything without execution machinery: the message
//! model, the error taxonomy, runtime policies, configuration, tuning
//! constants, the one-shot reply slot, and the logging sinks. The engine
//! itself lives in `selkie-runtime`.
//!
//! # TigerStyle
//!
//! This crate follows [TigerStyle](https://github.com/tigerbeetle/tigerbeetle/blob/main/docs/TIGER_STYLE.md)
//! engineering principles:
//! - Safety > Performance > Developer Experience
//! - Explicit limits with big-endian naming (e.g., `DEMAND_BATCH_COUNT_MAX`)
//! - No recursion (bounded iteration only)

pub mod config;
pub mod constants;
pub mod error;
pub mod logger;
pub mod message;
pub mod policy;
pub mod reply;
pub mod telemetry;
pub mod thread_id;

pub use config::{DispatcherConfig, EnvConfig};
pub use constants::*;
pub use error::{Error, Result};
pub use logger::{stderr_logger, ErrorLogger, StderrLogger};
pub use message::{
    resolve_request, AnyRequest, Message, MessageRef, MsgType, RequestEnvelope, Signal,
};
pub use policy::{DeregReason, ExceptionReaction};
pub use reply::{reply_channel, ReplyFuture, ReplySender};
pub use telemetry::{init_telemetry, TelemetryConfig};
pub use thread_id::{current_thread_id, THREAD_ID_NONE};
