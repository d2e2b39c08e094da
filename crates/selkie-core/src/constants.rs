//! TigerStyle constants for Selkie
//!
//! All limits are explicit, use big-endian naming (most significant first),
//! and include units in the name.

// =============================================================================
// Dispatcher Limits
// =============================================================================

/// Default number of worker threads in the thread-pool dispatcher
pub const WORKER_THREADS_COUNT_DEFAULT: usize = 4;

/// Maximum number of worker threads in one dispatcher
pub const WORKER_THREADS_COUNT_MAX: usize = 1024;

/// Default number of demands a worker executes for one agent before yielding
pub const DEMAND_BATCH_COUNT_DEFAULT: usize = 4;

/// Maximum demand batch size
pub const DEMAND_BATCH_COUNT_MAX: usize = 1024;

// =============================================================================
// Naming Limits
// =============================================================================

/// Maximum length of a cooperation name in bytes
pub const COOP_NAME_LENGTH_BYTES_MAX: usize = 256;

/// Maximum length of a mailbox name in bytes
pub const MBOX_NAME_LENGTH_BYTES_MAX: usize = 256;

// =============================================================================
// Delivery Limits
// =============================================================================

/// Maximum depth of overlimit redirect/transform chains
///
/// A redirect reaction whose target also redirects can loop. Chains deeper
/// than this are logged and dropped.
pub const OVERLIMIT_REDIRECTION_DEPTH_MAX: usize = 32;

/// Number of discrete agent priority levels
pub const AGENT_PRIORITY_LEVELS_COUNT: usize = 8;

// Compile-time assertions for constant validity
const _: () = {
    assert!(WORKER_THREADS_COUNT_DEFAULT >= 1);
    assert!(WORKER_THREADS_COUNT_DEFAULT <= WORKER_THREADS_COUNT_MAX);
    assert!(DEMAND_BATCH_COUNT_DEFAULT >= 1);
    assert!(DEMAND_BATCH_COUNT_DEFAULT <= DEMAND_BATCH_COUNT_MAX);
    assert!(OVERLIMIT_REDIRECTION_DEPTH_MAX >= 1);
    assert!(AGENT_PRIORITY_LEVELS_COUNT == 8);
};
