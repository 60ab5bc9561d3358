//! Logging utilities for claude-relay
//!
//! Re-exports tracing macros under log_* names so call sites read uniformly.

// Allow unused - these are available for internal use as needed
#[allow(unused_imports)]
pub use tracing::{
    debug as log_debug, error as log_error, info as log_info, trace as log_trace, warn as log_warn,
};
