//! Internal utilities for claude-relay
//!
//! This module contains internal implementation details that are not part of the public API.
//! Some types are re-exported through `lib.rs` for public use (SseParser, TokenUsage).

pub mod sse;
pub mod suspend;
