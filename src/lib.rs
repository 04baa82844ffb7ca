//! Slidegate - Sliding-Window Admission Gate
//!
//! This crate wraps an outbound request sender in a sliding-window rate
//! limiter. At most N calls are admitted within any trailing T-second window;
//! calls over the quota are rejected or held until the window has room,
//! honoring each caller's cancellation token and deadline.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
