//! Pacing and retry primitives for calls to slow or unreliable services.
//!
//! # Main types
//!
//! - [`RateLimiter`] — Per-key token buckets with lazy refill and bounded waits.
//! - [`RetryExecutor`] — Exponential-backoff retry loop with a caller-supplied predicate.
//! - [`RetryPolicy`] — Attempt count, backoff curve and per-attempt deadline.

/// Token-bucket rate limiting.
pub mod rate_limit;
/// Retry with exponential backoff.
pub mod retry;

pub use rate_limit::{BucketConfig, RateLimiter};
pub use retry::{RetryExecutor, RetryPolicy};
