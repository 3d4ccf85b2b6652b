//! Shared building blocks for the Foreman workflow coordinator.
//!
//! # Main types
//!
//! - [`ForemanError`] — Error taxonomy used by every crate in the workspace.
//! - [`EventBus`] — Channel-keyed, non-blocking publish/subscribe fan-out.
//! - [`Subscription`] — A subscriber's bounded, drop-oldest view of one channel.
//! - [`PubSubTransport`] — Seam for mirroring the bus into an external broker.
//! - [`CancelSignal`] — Cloneable cancellation flag observed by every wait point.

/// Cooperative cancellation.
pub mod cancel;
/// Error types.
pub mod error;
/// Event bus, subscriptions and broker bridge.
pub mod events;

pub use cancel::CancelSignal;
pub use error::{ForemanError, ForemanResult};
pub use events::{channels, Event, EventBus, EventStream, PubSubTransport, Subscription};
