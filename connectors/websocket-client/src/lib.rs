//! WebSocket client transport for Lens: a single logical connection with
//! transparent reconnection, replaying active subscriptions against the
//! server's operation log where possible.

pub mod client;
pub mod error;
pub mod registry;
pub mod state;

pub use client::{ClientConfig, LensClient};
pub use error::ClientError;
pub use registry::{SubState, SubscriptionEntry, SubscriptionRegistry};
pub use state::{ConnectionState, StateCell};
