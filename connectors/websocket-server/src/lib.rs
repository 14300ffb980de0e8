mod client_ip;
mod ratelimit;
mod server;
mod state;
mod user_agent;

pub use client_ip::SmartClientIp;
pub use server::{LensWebsocketServer, ServerError};
pub use user_agent::OptionalUserAgent;
