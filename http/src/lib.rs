//! HTTP/SSE transport for Lens: a thin bridge over the same engine the
//! websocket adapter drives — one-shot operation execution over `POST /`,
//! metadata and health endpoints, and a long-lived `/__lens/sse` channel for
//! subscriptions.

mod client_ip;
mod ratelimit;
mod server;
mod state;
mod user_agent;

pub use client_ip::SmartClientIp;
pub use server::{LensHttpServer, ServerError};
pub use user_agent::OptionalUserAgent;
