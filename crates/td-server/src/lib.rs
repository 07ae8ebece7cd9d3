//! The td HTTP server and webhook dispatcher.
//!
//! A thin REST surface over the entity store, the sync push/pull endpoints,
//! and a server-sent-events stream of new sync events. The webhook module
//! packages recent action_log rows and hands them to a detached child
//! process so command latency never waits on the network.

pub mod auth;
pub mod event_bus;
pub mod http_api;
pub mod serve;
pub mod webhook;

pub use http_api::{api_router, ApiState};
pub use serve::{run, ServeError, ServeOptions};
