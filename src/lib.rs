//! eventrelay - authorized event fan-out
//!
//! Routes produced events to the registered subscribers entitled to them
//! and runs each subscriber's configured command with event data
//! substituted in.

pub mod acl;
pub mod api;
pub mod bus;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod event;
pub mod executor;
pub mod registry;
pub mod relay;
pub mod standalone;
pub mod utils;
