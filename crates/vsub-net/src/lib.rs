//! ---
//! vsub_section: "04-external-interfaces"
//! vsub_subsection: "module"
//! vsub_type: "source"
//! vsub_scope: "code"
//! vsub_description: "HTTP and WebSocket surface of the coordinator."
//! vsub_version: "v0.1.0"
//! vsub_owner: "tbd"
//! ---
//! Inbound API for control panels, the device-under-test and status observers.
#![warn(missing_docs)]

pub mod rest;
mod websocket;

pub use rest::{
    CommandHandler, CommandRequest, CommandResponse, RestApiBuilder, RestApiHandle,
    StatusProvider,
};
