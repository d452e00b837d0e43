//! Message-routing and session-dispatch core for a distributed real-time
//! game server.
//!
//! A node admits client connections on a WebSocket frontend, decodes their
//! frames, and either handles each request locally or forwards it to a node
//! of the server type named by the route. Sessions carry the per-connection
//! identity and settings; before/after filter chains wrap every dispatch.

pub mod config;
pub mod server;
pub mod utils;
