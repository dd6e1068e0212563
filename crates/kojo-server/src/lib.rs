//! kojo-server library: the session core.
//!
//! Network surfaces (HTTP handlers, WebSocket codecs) and other host
//! collaborators drive sessions exclusively through [`session::Manager`]
//! and [`session::Session`].

pub mod config;
pub mod session;
