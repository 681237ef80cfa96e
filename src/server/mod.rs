//! Control server
//!
//! Newline-delimited JSON over TCP. Clients send `{id, cmd, args}` requests
//! and receive `{id, result}` or `{id, message, code}` replies, interleaved with
//! `{event, data}` status broadcasts.

pub mod connection;
pub mod listener;

pub use listener::ControlServer;
