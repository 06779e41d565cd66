//! Connection registry, subscription protocol, liveness reaping, and fan-out.

pub mod connection;
pub mod dispatcher;
pub mod handler;
pub mod protocol;
pub mod reaper;
pub mod registry;
