//! Powergate - A reverse proxy that powers its backend on demand
//!
//! This library provides a reverse proxy for a physically power-managed
//! server that:
//! - Forwards HTTP traffic on one or more listen ports to the server
//! - Powers the server on through its IPMI management interface when a request
//!   arrives while it is off, holding requests in a bounded queue meanwhile
//! - Tracks the server's power state with a single serialized state machine
//! - Powers the server off again after a configurable idle period

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod lifecycle;
pub mod monitor;
pub mod power;
pub mod proxy;
pub mod queue;
pub mod upstream;
