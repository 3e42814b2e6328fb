//! smpd - in-memory simplex messaging protocol broker
//!
//! Brokers unidirectional messages between anonymous senders and
//! authenticated recipients over per-queue connections.

pub mod broker;

pub use broker::{BrokerState, ServerConfig, ServerInstance};
