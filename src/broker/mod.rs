// Simplex messaging protocol broker
//
// This module implements an in-memory rendezvous server that brokers
// unidirectional messages between anonymous senders and authenticated
// recipients. Each message queue is a dual-keyed connection record; the
// recipient subscribes to it, senders push into it, and delivery is
// throttled to one unacknowledged message at a time.

pub mod auth;
pub mod broker;
pub mod cli;
pub mod client;
pub mod config;
pub mod ids;
pub mod message;
pub mod server;
pub mod storage;

pub use auth::{KeyMatchVerifier, SignatureVerifier};
pub use broker::{RegistryHandle, SessionHandle, SubscriberRegistry};
pub use cli::BrokerCli;
pub use client::ClientSession;
pub use config::ServerConfig;
pub use ids::IdGenerator;
pub use message::{Command, ErrorKind, Id, Message, MessageQueue, MessageStore, PubKey, Transmission};
pub use server::{BrokerState, ServerInstance};
pub use storage::{Connection, ConnectionStore, Party, QueueStatus};
