//! A client and worker library for the Gearman distributed job-queue
//! protocol.
//!
//! A [`Client`] submits jobs and a [`Worker`] executes them; both hold a
//! pool of server connections with automatic reconnection and round-robin
//! scheduling. Each instance runs two background tasks: one polls every
//! active connection and dispatches inbound packets, the other brings
//! lost connections back up. Binary protocol packets and administrative
//! text commands share each socket and are framed apart by the codec in
//! [`wire`].
//!
//! Clients and workers must be created inside a Tokio runtime, and
//! multiple instances in one process are fully independent.

pub mod admin;
pub mod client;
pub mod conn;
mod dispatch;
pub mod error;
mod pool;
mod poller;
mod reconnect;
#[cfg(test)]
mod testutil;
pub mod types;
pub mod wire;
pub mod worker;

pub use admin::AdminRequest;
pub use client::Client;
pub use conn::{Connection, TlsConfig};
pub use error::{GearmanError, Result};
pub use types::job::{FunctionRecord, Job, Precedence, WorkerJob};
pub use worker::Worker;
