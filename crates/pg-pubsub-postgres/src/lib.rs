//! PostgreSQL backend for `pg-pubsub`.
//!
//! [`PostgresConnector`] opens plain (`NoTls`) tokio-postgres connections.
//! Each connection's driver runs on its own task and forwards asynchronous
//! `NOTIFY` messages into the stream the bus supervisor reads.

mod client;
mod connector;

pub use client::PostgresClient;
pub use connector::{PostgresConnector, DEFAULT_APPLICATION_NAME};
