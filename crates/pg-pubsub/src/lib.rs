//! Publish/subscribe event bus over PostgreSQL LISTEN/NOTIFY.
//!
//! This crate provides:
//! - NotificationBus: facade multiplexing subscribers and publishers over one
//!   listening connection
//! - Supervisor: reconnects with unbounded exponential backoff and re-issues
//!   LISTEN for every subscribed channel
//! - Outbound pipeline: synchronous and fire-and-forget NOTIFY batching
//! - MemoryBroker: in-process backend for tests and local use
//!
//! The database side is abstracted behind [`Connector`] and [`NotifyClient`];
//! the `pg-pubsub-postgres` crate implements them with tokio-postgres.

mod bus;
mod command;
mod config;
mod connection;
mod error;
mod fanout;
mod identifier;
mod memory;
mod notification;
mod outbound;
mod registry;
mod retry;
mod supervisor;

pub use bus::NotificationBus;
pub use command::{listen_command, notify_command, quote_identifier, quote_literal};
pub use config::{
    PubSubConfig, DEFAULT_INBOUND_BUFFER_SIZE, DEFAULT_OUTBOUND_BATCH_SIZE, MAX_INBOUND_BUFFER_SIZE,
    MAX_OUTBOUND_PARALLELISM, MAX_OUTBOUND_QUEUE_CAPACITY,
};
pub use connection::{
    ConnectionSlot, Connector, EstablishedConnection, LiveConnection, NotificationStream,
    NotifyClient,
};
pub use error::{PubSubError, PubSubResult};
pub use fanout::Subscription;
pub use identifier::{is_valid_identifier, validate_channel, MAX_IDENTIFIER_BYTES};
pub use memory::{MemoryBroker, MemoryConnector};
pub use notification::{NotificationEvent, NotificationRequest, RawNotification, UNKNOWN_SESSION_ID};
pub use registry::SubscriptionRegistry;
pub use retry::RetryPolicy;
pub use supervisor::SupervisorState;
