//! Backend collaborator traits and the shared live-connection slot.

use crate::command::listen_command;
use crate::{PubSubError, PubSubResult, RawNotification};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Stream of notifications received on one physical connection.
///
/// An `Err` item or the end of the stream means the connection is gone.
pub type NotificationStream = BoxStream<'static, PubSubResult<RawNotification>>;

/// Opens physical connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new connection.
    async fn connect(&self) -> PubSubResult<EstablishedConnection>;
}

/// Command side of a physical connection.
#[async_trait]
pub trait NotifyClient: Send + Sync {
    /// Execute a single command.
    async fn execute(&self, command: &str) -> PubSubResult<()>;

    /// Execute several commands in one round trip.
    async fn execute_batch(&self, commands: &[String]) -> PubSubResult<()>;

    /// Backend session id of this connection, if the backend can report it.
    async fn session_id(&self) -> Option<i32>;

    /// Close the connection. Must be safe to call more than once.
    async fn close(&self);
}

/// A freshly opened connection: its command client and notification stream.
pub struct EstablishedConnection {
    /// Command side.
    pub client: Arc<dyn NotifyClient>,
    /// Inbound notifications.
    pub notifications: NotificationStream,
}

/// The connection currently in use, with the session id it reported.
pub struct LiveConnection {
    /// Command side of the connection.
    pub client: Arc<dyn NotifyClient>,
    /// Session id, or [`crate::UNKNOWN_SESSION_ID`].
    pub session_id: i32,
    /// Outcome of the LISTEN issued for each channel on this connection.
    listens: DashMap<String, Arc<OnceCell<bool>>>,
}

impl LiveConnection {
    pub fn new(client: Arc<dyn NotifyClient>, session_id: i32) -> Self {
        Self {
            client,
            session_id,
            listens: DashMap::new(),
        }
    }

    /// Listen on `channel`, at most once per connection.
    ///
    /// Concurrent callers for the same channel share one `LISTEN` and all
    /// return once it has completed. A channel whose `LISTEN` failed keeps
    /// failing on this connection; the next connection starts clean.
    pub async fn listen(&self, channel: &str) -> PubSubResult<()> {
        let gate = self.listens.entry(channel.to_string()).or_default().clone();

        let mut failure = None;
        let failure_slot = &mut failure;
        let listened = *gate
            .get_or_init(move || async move {
                match self.client.execute(&listen_command(channel)).await {
                    Ok(()) => true,
                    Err(e) => {
                        *failure_slot = Some(e);
                        false
                    }
                }
            })
            .await;

        match (listened, failure) {
            (true, _) => Ok(()),
            (false, Some(e)) => Err(e),
            (false, None) => Err(PubSubError::Execution(format!(
                "LISTEN on channel {channel} failed on this connection"
            ))),
        }
    }

    /// Whether a `LISTEN` for `channel` completed on this connection.
    pub fn is_listening(&self, channel: &str) -> bool {
        self.listens
            .get(channel)
            .is_some_and(|gate| gate.value().get() == Some(&true))
    }
}

/// Atomically replaceable handle to the live connection.
///
/// Written only by the supervisor. Readers take a snapshot per operation
/// and never wait for a connection to appear.
#[derive(Default)]
pub struct ConnectionSlot {
    current: ArcSwapOption<LiveConnection>,
}

impl ConnectionSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the live connection, if any.
    pub fn current(&self) -> Option<Arc<LiveConnection>> {
        self.current.load_full()
    }

    /// Snapshot of the live connection or [`PubSubError::NoActiveConnection`].
    pub fn require(&self) -> PubSubResult<Arc<LiveConnection>> {
        self.current().ok_or(PubSubError::NoActiveConnection)
    }

    /// Whether a connection is currently published.
    pub fn is_connected(&self) -> bool {
        self.current.load().is_some()
    }

    pub(crate) fn publish(&self, connection: Arc<LiveConnection>) {
        self.current.store(Some(connection));
    }

    pub(crate) fn clear(&self) -> Option<Arc<LiveConnection>> {
        self.current.swap(None)
    }
}
