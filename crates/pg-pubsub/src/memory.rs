//! In-process LISTEN/NOTIFY broker.
//!
//! Behaves like a single database server: every connection gets its own
//! process id and listen set, and a `NOTIFY` reaches every connection
//! listening on the channel, the sender included. Commands are parsed from
//! the same text the bus sends to PostgreSQL, with unquoted channel names
//! folded to lower case as the server does.
//!
//! The broker also exposes failure controls (connection resets, outages,
//! missing session ids, injected execution errors) for exercising the
//! bus's recovery paths without a database.

use crate::command::Command;
use crate::connection::{Connector, EstablishedConnection, NotifyClient};
use crate::{PubSubError, PubSubResult, RawNotification};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

/// First process id handed out.
const FIRST_PROCESS_ID: i32 = 1000;

type NotificationSender = mpsc::UnboundedSender<PubSubResult<RawNotification>>;

struct Session {
    listening: HashSet<String>,
    sender: NotificationSender,
}

struct BrokerState {
    next_process_id: AtomicI32,
    sessions: Mutex<HashMap<i32, Session>>,
    available: AtomicBool,
    session_ids_supported: AtomicBool,
    connect_count: AtomicUsize,
    failing_executions: AtomicUsize,
    executed: Mutex<Vec<String>>,
}

/// Shared in-memory server. Cloning yields another handle to the same server.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create an empty, available broker.
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                next_process_id: AtomicI32::new(FIRST_PROCESS_ID),
                sessions: Mutex::new(HashMap::new()),
                available: AtomicBool::new(true),
                session_ids_supported: AtomicBool::new(true),
                connect_count: AtomicUsize::new(0),
                failing_executions: AtomicUsize::new(0),
                executed: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Connector opening sessions on this broker.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    /// Drop every open session. Their notification streams yield an error
    /// and their clients report no active connection.
    pub fn reset_connections(&self) {
        let sessions: Vec<(i32, Session)> = self.state.sessions.lock().drain().collect();
        info!(count = sessions.len(), "Resetting in-memory connections");

        for (_, session) in sessions {
            let _ = session
                .sender
                .send(Err(PubSubError::Connection("connection reset by broker".into())));
        }
    }

    /// While unavailable, new connection attempts fail.
    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::SeqCst);
    }

    /// Whether clients can report their session id.
    pub fn set_session_ids_supported(&self, supported: bool) {
        self.state.session_ids_supported.store(supported, Ordering::SeqCst);
    }

    /// Make the next `count` command executions fail with an execution error.
    pub fn fail_next_executions(&self, count: usize) {
        self.state.failing_executions.store(count, Ordering::SeqCst);
    }

    /// Number of successful connection attempts so far.
    pub fn connect_count(&self) -> usize {
        self.state.connect_count.load(Ordering::SeqCst)
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.state.sessions.lock().len()
    }

    /// Number of open sessions listening on `channel`.
    pub fn listener_count(&self, channel: &str) -> usize {
        self.state
            .sessions
            .lock()
            .values()
            .filter(|session| session.listening.contains(channel))
            .count()
    }

    /// Every command received so far, in execution order.
    pub fn executed_commands(&self) -> Vec<String> {
        self.state.executed.lock().clone()
    }

    fn open_session(&self) -> PubSubResult<EstablishedConnection> {
        if !self.state.available.load(Ordering::SeqCst) {
            return Err(PubSubError::Connection("broker unavailable".into()));
        }

        let process_id = self.state.next_process_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.state.sessions.lock().insert(
            process_id,
            Session {
                listening: HashSet::new(),
                sender,
            },
        );
        self.state.connect_count.fetch_add(1, Ordering::SeqCst);
        debug!(process_id = process_id, "In-memory session opened");

        Ok(EstablishedConnection {
            client: Arc::new(MemoryClient {
                broker: self.clone(),
                process_id,
                closed: AtomicBool::new(false),
            }),
            notifications: UnboundedReceiverStream::new(receiver).boxed(),
        })
    }

    fn execute(&self, process_id: i32, text: &str) -> PubSubResult<()> {
        self.state.executed.lock().push(text.to_string());

        let injected = self
            .state
            .failing_executions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(PubSubError::Execution("injected execution failure".into()));
        }

        let command = Command::parse(text)
            .ok_or_else(|| PubSubError::Execution(format!("syntax error in {text:?}")))?;

        let mut sessions = self.state.sessions.lock();
        if !sessions.contains_key(&process_id) {
            return Err(PubSubError::NoActiveConnection);
        }

        match command {
            Command::Listen(channel) => {
                if let Some(session) = sessions.get_mut(&process_id) {
                    session.listening.insert(channel);
                }
            }
            Command::Notify { channel, payload } => {
                // An absent payload and an empty one are indistinguishable on
                // the receiving side.
                let payload = payload.filter(|p| !p.is_empty());
                for session in sessions.values().filter(|s| s.listening.contains(&channel)) {
                    let _ = session.sender.send(Ok(RawNotification {
                        channel: channel.clone(),
                        payload: payload.clone(),
                        process_id,
                    }));
                }
            }
        }

        Ok(())
    }

    fn close_session(&self, process_id: i32) {
        if self.state.sessions.lock().remove(&process_id).is_some() {
            debug!(process_id = process_id, "In-memory session closed");
        }
    }
}

/// [`Connector`] for a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> PubSubResult<EstablishedConnection> {
        self.broker.open_session()
    }
}

struct MemoryClient {
    broker: MemoryBroker,
    process_id: i32,
    closed: AtomicBool,
}

#[async_trait]
impl NotifyClient for MemoryClient {
    async fn execute(&self, command: &str) -> PubSubResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PubSubError::NoActiveConnection);
        }
        self.broker.execute(self.process_id, command)
    }

    async fn execute_batch(&self, commands: &[String]) -> PubSubResult<()> {
        for command in commands {
            self.execute(command).await?;
        }
        Ok(())
    }

    async fn session_id(&self) -> Option<i32> {
        self.broker
            .state
            .session_ids_supported
            .load(Ordering::SeqCst)
            .then_some(self.process_id)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.close_session(self.process_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connect(broker: &MemoryBroker) -> EstablishedConnection {
        broker.connector().connect().await.unwrap()
    }

    #[tokio::test]
    async fn test_notify_reaches_listeners_with_sender_process_id() {
        let broker = MemoryBroker::new();
        let mut listener = connect(&broker).await;
        let sender = connect(&broker).await;

        listener.client.execute("LISTEN orders").await.unwrap();
        sender.client.execute("NOTIFY orders, 'it''s here'").await.unwrap();

        let raw = listener.notifications.next().await.unwrap().unwrap();
        assert_eq!(raw.channel, "orders");
        assert_eq!(raw.payload.as_deref(), Some("it's here"));
        assert_eq!(Some(raw.process_id), sender.client.session_id().await);
    }

    #[tokio::test]
    async fn test_unquoted_channels_fold_to_lower_case() {
        let broker = MemoryBroker::new();
        let mut conn = connect(&broker).await;

        conn.client.execute("LISTEN OrderCreated").await.unwrap();
        assert_eq!(broker.listener_count("ordercreated"), 1);
        assert_eq!(broker.listener_count("OrderCreated"), 0);

        // Quoted names keep their case and miss the folded listener.
        conn.client.execute("NOTIFY \"OrderCreated\", 'quoted'").await.unwrap();
        conn.client.execute("NOTIFY ORDERCREATED, 'folded'").await.unwrap();

        let raw = conn.notifications.next().await.unwrap().unwrap();
        assert_eq!(raw.channel, "ordercreated");
        assert_eq!(raw.payload.as_deref(), Some("folded"));
    }

    #[tokio::test]
    async fn test_empty_payload_delivered_as_none() {
        let broker = MemoryBroker::new();
        let mut conn = connect(&broker).await;

        conn.client.execute("LISTEN c").await.unwrap();
        conn.client.execute("NOTIFY c, ''").await.unwrap();
        conn.client.execute("NOTIFY c").await.unwrap();

        assert_eq!(conn.notifications.next().await.unwrap().unwrap().payload, None);
        assert_eq!(conn.notifications.next().await.unwrap().unwrap().payload, None);
    }

    #[tokio::test]
    async fn test_process_ids_are_distinct() {
        let broker = MemoryBroker::new();
        let first = connect(&broker).await;
        let second = connect(&broker).await;

        assert_eq!(first.client.session_id().await, Some(FIRST_PROCESS_ID));
        assert_eq!(second.client.session_id().await, Some(FIRST_PROCESS_ID + 1));
        assert_eq!(broker.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_reset_fails_streams_and_clients() {
        let broker = MemoryBroker::new();
        let mut conn = connect(&broker).await;

        broker.reset_connections();

        assert!(matches!(
            conn.notifications.next().await,
            Some(Err(PubSubError::Connection(_)))
        ));
        assert!(conn.notifications.next().await.is_none());
        assert!(matches!(
            conn.client.execute("NOTIFY c").await,
            Err(PubSubError::NoActiveConnection)
        ));
        assert_eq!(broker.session_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_broker_refuses_connections() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        assert!(broker.connector().connect().await.is_err());

        broker.set_available(true);
        assert!(broker.connector().connect().await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_client_reports_no_active_connection() {
        let broker = MemoryBroker::new();
        let mut conn = connect(&broker).await;

        conn.client.close().await;
        conn.client.close().await;

        assert!(conn.notifications.next().await.is_none());
        assert!(matches!(
            conn.client.execute("LISTEN c").await,
            Err(PubSubError::NoActiveConnection)
        ));
    }

    #[tokio::test]
    async fn test_injected_failures_and_syntax_errors() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;

        broker.fail_next_executions(1);
        assert!(matches!(
            conn.client.execute("LISTEN c").await,
            Err(PubSubError::Execution(_))
        ));
        assert!(conn.client.execute("LISTEN c").await.is_ok());
        assert!(matches!(
            conn.client.execute("SELECT 1").await,
            Err(PubSubError::Execution(_))
        ));

        assert_eq!(broker.executed_commands(), vec!["LISTEN c", "LISTEN c", "SELECT 1"]);
        assert_eq!(broker.listener_count("c"), 1);
    }

    #[tokio::test]
    async fn test_session_ids_can_be_withheld() {
        let broker = MemoryBroker::new();
        broker.set_session_ids_supported(false);
        let conn = connect(&broker).await;
        assert_eq!(conn.client.session_id().await, None);
    }
}
