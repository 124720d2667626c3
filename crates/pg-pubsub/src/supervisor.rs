//! Connection supervisor: owns the single listening connection.
//!
//! ```text
//! Idle ──▶ Connecting ──▶ Listening ──(error)──▶ Backoff ──▶ Connecting …
//!                                   ──(shutdown)──▶ Closed
//! ```
//!
//! Every connect, LISTEN or receive error leads to `Backoff`; reconnect
//! attempts are unbounded. On shutdown the outbound worker drains its queue
//! before the connection is closed.

use crate::connection::{ConnectionSlot, Connector, EstablishedConnection, LiveConnection};
use crate::fanout::FanoutPublisher;
use crate::registry::{listen_channels, SubscriptionRegistry};
use crate::retry::RetryPolicy;
use crate::{NotificationEvent, PubSubError, UNKNOWN_SESSION_ID};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle state of the listening connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Not started.
    Idle,
    /// Opening a connection and re-issuing LISTEN.
    Connecting,
    /// Connection up, receiving notifications.
    Listening,
    /// Waiting before the next connection attempt.
    Backoff,
    /// Shut down. Terminal.
    Closed,
}

/// How a served connection ended.
enum Served {
    Shutdown,
    Failed(PubSubError),
}

pub(crate) struct Supervisor {
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) slot: Arc<ConnectionSlot>,
    pub(crate) registry: Arc<SubscriptionRegistry>,
    pub(crate) publisher: FanoutPublisher,
    pub(crate) state: Arc<watch::Sender<SupervisorState>>,
    pub(crate) policy: RetryPolicy,
    /// Fire-and-forget worker, awaited before the connection is closed.
    pub(crate) outbound: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Run until a shutdown signal arrives (or its sender is dropped).
    pub(crate) async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut attempt: u32 = 0;

        loop {
            self.set_state(SupervisorState::Connecting);
            debug!(attempt = attempt, "Opening notification connection");

            let connected = tokio::select! {
                _ = shutdown.recv() => break,
                result = self.connector.connect() => result,
            };

            let failure = match connected {
                Ok(established) => match self.serve(established, &mut shutdown, &mut attempt).await {
                    Served::Shutdown => break,
                    Served::Failed(e) => e,
                },
                Err(e) => e,
            };

            attempt = attempt.saturating_add(1);
            let delay = self.policy.delay_for(attempt);
            self.set_state(SupervisorState::Backoff);
            error!(
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Notification connection failed, scheduling reconnect"
            );

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        // The queue sender is dropped on shutdown, so the worker finishes
        // once what was queued has been sent or given up on.
        if let Some(worker) = self.outbound.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "Outbound notification worker failed");
            }
        }

        if let Some(live) = self.slot.clear() {
            debug!(session_id = live.session_id, "Closing notification connection");
            live.client.close().await;
        }
        self.set_state(SupervisorState::Closed);
        info!("Notification connection supervisor stopped");
    }

    /// Publish the connection, re-issue LISTEN for every registered channel
    /// and forward notifications until the connection fails or shutdown.
    ///
    /// On shutdown the connection is left in the slot for the caller to
    /// close after the outbound queue has drained.
    async fn serve(
        &self,
        established: EstablishedConnection,
        shutdown: &mut broadcast::Receiver<()>,
        attempt: &mut u32,
    ) -> Served {
        let EstablishedConnection {
            client,
            mut notifications,
        } = established;

        // Resolved before any notification is read, so events are always
        // tagged against the connection that delivered them.
        let reported = tokio::select! {
            _ = shutdown.recv() => {
                client.close().await;
                return Served::Shutdown;
            }
            reported = client.session_id() => reported,
        };
        let session_id = match reported {
            Some(id) => id,
            None => {
                warn!("Can't determine connection session id, local notification detection disabled");
                UNKNOWN_SESSION_ID
            }
        };

        let live = Arc::new(LiveConnection::new(client, session_id));
        self.slot.publish(live.clone());
        info!(session_id = session_id, "Notification connection established");

        // Taken after publishing, so a channel registered in between is
        // either in the snapshot or listened on by its subscriber. Both
        // paths share the connection's per-channel LISTEN.
        let channels = self.registry.snapshot();
        let listened = tokio::select! {
            _ = shutdown.recv() => return Served::Shutdown,
            result = listen_channels(&live, &channels) => result,
        };
        if let Err(e) = listened {
            self.release(&live).await;
            return Served::Failed(e);
        }

        *attempt = 0;
        self.set_state(SupervisorState::Listening);
        debug!(channels = channels.len(), "Receiving notifications");

        let failure = loop {
            tokio::select! {
                _ = shutdown.recv() => return Served::Shutdown,
                item = notifications.next() => match item {
                    Some(Ok(raw)) => {
                        debug!(
                            channel = %raw.channel,
                            process_id = raw.process_id,
                            "Received notification"
                        );
                        self.publisher.push(NotificationEvent::from_raw(raw, session_id));
                    }
                    Some(Err(e)) => break e,
                    None => break PubSubError::Connection("notification stream ended".into()),
                },
            }
        };

        self.release(&live).await;
        Served::Failed(failure)
    }

    /// Withdraw the connection from publishers, then close it.
    async fn release(&self, live: &Arc<LiveConnection>) {
        self.slot.clear();
        debug!(session_id = live.session_id, "Closing notification connection");
        live.client.close().await;
    }

    fn set_state(&self, state: SupervisorState) {
        self.state.send_replace(state);
    }
}
