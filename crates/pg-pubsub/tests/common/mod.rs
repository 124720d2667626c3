//! Shared helpers for bus integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::StreamExt;
use pg_pubsub::{
    Connector, EstablishedConnection, MemoryBroker, MemoryConnector, NotificationBus,
    NotificationEvent, NotifyClient, PubSubConfig, PubSubResult, Subscription, SupervisorState,
};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(10);

/// Defaults with short backoffs so recovery tests run quickly.
pub fn fast_config() -> PubSubConfig {
    PubSubConfig {
        inbound_backoff_min_ms: 5,
        inbound_backoff_max_ms: 50,
        outbound_backoff_ms: 5,
        notify_backoff_ms: 5,
        retry_backoff_max_ms: 50,
        ..Default::default()
    }
}

/// Idle bus on `broker`.
pub fn new_bus(broker: &MemoryBroker, config: PubSubConfig) -> NotificationBus {
    NotificationBus::new(broker.connector(), config).unwrap()
}

/// Bus on `broker`, connected and listening.
pub async fn connected_bus(broker: &MemoryBroker) -> NotificationBus {
    let bus = new_bus(broker, fast_config());
    bus.connect();
    wait_for_state(&bus, SupervisorState::Listening).await;
    bus
}

/// Wait until the bus reports `state`.
pub async fn wait_for_state(bus: &NotificationBus, state: SupervisorState) {
    let mut changes = bus.state_changes();
    tokio::time::timeout(WAIT, changes.wait_for(|current| *current == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state:?}"))
        .unwrap();
}

/// Poll `condition` until it holds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Next event, failing the test on timeout or end of stream.
pub async fn next_event(subscription: &mut Subscription) -> NotificationEvent {
    tokio::time::timeout(WAIT, subscription.next())
        .await
        .expect("timed out waiting for notification")
        .expect("subscription ended")
}

/// Next `count` events.
pub async fn collect_events(subscription: &mut Subscription, count: usize) -> Vec<NotificationEvent> {
    let mut events = Vec::with_capacity(count);
    for _ in 0..count {
        events.push(next_event(subscription).await);
    }
    events
}

/// Assert the subscription yields nothing for a short while.
pub async fn assert_quiet(subscription: &mut Subscription) {
    let result = tokio::time::timeout(Duration::from_millis(100), subscription.next()).await;
    assert!(result.is_err(), "unexpected notification: {:?}", result);
}

/// Payload of `event` as `&str`, empty when absent.
pub fn payload(event: &NotificationEvent) -> &str {
    event.payload.as_deref().unwrap_or_default()
}

/// Connector over a [`MemoryBroker`] whose clients stall on some calls.
#[derive(Clone)]
pub struct StallingConnector {
    inner: MemoryConnector,
    listen_delay: Duration,
    hang_session_id: bool,
}

impl StallingConnector {
    /// Every LISTEN takes `delay` before reaching the broker.
    pub fn slow_listen(broker: &MemoryBroker, delay: Duration) -> Self {
        Self {
            inner: broker.connector(),
            listen_delay: delay,
            hang_session_id: false,
        }
    }

    /// Asking for the session id never completes.
    pub fn hanging_session_id(broker: &MemoryBroker) -> Self {
        Self {
            inner: broker.connector(),
            listen_delay: Duration::ZERO,
            hang_session_id: true,
        }
    }
}

#[async_trait]
impl Connector for StallingConnector {
    async fn connect(&self) -> PubSubResult<EstablishedConnection> {
        let established = self.inner.connect().await?;
        Ok(EstablishedConnection {
            client: Arc::new(StallingClient {
                inner: established.client,
                listen_delay: self.listen_delay,
                hang_session_id: self.hang_session_id,
            }),
            notifications: established.notifications,
        })
    }
}

struct StallingClient {
    inner: Arc<dyn NotifyClient>,
    listen_delay: Duration,
    hang_session_id: bool,
}

#[async_trait]
impl NotifyClient for StallingClient {
    async fn execute(&self, command: &str) -> PubSubResult<()> {
        if command.starts_with("LISTEN") {
            tokio::time::sleep(self.listen_delay).await;
        }
        self.inner.execute(command).await
    }

    async fn execute_batch(&self, commands: &[String]) -> PubSubResult<()> {
        self.inner.execute_batch(commands).await
    }

    async fn session_id(&self) -> Option<i32> {
        if self.hang_session_id {
            std::future::pending::<()>().await;
        }
        self.inner.session_id().await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

/// Number of `LISTEN` commands the broker received for `channel`.
pub fn listen_commands(broker: &MemoryBroker, channel: &str) -> usize {
    let expected = format!("LISTEN \"{channel}\"");
    broker
        .executed_commands()
        .iter()
        .filter(|c| **c == expected)
        .count()
}
