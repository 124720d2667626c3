//! Subcommand implementations.

use futures_util::StreamExt;
use pg_pubsub::{NotificationBus, SupervisorState};
use std::error::Error;
use std::time::Duration;
use tracing::{debug, info};

type CommandResult = Result<(), Box<dyn Error + Send + Sync>>;

/// How long `notify` waits for the first connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Stream notifications on `channels` to stdout, one JSON object per line.
pub async fn listen(bus: &NotificationBus, channels: Vec<String>) -> CommandResult {
    let mut subscription = bus.subscribe(channels).await?;
    bus.connect();
    info!(channels = ?subscription.channels(), "Listening, press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                debug!("Interrupted");
                break;
            }
            event = subscription.next() => match event {
                Some(event) => println!("{}", serde_json::to_string(&event)?),
                None => break,
            },
        }
    }

    bus.shutdown();
    Ok(())
}

/// Publish a single notification once the bus is connected.
pub async fn notify(
    bus: &NotificationBus,
    channel: String,
    payload: Option<String>,
) -> CommandResult {
    bus.connect();
    wait_until_listening(bus, CONNECT_TIMEOUT).await?;

    bus.publish(channel.as_str(), payload).await?;
    info!(channel = %channel, "Notification sent");

    bus.shutdown();
    Ok(())
}

async fn wait_until_listening(bus: &NotificationBus, timeout: Duration) -> CommandResult {
    let mut changes = bus.state_changes();
    let listening = changes.wait_for(|s| *s == SupervisorState::Listening);

    let result = match tokio::time::timeout(timeout, listening).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) => Err("notification bus stopped before connecting".into()),
        Err(_) => Err(format!("no connection after {}s", timeout.as_secs()).into()),
    };
    result
}
