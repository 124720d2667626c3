use crate::client::PostgresClient;
use async_trait::async_trait;
use futures_util::StreamExt;
use pg_pubsub::{Connector, EstablishedConnection, PubSubError, PubSubResult, RawNotification};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, NoTls};
use tracing::{debug, error, info, warn};

/// `application_name` reported to the server unless the URL sets one.
pub const DEFAULT_APPLICATION_NAME: &str = "pg-pubsub";

/// Opens tokio-postgres connections for the notification bus.
#[derive(Clone)]
pub struct PostgresConnector {
    config: tokio_postgres::Config,
}

impl PostgresConnector {
    /// Build from a connection config.
    pub fn new(mut config: tokio_postgres::Config) -> Self {
        if config.get_application_name().is_none() {
            config.application_name(DEFAULT_APPLICATION_NAME);
        }
        Self { config }
    }

    /// Parse a `postgres://` URL or a `key=value` connection string.
    pub fn from_url(url: &str) -> PubSubResult<Self> {
        let config: tokio_postgres::Config = url
            .parse()
            .map_err(|e| PubSubError::Config(format!("invalid connection string: {e}")))?;
        Ok(Self::new(config))
    }

    /// Connection settings in use.
    pub fn config(&self) -> &tokio_postgres::Config {
        &self.config
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    async fn connect(&self) -> PubSubResult<EstablishedConnection> {
        let (client, mut connection) = self
            .config
            .connect(NoTls)
            .await
            .map_err(|e| PubSubError::Connection(format!("PostgreSQL connect: {e}")))?;

        info!(
            hosts = ?self.config.get_hosts(),
            dbname = self.config.get_dbname().unwrap_or_default(),
            "Connected to PostgreSQL"
        );

        let (tx, rx) = mpsc::unbounded_channel::<PubSubResult<RawNotification>>();

        // Polling the connection both drives the protocol and surfaces
        // asynchronous messages.
        let driver = tokio::spawn(async move {
            let mut messages =
                futures_util::stream::poll_fn(move |cx| connection.poll_message(cx));

            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(notification)) => {
                        let raw = RawNotification {
                            channel: notification.channel().to_string(),
                            payload: non_empty(notification.payload()),
                            process_id: notification.process_id(),
                        };
                        if tx.send(Ok(raw)).is_err() {
                            break;
                        }
                    }
                    Ok(AsyncMessage::Notice(notice)) => {
                        debug!(
                            severity = notice.severity(),
                            message = notice.message(),
                            "PostgreSQL notice"
                        );
                    }
                    Ok(_) => {
                        warn!("Ignoring unexpected asynchronous PostgreSQL message");
                    }
                    Err(e) => {
                        error!(error = %e, "PostgreSQL connection error");
                        let _ = tx.send(Err(PubSubError::Connection(e.to_string())));
                        break;
                    }
                }
            }

            debug!("PostgreSQL connection driver stopped");
        });

        Ok(EstablishedConnection {
            client: Arc::new(PostgresClient::new(client, driver)),
            notifications: notification_stream(rx),
        })
    }
}

fn notification_stream(
    mut rx: mpsc::UnboundedReceiver<PubSubResult<RawNotification>>,
) -> pg_pubsub::NotificationStream {
    futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed()
}

/// PostgreSQL reports an absent payload as the empty string.
fn non_empty(payload: &str) -> Option<String> {
    (!payload.is_empty()).then(|| payload.to_string())
}
