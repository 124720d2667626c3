use async_trait::async_trait;
use parking_lot::Mutex;
use pg_pubsub::{NotifyClient, PubSubError, PubSubResult};
use tokio::task::JoinHandle;
use tokio_postgres::SimpleQueryMessage;
use tracing::{debug, warn};

const SESSION_ID_QUERY: &str = "SELECT pg_backend_pid()";

/// Command side of one tokio-postgres connection.
///
/// Owns the connection's driver task; closing or dropping the client stops
/// it, which also ends the notification stream.
pub struct PostgresClient {
    client: tokio_postgres::Client,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl PostgresClient {
    pub(crate) fn new(client: tokio_postgres::Client, driver: JoinHandle<()>) -> Self {
        Self {
            client,
            driver: Mutex::new(Some(driver)),
        }
    }

    fn stop_driver(&self) {
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
    }
}

#[async_trait]
impl NotifyClient for PostgresClient {
    async fn execute(&self, command: &str) -> PubSubResult<()> {
        self.client.batch_execute(command).await.map_err(map_error)
    }

    async fn execute_batch(&self, commands: &[String]) -> PubSubResult<()> {
        // One simple-query message, one round trip.
        self.client
            .batch_execute(&commands.join(";\n"))
            .await
            .map_err(map_error)
    }

    async fn session_id(&self) -> Option<i32> {
        match self.client.simple_query(SESSION_ID_QUERY).await {
            Ok(messages) => {
                let pid = messages.iter().find_map(|message| match message {
                    SimpleQueryMessage::Row(row) => parse_backend_pid(row.get(0)),
                    _ => None,
                });
                if pid.is_none() {
                    warn!("pg_backend_pid() returned no usable row");
                }
                pid
            }
            Err(e) => {
                warn!(error = %e, "Failed to query pg_backend_pid()");
                None
            }
        }
    }

    async fn close(&self) {
        debug!("Closing PostgreSQL connection");
        self.stop_driver();
    }
}

impl Drop for PostgresClient {
    fn drop(&mut self) {
        self.stop_driver();
    }
}

/// A closed connection is reported as "no active connection" so batch
/// retries wait for the supervisor's replacement.
fn map_error(e: tokio_postgres::Error) -> PubSubError {
    if e.is_closed() {
        PubSubError::NoActiveConnection
    } else {
        PubSubError::Execution(e.to_string())
    }
}

fn parse_backend_pid(value: Option<&str>) -> Option<i32> {
    value?.trim().parse().ok()
}
