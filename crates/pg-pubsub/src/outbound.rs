//! Outbound pipeline: NOTIFY execution, retry, and fire-and-forget batching.

use crate::command::notify_command;
use crate::config::MAX_OUTBOUND_PARALLELISM;
use crate::connection::ConnectionSlot;
use crate::retry::RetryPolicy;
use crate::{NotificationRequest, PubSubResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Executes NOTIFY batches against whatever connection is live right now.
pub(crate) struct NotifyExecutor {
    slot: Arc<ConnectionSlot>,
}

impl NotifyExecutor {
    pub(crate) fn new(slot: Arc<ConnectionSlot>) -> Self {
        Self { slot }
    }

    /// Execute one batch, single try. One request is sent as a single
    /// statement, several as one grouped round trip.
    pub(crate) async fn execute(&self, requests: &[NotificationRequest]) -> PubSubResult<()> {
        let Some(first) = requests.first() else {
            return Ok(());
        };

        let live = self.slot.require()?;

        if requests.len() == 1 {
            live.client.execute(&notify_command(first)).await?;
        } else {
            let commands: Vec<String> = requests.iter().map(notify_command).collect();
            live.client.execute_batch(&commands).await?;
        }

        debug!(count = requests.len(), "Sent notifications");
        Ok(())
    }

    /// Execute one batch, retrying only while there is no active connection.
    pub(crate) async fn execute_with_retry(
        &self,
        requests: &[NotificationRequest],
        policy: &RetryPolicy,
    ) -> PubSubResult<()> {
        let mut attempt: u32 = 0;

        loop {
            match self.execute(requests).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_no_active_connection() && policy.allows(attempt + 1) => {
                    attempt += 1;
                    let delay = policy.delay_for(attempt);
                    warn!(
                        count = requests.len(),
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        "No active connection, retrying notification batch"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        count = requests.len(),
                        attempts = attempt + 1,
                        error = %e,
                        "Notifications have not been sent"
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Execute `requests` in order as consecutive batches of at most
    /// `batch_size`, stopping at the first failed batch.
    pub(crate) async fn execute_chunked(
        &self,
        requests: &[NotificationRequest],
        batch_size: usize,
        policy: &RetryPolicy,
    ) -> PubSubResult<()> {
        for chunk in requests.chunks(batch_size.max(1)) {
            self.execute_with_retry(chunk, policy).await?;
        }
        Ok(())
    }
}

/// Why a fire-and-forget request was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EnqueueError {
    /// Bounded queue at capacity.
    Full,
    /// Worker gone.
    Closed,
}

/// Producer side of the fire-and-forget queue.
#[derive(Clone)]
pub(crate) enum OutboundSender {
    Bounded(mpsc::Sender<NotificationRequest>),
    Unbounded(mpsc::UnboundedSender<NotificationRequest>),
}

impl OutboundSender {
    /// Queue a request without waiting.
    pub(crate) fn enqueue(&self, request: NotificationRequest) -> Result<(), EnqueueError> {
        match self {
            OutboundSender::Bounded(sender) => sender.try_send(request).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
                mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
            }),
            OutboundSender::Unbounded(sender) => {
                sender.send(request).map_err(|_| EnqueueError::Closed)
            }
        }
    }
}

/// Consumer side of the fire-and-forget queue.
pub(crate) enum OutboundReceiver {
    Bounded(mpsc::Receiver<NotificationRequest>),
    Unbounded(mpsc::UnboundedReceiver<NotificationRequest>),
}

impl OutboundReceiver {
    async fn recv(&mut self) -> Option<NotificationRequest> {
        match self {
            OutboundReceiver::Bounded(receiver) => receiver.recv().await,
            OutboundReceiver::Unbounded(receiver) => receiver.recv().await,
        }
    }
}

/// Create the fire-and-forget queue; `None` capacity means unbounded.
pub(crate) fn outbound_queue(capacity: Option<usize>) -> (OutboundSender, OutboundReceiver) {
    match capacity {
        Some(capacity) => {
            let (sender, receiver) = mpsc::channel(capacity.max(1));
            (OutboundSender::Bounded(sender), OutboundReceiver::Bounded(receiver))
        }
        None => {
            let (sender, receiver) = mpsc::unbounded_channel();
            (OutboundSender::Unbounded(sender), OutboundReceiver::Unbounded(receiver))
        }
    }
}

/// Drains the fire-and-forget queue into batches.
///
/// A batch is flushed when it reaches `batch_size` or when `window` has
/// elapsed since its first request arrived. At most `parallelism` batches
/// execute at once; with a parallelism of 1 they execute in queue order.
pub(crate) struct BatchWorker {
    pub(crate) executor: Arc<NotifyExecutor>,
    pub(crate) batch_size: usize,
    pub(crate) window: Duration,
    pub(crate) parallelism: usize,
    pub(crate) policy: RetryPolicy,
}

impl BatchWorker {
    /// Run until every sender has been dropped and the queue is drained.
    pub(crate) async fn run(self, mut receiver: OutboundReceiver) {
        let parallelism = self.parallelism.clamp(1, MAX_OUTBOUND_PARALLELISM);
        let permits = Arc::new(Semaphore::new(parallelism));
        let mut closed = false;

        while !closed {
            let Some(first) = receiver.recv().await else {
                break;
            };

            let mut batch = Vec::with_capacity(self.batch_size.min(64));
            batch.push(first);
            let deadline = Instant::now() + self.window;

            while batch.len() < self.batch_size {
                match tokio::time::timeout_at(deadline, receiver.recv()).await {
                    Ok(Some(request)) => batch.push(request),
                    Ok(None) => {
                        closed = true;
                        break;
                    }
                    Err(_) => break,
                }
            }

            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };

            let executor = self.executor.clone();
            let policy = self.policy;
            tokio::spawn(async move {
                let _permit = permit;
                dispatch(&executor, batch, &policy).await;
            });
        }

        // Let in-flight batches finish before reporting the worker as stopped.
        let _ = permits.acquire_many(parallelism as u32).await;
        debug!("Outbound notification worker stopped");
    }
}

async fn dispatch(executor: &NotifyExecutor, batch: Vec<NotificationRequest>, policy: &RetryPolicy) {
    if let Err(e) = executor.execute_with_retry(&batch, policy).await {
        error!(
            count = batch.len(),
            error = %e,
            "Dropping asynchronous notification batch"
        );
    }
}
