//! In-process at-least-once notification transport

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::completion::{AckHandle, CompletionHandler, Message};
use crate::error::{Result, SchedulerError};

/// Deliveries of one message before it is dropped
pub const DEFAULT_MAX_DELIVERIES: u32 = 10;

/// Publishes notification bodies
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish a message, returning its id
    async fn publish(&self, data: Vec<u8>, attributes: HashMap<String, String>) -> Result<String>;
}

/// Transport counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub published: u64,
    pub delivered: u64,
    pub acked: u64,
    pub nacked: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> TransportStats {
        TransportStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
struct Envelope {
    id: String,
    data: Vec<u8>,
    attributes: HashMap<String, String>,
    delivery_attempt: u32,
}

/// State shared by the transport and the ack handles it hands out
#[derive(Debug)]
struct Shared {
    sender: mpsc::UnboundedSender<Envelope>,
    counters: Counters,
    redelivery_delay: Duration,
    max_deliveries: u32,
}

/// Channel-backed transport: every nacked message comes back after the
/// redelivery delay, up to `max_deliveries` deliveries.
#[derive(Debug)]
pub struct ChannelTransport {
    shared: Arc<Shared>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    next_id: AtomicU64,
}

impl ChannelTransport {
    pub fn new(redelivery_delay: Duration) -> Self {
        Self::with_max_deliveries(redelivery_delay, DEFAULT_MAX_DELIVERIES)
    }

    pub fn with_max_deliveries(redelivery_delay: Duration, max_deliveries: u32) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                sender,
                counters: Counters::default(),
                redelivery_delay,
                max_deliveries: max_deliveries.max(1),
            }),
            receiver: Mutex::new(Some(receiver)),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> TransportStats {
        self.shared.counters.snapshot()
    }

    /// Take the single subscription. Returns `None` if it was already taken.
    pub async fn subscribe(&self) -> Option<Subscription> {
        let receiver = self.receiver.lock().await.take()?;
        Some(Subscription {
            receiver,
            shared: self.shared.clone(),
        })
    }
}

#[async_trait]
impl Publisher for ChannelTransport {
    async fn publish(&self, data: Vec<u8>, attributes: HashMap<String, String>) -> Result<String> {
        let id = format!("msg-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.shared
            .sender
            .send(Envelope {
                id: id.clone(),
                data,
                attributes,
                delivery_attempt: 1,
            })
            .map_err(|_| SchedulerError::Store("notification channel closed".to_string()))?;
        self.shared.counters.published.fetch_add(1, Ordering::Relaxed);
        debug!(message_id = %id, "published");
        Ok(id)
    }
}

struct ChannelAck {
    envelope: Envelope,
    shared: Arc<Shared>,
}

#[async_trait]
impl AckHandle for ChannelAck {
    async fn ack(self: Box<Self>) {
        self.shared.counters.acked.fetch_add(1, Ordering::Relaxed);
    }

    async fn nack(self: Box<Self>) {
        let shared = self.shared;
        shared.counters.nacked.fetch_add(1, Ordering::Relaxed);

        let mut envelope = self.envelope;
        if envelope.delivery_attempt >= shared.max_deliveries {
            shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
            error!(
                message_id = %envelope.id,
                deliveries = envelope.delivery_attempt,
                "message dropped after repeated failures"
            );
            return;
        }

        envelope.delivery_attempt += 1;
        tokio::spawn(async move {
            tokio::time::sleep(shared.redelivery_delay).await;
            if shared.sender.send(envelope).is_err() {
                debug!("transport closed, redelivery skipped");
            }
        });
    }
}

/// Receiving end of a [`ChannelTransport`]
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<Envelope>,
    shared: Arc<Shared>,
}

impl Subscription {
    /// Wait for the next message
    pub async fn next(&mut self) -> Option<Message> {
        let envelope = self.receiver.recv().await?;
        self.shared.counters.delivered.fetch_add(1, Ordering::Relaxed);
        let message = Message::new(envelope.id.clone(), envelope.data.clone())
            .with_attributes(envelope.attributes.clone())
            .with_delivery_attempt(envelope.delivery_attempt);
        Some(message.with_handle(Box::new(ChannelAck {
            envelope,
            shared: self.shared.clone(),
        })))
    }

    /// Feed messages to `handler`, at most `concurrency` at a time, until
    /// `shutdown` is cancelled. In-flight messages finish before returning.
    pub async fn run(
        mut self,
        handler: Arc<CompletionHandler>,
        concurrency: usize,
        shutdown: CancellationToken,
    ) {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut in_flight = JoinSet::new();
        info!(concurrency, "completion subscriber started");

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = self.next() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let handler = handler.clone();
            in_flight.spawn(async move {
                // Errors were already logged and nacked by the handler
                let _ = handler.handle(message).await;
                drop(permit);
            });

            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    warn!(error = %e, "completion task panicked");
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "completion task panicked");
            }
        }
        info!("completion subscriber stopped");
    }
}
