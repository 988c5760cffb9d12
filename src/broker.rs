//! The queueing service as seen by the producer and consumer loops.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::stream::{BoxStream, StreamExt};
use tokio::sync::mpsc;

use crate::error::BrokerError;
use crate::headers::Headers;

/// When a consumer settles a delivery with the broker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckMode {
    /// The broker forgets the message as soon as it is handed out.
    #[default]
    OnReceipt,
    /// The consumer acknowledges after processing and rejects, without
    /// requeueing, what it cannot decode.
    AfterProcessing,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Publication {
    pub queue: String,
    pub body: Vec<u8>,
    pub headers: Headers,
    pub content_type: String,
}

#[async_trait::async_trait]
pub trait Settle: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;
    async fn reject(&self) -> Result<(), BrokerError>;
}

pub struct Delivery {
    pub body: Vec<u8>,
    pub headers: Headers,
    pub content_type: Option<String>,
    settle: Option<Box<dyn Settle>>,
}

impl Delivery {
    pub fn new(body: Vec<u8>, headers: Headers) -> Self {
        Self {
            body,
            headers,
            content_type: None,
            settle: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_settle(mut self, settle: Box<dyn Settle>) -> Self {
        self.settle = Some(settle);
        self
    }

    /// No-op for deliveries that were settled on receipt.
    pub async fn ack(&mut self) -> Result<(), BrokerError> {
        match self.settle.take() {
            Some(settle) => settle.ack().await,
            None => Ok(()),
        }
    }

    /// No-op for deliveries that were settled on receipt.
    pub async fn reject(&mut self) -> Result<(), BrokerError> {
        match self.settle.take() {
            Some(settle) => settle.reject().await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("body", &String::from_utf8_lossy(&self.body))
            .field("headers", &self.headers)
            .field("content_type", &self.content_type)
            .field("settled", &self.settle.is_none())
            .finish()
    }
}

pub type Subscription = BoxStream<'static, Result<Delivery, BrokerError>>;

#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    /// Idempotent for a queue that already exists with the same parameters.
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    async fn publish(&self, publication: Publication) -> Result<(), BrokerError>;

    /// The returned stream ends when the subscription is closed.
    async fn subscribe(&self, queue: &str, ack: AckMode) -> Result<Subscription, BrokerError>;
}

#[async_trait::async_trait]
impl<B: Broker + ?Sized> Broker for Arc<B> {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        (**self).declare_queue(queue).await
    }

    async fn publish(&self, publication: Publication) -> Result<(), BrokerError> {
        (**self).publish(publication).await
    }

    async fn subscribe(&self, queue: &str, ack: AckMode) -> Result<Subscription, BrokerError> {
        (**self).subscribe(queue, ack).await
    }
}

/// In-process broker with competing-consumer queues.
///
/// Publishing to a queue nobody declared drops the message, as the AMQP
/// default exchange does.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    queues: Mutex<HashMap<String, MemoryQueue>>,
    closed: AtomicBool,
    failing_publishes: AtomicUsize,
    acked: AtomicUsize,
    rejected: AtomicUsize,
}

#[derive(Clone)]
struct MemoryQueue {
    tx: mpsc::UnboundedSender<Stored>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Stored>>>,
}

struct Stored {
    body: Vec<u8>,
    headers: Headers,
    content_type: String,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` publishes fail with [`BrokerError::Publish`].
    pub fn fail_next_publishes(&self, count: usize) {
        self.inner.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Ends every subscription once its queue drains and refuses further
    /// operations.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.queues().clear();
    }

    pub fn acked(&self) -> usize {
        self.inner.acked.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> usize {
        self.inner.rejected.load(Ordering::SeqCst)
    }

    fn queues(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemoryQueue>> {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    fn take_publish_failure(&self) -> bool {
        self.inner
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;

        self.queues().entry(queue.to_owned()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            MemoryQueue {
                tx,
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
            }
        });

        Ok(())
    }

    async fn publish(&self, publication: Publication) -> Result<(), BrokerError> {
        self.ensure_open()?;

        if self.take_publish_failure() {
            return Err(BrokerError::Publish {
                queue: publication.queue,
                source: "publish refused".into(),
            });
        }

        let Some(queue) = self.queues().get(&publication.queue).cloned() else {
            log::debug!(queue:% = publication.queue; "dropping message for undeclared queue");
            return Ok(());
        };

        queue
            .tx
            .send(Stored {
                body: publication.body,
                headers: publication.headers,
                content_type: publication.content_type,
            })
            .map_err(|_| BrokerError::Closed)
    }

    async fn subscribe(&self, queue: &str, ack: AckMode) -> Result<Subscription, BrokerError> {
        self.ensure_open()?;

        let rx = match self.queues().get(queue) {
            Some(q) => Arc::clone(&q.rx),
            None => {
                return Err(BrokerError::Subscribe {
                    queue: queue.to_owned(),
                    source: "queue not found".into(),
                })
            }
        };
        let inner = Arc::clone(&self.inner);

        let stream = futures::stream::unfold(rx, move |rx| {
            let inner = Arc::clone(&inner);
            async move {
                let stored = rx.lock().await.recv().await?;

                let mut delivery =
                    Delivery::new(stored.body, stored.headers).with_content_type(stored.content_type);
                if ack == AckMode::AfterProcessing {
                    delivery = delivery.with_settle(Box::new(MemorySettle(inner)));
                }

                Some((Ok(delivery), rx))
            }
        });

        Ok(stream.boxed())
    }
}

struct MemorySettle(Arc<MemoryInner>);

#[async_trait::async_trait]
impl Settle for MemorySettle {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reject(&self) -> Result<(), BrokerError> {
        self.0.rejected.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::HeaderValue;

    fn publication(queue: &str, body: &str) -> Publication {
        Publication {
            queue: queue.to_owned(),
            body: body.as_bytes().to_vec(),
            headers: Headers::from([(String::from("k"), HeaderValue::from("v"))]),
            content_type: String::from("text/plain"),
        }
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let broker = MemoryBroker::new();
        broker.declare_queue("work").await.unwrap();
        broker.declare_queue("work").await.unwrap();

        broker.publish(publication("work", "a")).await.unwrap();
        broker.publish(publication("work", "b")).await.unwrap();

        let mut sub = broker.subscribe("work", AckMode::OnReceipt).await.unwrap();
        let first = sub.next().await.unwrap().unwrap();
        let second = sub.next().await.unwrap().unwrap();

        assert_eq!(first.body, b"a");
        assert_eq!(first.headers.get("k"), Some(&HeaderValue::from("v")));
        assert_eq!(first.content_type.as_deref(), Some("text/plain"));
        assert_eq!(second.body, b"b");
    }

    #[tokio::test]
    async fn competing_subscribers_split_messages() {
        let broker = MemoryBroker::new();
        broker.declare_queue("work").await.unwrap();
        broker.publish(publication("work", "a")).await.unwrap();
        broker.publish(publication("work", "b")).await.unwrap();

        let mut one = broker.subscribe("work", AckMode::OnReceipt).await.unwrap();
        let mut two = broker.subscribe("work", AckMode::OnReceipt).await.unwrap();

        let a = one.next().await.unwrap().unwrap();
        let b = two.next().await.unwrap().unwrap();
        assert_ne!(a.body, b.body);
    }

    #[tokio::test]
    async fn close_ends_subscriptions_and_refuses_publishes() {
        let broker = MemoryBroker::new();
        broker.declare_queue("work").await.unwrap();
        let mut sub = broker.subscribe("work", AckMode::OnReceipt).await.unwrap();

        broker.close();

        assert!(sub.next().await.is_none());
        assert!(matches!(
            broker.publish(publication("work", "a")).await,
            Err(BrokerError::Closed)
        ));
    }

    #[tokio::test]
    async fn injected_publish_failures_are_consumed() {
        let broker = MemoryBroker::new();
        broker.declare_queue("work").await.unwrap();
        broker.fail_next_publishes(1);

        assert!(matches!(
            broker.publish(publication("work", "a")).await,
            Err(BrokerError::Publish { .. })
        ));
        broker.publish(publication("work", "b")).await.unwrap();
    }

    #[tokio::test]
    async fn subscribing_to_unknown_queue_fails() {
        let broker = MemoryBroker::new();

        let err = broker.subscribe("missing", AckMode::OnReceipt).await.err();
        assert!(matches!(err, Some(BrokerError::Subscribe { .. })));
    }

    #[tokio::test]
    async fn settles_only_after_processing_deliveries() {
        let broker = MemoryBroker::new();
        broker.declare_queue("work").await.unwrap();
        broker.publish(publication("work", "a")).await.unwrap();
        broker.publish(publication("work", "b")).await.unwrap();

        let mut sub = broker.subscribe("work", AckMode::AfterProcessing).await.unwrap();
        sub.next().await.unwrap().unwrap().ack().await.unwrap();
        sub.next().await.unwrap().unwrap().reject().await.unwrap();

        assert_eq!(broker.acked(), 1);
        assert_eq!(broker.rejected(), 1);
    }
}
