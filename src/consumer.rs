use std::sync::Arc;
use std::time::Duration;

use crate::broker::{AckMode, Broker, Delivery};
use crate::config::Settings;
use crate::error::{BrokerError, EnvelopeError};
use crate::message::WorkItem;
use crate::telemetry::{attribute, Telemetry};

pub const PROCESS_SPAN: &str = "ProcessMessage";

#[derive(Clone, Debug)]
pub struct ConsumerOptions {
    pub queue: String,
    pub ack_mode: AckMode,
    /// Time spent per unit of [`WorkItem::wait_time`].
    pub work_unit: Duration,
}

impl From<&Settings> for ConsumerOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            queue: settings.queue_name.clone(),
            ack_mode: settings.ack_mode,
            work_unit: settings.work_unit(),
        }
    }
}

#[derive(Debug)]
pub enum Outcome {
    Processed(WorkItem),
    Rejected(EnvelopeError),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    pub processed: u64,
    pub rejected: u64,
}

impl ConsumerReport {
    fn merge(self, other: Self) -> Self {
        Self {
            processed: self.processed + other.processed,
            rejected: self.rejected + other.rejected,
        }
    }
}

pub struct Consumer<B> {
    broker: B,
    telemetry: Arc<Telemetry>,
    tracer: opentelemetry_sdk::trace::SdkTracer,
    options: ConsumerOptions,
}

impl<B: Broker> Consumer<B> {
    pub fn new(broker: B, telemetry: Arc<Telemetry>, options: ConsumerOptions) -> Self {
        let tracer = telemetry.tracer(env!("CARGO_PKG_NAME"));

        Self {
            broker,
            telemetry,
            tracer,
            options,
        }
    }

    /// Processes deliveries one at a time until the subscription closes or
    /// `shutdown` fires. A message in progress is finished before stopping.
    pub async fn run(
        &self,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<ConsumerReport, BrokerError> {
        use futures::StreamExt;

        let queue = &self.options.queue;

        self.broker.declare_queue(queue).await?;
        let mut deliveries = self.broker.subscribe(queue, self.options.ack_mode).await?;
        log::info!(queue:% = queue; "listening for messages");

        let mut report = ConsumerReport::default();
        loop {
            let delivery = tokio::select! {
                _ = crate::shutdown::requested(&mut shutdown) => {
                    log::info!("shutdown requested, consumer stopping");
                    break;
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(err)) => {
                        log::error!(queue:% = queue, error:% = err; "subscription failed");
                        return Err(err);
                    }
                    None => {
                        log::info!(queue:% = queue; "subscription closed");
                        break;
                    }
                },
            };

            match self.handle(delivery).await {
                Outcome::Processed(_) => report.processed += 1,
                Outcome::Rejected(_) => report.rejected += 1,
            }
        }

        log::info!(processed = report.processed, rejected = report.rejected; "consumer stopped");
        Ok(report)
    }

    /// Runs one delivery under a `ProcessMessage` span parented to the trace
    /// context found in its headers, or a new root when there is none.
    pub async fn handle(&self, mut delivery: Delivery) -> Outcome {
        use opentelemetry::trace::{Span, TraceContextExt, Tracer};
        use opentelemetry::KeyValue;
        use opentelemetry_semantic_conventions::attribute as semconv;

        let parent = self.telemetry.extract(&delivery.headers);
        let parent_span = parent.span().span_context().clone();
        if parent_span.is_valid() {
            log::debug!(trace_id:% = parent_span.trace_id(); "parent trace id found");
        } else {
            log::debug!("no parent trace id found");
        }

        let mut span = self
            .tracer
            .span_builder(PROCESS_SPAN)
            .with_kind(opentelemetry::trace::SpanKind::Consumer)
            .with_attributes([
                KeyValue::new(semconv::MESSAGING_SYSTEM, crate::telemetry::MESSAGING_SYSTEM),
                KeyValue::new(semconv::MESSAGING_OPERATION_TYPE, "process"),
                KeyValue::new(semconv::MESSAGING_DESTINATION_NAME, self.options.queue.clone()),
                KeyValue::new(semconv::MESSAGING_MESSAGE_BODY_SIZE, delivery.body.len() as i64),
            ])
            .start_with_context(&self.tracer, &parent);

        let item = match WorkItem::from_json(&delivery.body) {
            Ok(item) => item,
            Err(err) => {
                span.record_error(&err);
                span.set_status(opentelemetry::trace::Status::error(err.to_string()));
                span.end();

                log::warn!(queue:% = self.options.queue, error:% = err; "failed to decode message");
                if let Err(err) = delivery.reject().await {
                    log::error!(error:% = err; "failed to reject message");
                }
                return Outcome::Rejected(err);
            }
        };

        span.set_attributes([
            KeyValue::new(semconv::MESSAGING_MESSAGE_ID, item.id.clone()),
            KeyValue::new(attribute::WORK_CONTENT, item.content.clone()),
            KeyValue::new(attribute::WORK_WAIT_TIME, i64::from(item.wait_time)),
        ]);

        log::info!(
            message_id:% = item.id,
            wait_time = item.wait_time;
            "processing message: {}", item.content
        );
        tokio::time::sleep(self.work_duration(item.wait_time)).await;
        span.end();

        if let Err(err) = delivery.ack().await {
            log::error!(message_id:% = item.id, error:% = err; "failed to acknowledge message");
        }

        Outcome::Processed(item)
    }

    fn work_duration(&self, wait_time: u32) -> Duration {
        self.options.work_unit.saturating_mul(wait_time)
    }
}

/// Runs each consumer on its own task and waits for all of them. Every
/// consumer should own its broker subscription; only telemetry is shared.
///
/// The first worker to fail stops the others through `shutdown`, and its
/// error is returned once they have finished.
pub async fn run_workers<B>(
    consumers: Vec<Consumer<B>>,
    shutdown: &tokio::sync::broadcast::Sender<()>,
) -> Result<ConsumerReport, BrokerError>
where
    B: Broker + 'static,
{
    use futures::StreamExt;

    let mut workers: futures::stream::FuturesUnordered<_> = consumers
        .into_iter()
        .map(|consumer| {
            let shutdown = shutdown.subscribe();
            tokio::spawn(async move { consumer.run(shutdown).await })
        })
        .collect();

    let mut report = ConsumerReport::default();
    let mut first_error = None;
    while let Some(joined) = workers.next().await {
        match joined {
            Ok(Ok(worker)) => report = report.merge(worker),
            Ok(Err(err)) => {
                if first_error.is_none() {
                    log::error!(error:% = err; "consumer worker failed, stopping the others");
                    let _ = shutdown.send(());
                    first_error = Some(err);
                }
            }
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => log::warn!(error:% = err; "consumer task cancelled"),
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(report),
    }
}
