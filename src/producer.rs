use std::sync::Arc;
use std::time::Duration;

use crate::broker::{Broker, Publication};
use crate::config::Settings;
use crate::error::{BrokerError, PublishError};
use crate::message::{WorkItem, CONTENT_TYPE};
use crate::telemetry::{attribute, Telemetry};

pub const PUBLISH_SPAN: &str = "PublishMessage";

#[derive(Clone, Debug)]
pub struct ProducerOptions {
    pub queue: String,
    pub wait_time: std::ops::RangeInclusive<u32>,
    pub interval: Duration,
    /// Stop after this many messages, published or failed.
    pub limit: Option<u64>,
}

impl From<&Settings> for ProducerOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            queue: settings.queue_name.clone(),
            wait_time: settings.min_wait_time..=settings.max_wait_time,
            interval: settings.publish_interval(),
            limit: settings.message_limit,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProducerReport {
    pub published: u64,
    pub failed: u64,
}

impl ProducerReport {
    fn attempted(&self) -> u64 {
        self.published + self.failed
    }
}

pub struct Producer<B> {
    broker: B,
    telemetry: Arc<Telemetry>,
    tracer: opentelemetry_sdk::trace::SdkTracer,
    options: ProducerOptions,
    next_id: u64,
}

impl<B: Broker> Producer<B> {
    pub fn new(broker: B, telemetry: Arc<Telemetry>, options: ProducerOptions) -> Self {
        let tracer = telemetry.tracer(env!("CARGO_PKG_NAME"));

        Self {
            broker,
            telemetry,
            tracer,
            options,
            next_id: 1,
        }
    }

    /// Ids count up from 1 and are never reused within a run, even when a
    /// publish fails.
    pub fn next_item(&mut self, rng: &mut impl rand::Rng) -> WorkItem {
        let id = self.next_id;
        self.next_id += 1;

        let wait_time = rng.random_range(self.options.wait_time.clone());
        WorkItem::new(id.to_string(), format!("Message #{id}"), wait_time)
    }

    /// Publishes `item` under a fresh `PublishMessage` span whose context
    /// travels in the message headers.
    ///
    /// Failures are logged and recorded on the span; the message is dropped.
    pub async fn publish(&self, item: &WorkItem) -> Result<(), PublishError> {
        use opentelemetry::trace::{TraceContextExt, Tracer};
        use opentelemetry::KeyValue;
        use opentelemetry_semantic_conventions::attribute as semconv;

        let body = item.to_json().inspect_err(|err| {
            log::error!(message_id:% = item.id, error:% = err; "failed to serialize message");
        })?;

        let parent = opentelemetry::Context::current();
        let span = self
            .tracer
            .span_builder(PUBLISH_SPAN)
            .with_kind(opentelemetry::trace::SpanKind::Producer)
            .start_with_context(&self.tracer, &parent);
        let cx = parent.with_span(span);

        let headers = self.telemetry.inject(&cx).into_headers();
        let body_size = body.len() as i64;

        let result = self
            .broker
            .publish(Publication {
                queue: self.options.queue.clone(),
                body,
                headers,
                content_type: String::from(CONTENT_TYPE),
            })
            .await;

        let span = cx.span();
        match result {
            Ok(()) => {
                span.set_attributes([
                    KeyValue::new(semconv::MESSAGING_SYSTEM, crate::telemetry::MESSAGING_SYSTEM),
                    KeyValue::new(semconv::MESSAGING_OPERATION_TYPE, "publish"),
                    KeyValue::new(semconv::MESSAGING_DESTINATION_NAME, self.options.queue.clone()),
                    KeyValue::new(semconv::MESSAGING_MESSAGE_ID, item.id.clone()),
                    KeyValue::new(semconv::MESSAGING_MESSAGE_BODY_SIZE, body_size),
                    KeyValue::new(attribute::WORK_WAIT_TIME, i64::from(item.wait_time)),
                ]);
                span.end();

                log::info!(
                    queue:% = self.options.queue,
                    message_id:% = item.id,
                    wait_time = item.wait_time;
                    "sent message"
                );
                Ok(())
            }
            Err(err) => {
                span.record_error(&err);
                span.set_status(opentelemetry::trace::Status::error(err.to_string()));
                span.end();

                log::error!(
                    queue:% = self.options.queue,
                    message_id:% = item.id,
                    error:% = err;
                    "failed to publish message"
                );
                Err(err.into())
            }
        }
    }

    /// Declares the queue, then publishes until the message limit is reached
    /// or `shutdown` fires. Only a failed declaration is returned as an error.
    pub async fn run(
        self,
        shutdown: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<ProducerReport, BrokerError> {
        use rand::SeedableRng;

        self.run_with_rng(rand::rngs::StdRng::from_os_rng(), shutdown)
            .await
    }

    pub async fn run_with_rng(
        mut self,
        mut rng: impl rand::Rng + Send,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<ProducerReport, BrokerError> {
        self.broker.declare_queue(&self.options.queue).await?;
        log::info!(queue:% = self.options.queue; "publishing messages");

        let mut report = ProducerReport::default();
        while !self.limit_reached(&report) {
            let item = self.next_item(&mut rng);
            match self.publish(&item).await {
                Ok(()) => report.published += 1,
                Err(_) => report.failed += 1,
            }

            if self.limit_reached(&report) {
                break;
            }

            tokio::select! {
                _ = crate::shutdown::requested(&mut shutdown) => {
                    log::info!("shutdown requested, producer stopping");
                    break;
                }
                _ = tokio::time::sleep(self.options.interval) => {}
            }
        }

        log::info!(published = report.published, failed = report.failed; "producer stopped");
        Ok(report)
    }

    fn limit_reached(&self, report: &ProducerReport) -> bool {
        self.options
            .limit
            .is_some_and(|limit| report.attempted() >= limit)
    }
}
