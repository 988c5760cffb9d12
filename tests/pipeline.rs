use std::sync::Arc;
use std::time::Duration;

use opentelemetry::trace::{
    SpanContext, SpanId, SpanKind, TraceContextExt, TraceFlags, TraceId, TraceState,
};
use opentelemetry::{Context, Value};
use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider, SpanData};
use opentelemetry_semantic_conventions::attribute::MESSAGING_MESSAGE_ID;
use tokio::sync::broadcast;
use trail_queue::broker::{AckMode, Broker, MemoryBroker, Publication};
use trail_queue::consumer::{self, Consumer, ConsumerOptions, ConsumerReport, PROCESS_SPAN};
use trail_queue::headers::HeaderValue;
use trail_queue::message::{WorkItem, CONTENT_TYPE};
use trail_queue::producer::{Producer, ProducerOptions, PUBLISH_SPAN};
use trail_queue::telemetry::attribute;
use trail_queue::Telemetry;

const QUEUE: &str = "work";
const WORK_UNIT: Duration = Duration::from_millis(10);

fn telemetry() -> (Arc<Telemetry>, InMemorySpanExporter) {
    let exporter = InMemorySpanExporter::default();
    let provider = SdkTracerProvider::builder()
        .with_simple_exporter(exporter.clone())
        .build();

    (Arc::new(Telemetry::new(provider)), exporter)
}

fn producer(broker: &MemoryBroker, telemetry: &Arc<Telemetry>, limit: u64) -> Producer<MemoryBroker> {
    Producer::new(
        broker.clone(),
        Arc::clone(telemetry),
        ProducerOptions {
            queue: String::from(QUEUE),
            wait_time: 3..=3,
            interval: Duration::ZERO,
            limit: Some(limit),
        },
    )
}

async fn produce(broker: &MemoryBroker, telemetry: &Arc<Telemetry>, limit: u64) {
    let (_tx, rx) = broadcast::channel(1);
    let report = producer(broker, telemetry, limit).run(rx).await.unwrap();
    assert_eq!(report.published, limit);
}

/// Runs `workers` consumers until `expected` messages were handled, then
/// shuts them down.
async fn consume(
    broker: &MemoryBroker,
    telemetry: &Arc<Telemetry>,
    exporter: &InMemorySpanExporter,
    workers: usize,
    ack_mode: AckMode,
    expected: usize,
) -> ConsumerReport {
    let consumers = (0..workers)
        .map(|_| {
            Consumer::new(
                broker.clone(),
                Arc::clone(telemetry),
                ConsumerOptions {
                    queue: String::from(QUEUE),
                    ack_mode,
                    work_unit: WORK_UNIT,
                },
            )
        })
        .collect();

    let (shutdown, _) = broadcast::channel(1);
    let signal = shutdown.clone();
    let task = tokio::spawn(async move { consumer::run_workers(consumers, &signal).await });

    tokio::time::timeout(Duration::from_secs(10), async {
        while spans_named(exporter, PROCESS_SPAN).len() < expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("consumers did not handle every message in time");

    shutdown.send(()).unwrap();
    task.await.unwrap().unwrap()
}

fn spans_named(exporter: &InMemorySpanExporter, name: &str) -> Vec<SpanData> {
    exporter
        .get_finished_spans()
        .unwrap()
        .into_iter()
        .filter(|span| span.name == name)
        .collect()
}

fn attribute<'a>(span: &'a SpanData, key: &str) -> Option<&'a Value> {
    span.attributes
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| &kv.value)
}

#[tokio::test]
async fn message_arrives_intact_and_work_takes_its_wait_time() {
    let (telemetry, exporter) = telemetry();
    let broker = MemoryBroker::new();

    produce(&broker, &telemetry, 1).await;
    let report = consume(&broker, &telemetry, &exporter, 1, AckMode::OnReceipt, 1).await;
    assert_eq!(report, ConsumerReport { processed: 1, rejected: 0 });

    let spans = spans_named(&exporter, PROCESS_SPAN);
    let span = &spans[0];
    assert_eq!(span.span_kind, SpanKind::Consumer);
    assert_eq!(attribute(span, MESSAGING_MESSAGE_ID), Some(&Value::from("1")));
    assert_eq!(attribute(span, attribute::WORK_CONTENT), Some(&Value::from("Message #1")));
    assert_eq!(attribute(span, attribute::WORK_WAIT_TIME), Some(&Value::I64(3)));

    let elapsed = span.end_time.duration_since(span.start_time).unwrap();
    assert!(elapsed >= WORK_UNIT * 3, "{elapsed:?}");
}

#[tokio::test]
async fn consumer_span_continues_the_producer_trace() {
    let (telemetry, exporter) = telemetry();
    let broker = MemoryBroker::new();

    produce(&broker, &telemetry, 1).await;
    consume(&broker, &telemetry, &exporter, 1, AckMode::OnReceipt, 1).await;

    let published = &spans_named(&exporter, PUBLISH_SPAN)[0];
    let processed = &spans_named(&exporter, PROCESS_SPAN)[0];
    assert_eq!(published.span_kind, SpanKind::Producer);
    assert_eq!(
        processed.span_context.trace_id(),
        published.span_context.trace_id()
    );
    assert_eq!(processed.parent_span_id, published.span_context.span_id());
}

#[tokio::test]
async fn non_string_headers_do_not_break_propagation() {
    let (telemetry, exporter) = telemetry();
    let broker = MemoryBroker::new();
    broker.declare_queue(QUEUE).await.unwrap();

    let parent = SpanContext::new(
        TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
        SpanId::from_hex("00f067aa0ba902b7").unwrap(),
        TraceFlags::SAMPLED,
        true,
        TraceState::default(),
    );
    let cx = Context::new().with_remote_span_context(parent.clone());
    let mut headers = telemetry.inject(&cx).into_headers();
    headers.insert(String::from("x-retry-count"), HeaderValue::Int(2));
    headers.insert(String::from("x-flag"), HeaderValue::Bool(true));

    broker
        .publish(Publication {
            queue: String::from(QUEUE),
            body: WorkItem::new("7", "Message #7", 1).to_json().unwrap(),
            headers,
            content_type: String::from(CONTENT_TYPE),
        })
        .await
        .unwrap();

    let report = consume(&broker, &telemetry, &exporter, 1, AckMode::OnReceipt, 1).await;
    assert_eq!(report.processed, 1);

    let span = &spans_named(&exporter, PROCESS_SPAN)[0];
    assert_eq!(span.span_context.trace_id(), parent.trace_id());
    assert_eq!(span.parent_span_id, parent.span_id());
}

#[tokio::test]
async fn malformed_message_is_rejected_and_the_next_one_processed() {
    let (telemetry, exporter) = telemetry();
    let broker = MemoryBroker::new();
    broker.declare_queue(QUEUE).await.unwrap();

    broker
        .publish(Publication {
            queue: String::from(QUEUE),
            body: b"not json".to_vec(),
            headers: Default::default(),
            content_type: String::from(CONTENT_TYPE),
        })
        .await
        .unwrap();
    produce(&broker, &telemetry, 1).await;

    let report = consume(&broker, &telemetry, &exporter, 1, AckMode::AfterProcessing, 2).await;
    assert_eq!(report, ConsumerReport { processed: 1, rejected: 1 });
    assert_eq!((broker.acked(), broker.rejected()), (1, 1));
}

#[tokio::test]
async fn every_message_is_processed_exactly_once_across_workers() {
    let (telemetry, exporter) = telemetry();
    let broker = MemoryBroker::new();

    produce(&broker, &telemetry, 6).await;
    let report = consume(&broker, &telemetry, &exporter, 3, AckMode::OnReceipt, 6).await;
    assert_eq!(report.processed, 6);

    let mut ids: Vec<String> = spans_named(&exporter, PROCESS_SPAN)
        .iter()
        .filter_map(|span| attribute(span, MESSAGING_MESSAGE_ID))
        .map(|value| value.as_str().into_owned())
        .collect();
    ids.sort_by_key(|id| id.parse::<u64>().unwrap());
    assert_eq!(ids, ["1", "2", "3", "4", "5", "6"]);
}
