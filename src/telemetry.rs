use std::time::Duration;

use crate::headers::Headers;
use crate::propagation::{self, Carrier};

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Span attribute keys with no semantic convention counterpart.
pub mod attribute {
    pub const WORK_CONTENT: &str = "work.content";
    pub const WORK_WAIT_TIME: &str = "work.wait_time";
}

/// Value of `messaging.system` on every span.
pub const MESSAGING_SYSTEM: &str = "rabbitmq";

/// Tracing pipeline shared by every loop of a process.
///
/// Owns the tracer provider and the propagation format. Nothing is installed
/// globally; loops receive the value they trace through.
pub struct Telemetry {
    provider: opentelemetry_sdk::trace::SdkTracerProvider,
    propagator: opentelemetry::propagation::TextMapCompositePropagator,
    shutdown_timeout: Duration,
}

impl Telemetry {
    pub fn new(provider: opentelemetry_sdk::trace::SdkTracerProvider) -> Self {
        Self {
            provider,
            propagator: propagator(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn tracer(
        &self,
        name: impl Into<std::borrow::Cow<'static, str>>,
    ) -> opentelemetry_sdk::trace::SdkTracer {
        use opentelemetry::trace::TracerProvider;

        self.provider.tracer(name)
    }

    pub fn inject(&self, cx: &opentelemetry::Context) -> Carrier {
        propagation::inject(&self.propagator, cx)
    }

    pub fn extract(&self, headers: &Headers) -> opentelemetry::Context {
        propagation::extract(&self.propagator, headers)
    }

    /// Exports buffered spans and stops the pipeline, waiting at most the
    /// configured shutdown timeout.
    pub fn shutdown(&self) -> Result<(), opentelemetry_sdk::error::OTelSdkError> {
        self.provider.shutdown_with_timeout(self.shutdown_timeout)
    }
}

/// W3C trace context followed by W3C baggage.
pub fn propagator() -> opentelemetry::propagation::TextMapCompositePropagator {
    opentelemetry::propagation::TextMapCompositePropagator::new(vec![
        Box::new(opentelemetry_sdk::propagation::TraceContextPropagator::new()),
        Box::new(opentelemetry_sdk::propagation::BaggagePropagator::new()),
    ])
}
