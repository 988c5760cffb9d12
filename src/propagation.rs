//! Moves trace context into and out of message metadata.

use crate::headers::{HeaderValue, Headers};

/// String-only view of message metadata, keyed by lowercase field name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Carrier(std::collections::HashMap<String, String>);

impl Carrier {
    /// Keeps the string-valued entries of `headers` and drops everything else.
    pub fn from_headers(headers: &Headers) -> Self {
        let fields = headers
            .iter()
            .filter_map(|(key, value)| {
                value
                    .as_str()
                    .map(|value| (key.to_ascii_lowercase(), value.to_owned()))
            })
            .collect();

        Self(fields)
    }

    pub fn into_headers(self) -> Headers {
        self.0
            .into_iter()
            .map(|(key, value)| (key, HeaderValue::String(value)))
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_ascii_lowercase()).map(String::as_str)
    }
}

impl opentelemetry::propagation::Injector for Carrier {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_ascii_lowercase(), value);
    }
}

impl opentelemetry::propagation::Extractor for Carrier {
    fn get(&self, key: &str) -> Option<&str> {
        Carrier::get(self, key)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

/// Snapshots `cx` into a fresh carrier. A context without an active span
/// yields a carrier that extracts to no parent.
pub fn inject(
    propagator: &dyn opentelemetry::propagation::TextMapPropagator,
    cx: &opentelemetry::Context,
) -> Carrier {
    let mut carrier = Carrier::default();
    propagator.inject_context(cx, &mut carrier);
    carrier
}

/// Never fails: missing, malformed or non-string fields yield a context whose
/// span context is invalid.
pub fn extract(
    propagator: &dyn opentelemetry::propagation::TextMapPropagator,
    headers: &Headers,
) -> opentelemetry::Context {
    let carrier = Carrier::from_headers(headers);
    propagator.extract_with_context(&opentelemetry::Context::new(), &carrier)
}
