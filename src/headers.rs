//! Message metadata as delivered by a broker.
//!
//! Brokers attach dynamically typed values to messages. [`HeaderValue`] keeps
//! the type tag so that consumers of the metadata decide explicitly which
//! variants they accept.

use std::collections::BTreeMap;

pub type Headers = BTreeMap<String, HeaderValue>;

#[derive(Clone, Debug, PartialEq)]
pub enum HeaderValue {
    String(String),
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Timestamp(u64),
    Bytes(Vec<u8>),
    Array(Vec<HeaderValue>),
    Table(Headers),
    Void,
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}
