//! The work item exchanged through the queue.

use crate::error::EnvelopeError;

/// Content type attached to every publication carrying a [`WorkItem`].
pub const CONTENT_TYPE: &str = "application/json";

/// Upper bound, in seconds, of [`WorkItem::wait_time`].
pub const MAX_WAIT_TIME: u32 = 20;

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub content: String,
    /// Simulated processing duration, in seconds.
    pub wait_time: u32,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, content: impl Into<String>, wait_time: u32) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            wait_time,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Encode)
    }

    /// Fails when `bytes` is not JSON, a field is missing, `wait_time` is not
    /// a non-negative integer, or `wait_time` exceeds [`MAX_WAIT_TIME`].
    pub fn from_json(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let item: Self = serde_json::from_slice(bytes).map_err(EnvelopeError::Decode)?;

        if item.wait_time > MAX_WAIT_TIME {
            return Err(EnvelopeError::WaitTimeOutOfRange(item.wait_time));
        }

        Ok(item)
    }
}
