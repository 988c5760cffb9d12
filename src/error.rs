#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("wait_time {0} exceeds the maximum of {max}", max = crate::message::MAX_WAIT_TIME)]
    WaitTimeOutOfRange(u32),
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("could not connect to broker: {0}")]
    Connect(#[source] BoxError),

    #[error("could not open channel: {0}")]
    Channel(#[source] BoxError),

    #[error("could not declare queue {queue}: {source}")]
    Declare {
        queue: String,
        #[source]
        source: BoxError,
    },

    #[error("could not publish to queue {queue}: {source}")]
    Publish {
        queue: String,
        #[source]
        source: BoxError,
    },

    #[error("could not subscribe to queue {queue}: {source}")]
    Subscribe {
        queue: String,
        #[source]
        source: BoxError,
    },

    #[error("delivery failed: {0}")]
    Receive(#[source] BoxError),

    #[error("could not settle delivery: {0}")]
    Settle(#[source] BoxError),

    #[error("broker is closed")]
    Closed,
}

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}
