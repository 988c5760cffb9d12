pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod headers;
pub mod message;
pub mod producer;
pub mod propagation;
pub mod shutdown;
pub mod telemetry;

#[cfg(feature = "amqp")]
pub mod amqp;

#[cfg(feature = "init")]
mod init;
#[cfg(feature = "init")]
pub use init::init;

pub use telemetry::Telemetry;
