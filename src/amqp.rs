//! RabbitMQ transport over AMQP 0-9-1.

use crate::broker::{AckMode, Delivery, Publication, Subscription};
use crate::error::BrokerError;
use crate::headers::{HeaderValue, Headers};

/// One connection with one channel in publisher-confirm mode, owned by a
/// single loop.
pub struct AmqpBroker {
    connection: lapin::Connection,
    channel: lapin::Channel,
}

impl AmqpBroker {
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let connection =
            lapin::Connection::connect(url, lapin::ConnectionProperties::default())
                .await
                .map_err(|err| BrokerError::Connect(err.into()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|err| BrokerError::Channel(err.into()))?;

        channel
            .confirm_select(lapin::options::ConfirmSelectOptions::default())
            .await
            .map_err(|err| BrokerError::Channel(err.into()))?;

        log::info!("connected to broker");
        Ok(Self {
            connection,
            channel,
        })
    }

    pub async fn close(&self) {
        if let Err(err) = self.channel.close(200, "shutting down").await {
            log::warn!(error:% = err; "could not close channel");
        }
        if let Err(err) = self.connection.close(200, "shutting down").await {
            log::warn!(error:% = err; "could not close connection");
        }
    }
}

#[async_trait::async_trait]
impl crate::broker::Broker for AmqpBroker {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                queue,
                lapin::options::QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                lapin::types::FieldTable::default(),
            )
            .await
            .map_err(|err| BrokerError::Declare {
                queue: queue.to_owned(),
                source: err.into(),
            })?;

        log::debug!(queue:% = queue; "queue declared");
        Ok(())
    }

    async fn publish(&self, publication: Publication) -> Result<(), BrokerError> {
        let properties = lapin::BasicProperties::default()
            .with_content_type(publication.content_type.as_str().into())
            .with_headers(table_from_headers(&publication.headers));

        let publish_error = |err: lapin::Error| BrokerError::Publish {
            queue: publication.queue.clone(),
            source: err.into(),
        };

        let confirmation = self
            .channel
            .basic_publish(
                "",
                &publication.queue,
                lapin::options::BasicPublishOptions::default(),
                &publication.body,
                properties,
            )
            .await
            .map_err(publish_error)?
            .await
            .map_err(publish_error)?;

        confirmed(&publication.queue, confirmation)
    }

    async fn subscribe(&self, queue: &str, ack: AckMode) -> Result<Subscription, BrokerError> {
        use futures::StreamExt;

        let consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                lapin::options::BasicConsumeOptions {
                    no_ack: ack == AckMode::OnReceipt,
                    ..Default::default()
                },
                lapin::types::FieldTable::default(),
            )
            .await
            .map_err(|err| BrokerError::Subscribe {
                queue: queue.to_owned(),
                source: err.into(),
            })?;

        let deliveries = consumer.map(move |delivery| {
            delivery
                .map(|delivery| into_delivery(delivery, ack))
                .map_err(|err| BrokerError::Receive(err.into()))
        });

        Ok(deliveries.boxed())
    }
}

fn confirmed(
    queue: &str,
    confirmation: lapin::publisher_confirm::Confirmation,
) -> Result<(), BrokerError> {
    if confirmation.is_nack() {
        return Err(BrokerError::Publish {
            queue: queue.to_owned(),
            source: "broker refused the message".into(),
        });
    }

    Ok(())
}

fn into_delivery(delivery: lapin::message::Delivery, ack: AckMode) -> Delivery {
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(headers_from_table)
        .unwrap_or_default();
    let content_type = delivery
        .properties
        .content_type()
        .as_ref()
        .map(|content_type| content_type.to_string());

    let mut out = Delivery::new(delivery.data, headers);
    if let Some(content_type) = content_type {
        out = out.with_content_type(content_type);
    }
    if ack == AckMode::AfterProcessing {
        out = out.with_settle(Box::new(AmqpSettle(delivery.acker)));
    }
    out
}

struct AmqpSettle(lapin::acker::Acker);

#[async_trait::async_trait]
impl crate::broker::Settle for AmqpSettle {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0
            .ack(lapin::options::BasicAckOptions::default())
            .await
            .map_err(|err| BrokerError::Settle(err.into()))
    }

    async fn reject(&self) -> Result<(), BrokerError> {
        self.0
            .reject(lapin::options::BasicRejectOptions { requeue: false })
            .await
            .map_err(|err| BrokerError::Settle(err.into()))
    }
}

pub fn headers_from_table(table: &lapin::types::FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.to_string(), HeaderValue::from(value)))
        .collect()
}

pub fn table_from_headers(headers: &Headers) -> lapin::types::FieldTable {
    let mut table = lapin::types::FieldTable::default();
    for (key, value) in headers {
        table.insert(key.as_str().into(), lapin::types::AMQPValue::from(value));
    }
    table
}

impl From<&lapin::types::AMQPValue> for HeaderValue {
    fn from(value: &lapin::types::AMQPValue) -> Self {
        use lapin::types::AMQPValue;

        match value {
            AMQPValue::ShortString(s) => HeaderValue::String(s.to_string()),
            AMQPValue::LongString(s) => match std::str::from_utf8(s.as_bytes()) {
                Ok(s) => HeaderValue::String(s.to_owned()),
                Err(_) => HeaderValue::Bytes(s.as_bytes().to_vec()),
            },
            AMQPValue::Boolean(b) => HeaderValue::Bool(*b),
            AMQPValue::ShortShortInt(n) => HeaderValue::Int(i64::from(*n)),
            AMQPValue::ShortInt(n) => HeaderValue::Int(i64::from(*n)),
            AMQPValue::LongInt(n) => HeaderValue::Int(i64::from(*n)),
            AMQPValue::LongLongInt(n) => HeaderValue::Int(*n),
            AMQPValue::ShortShortUInt(n) => HeaderValue::UInt(u64::from(*n)),
            AMQPValue::ShortUInt(n) => HeaderValue::UInt(u64::from(*n)),
            AMQPValue::LongUInt(n) => HeaderValue::UInt(u64::from(*n)),
            AMQPValue::Float(f) => HeaderValue::Float(f64::from(*f)),
            AMQPValue::Double(f) => HeaderValue::Float(*f),
            AMQPValue::DecimalValue(d) => {
                HeaderValue::Float(f64::from(d.value) / 10f64.powi(i32::from(d.scale)))
            }
            AMQPValue::Timestamp(t) => HeaderValue::Timestamp(*t),
            AMQPValue::ByteArray(b) => HeaderValue::Bytes(b.as_slice().to_vec()),
            AMQPValue::FieldArray(a) => {
                HeaderValue::Array(a.as_slice().iter().map(HeaderValue::from).collect())
            }
            AMQPValue::FieldTable(t) => HeaderValue::Table(headers_from_table(t)),
            AMQPValue::Void => HeaderValue::Void,
        }
    }
}

impl From<&HeaderValue> for lapin::types::AMQPValue {
    fn from(value: &HeaderValue) -> Self {
        use lapin::types::AMQPValue;

        match value {
            HeaderValue::String(s) => AMQPValue::LongString(s.as_str().into()),
            HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
            HeaderValue::Int(n) => AMQPValue::LongLongInt(*n),
            // AMQP 0-9-1 tables have no unsigned 64-bit type.
            HeaderValue::UInt(n) => match i64::try_from(*n) {
                Ok(n) => AMQPValue::LongLongInt(n),
                Err(_) => AMQPValue::LongString(n.to_string().into()),
            },
            HeaderValue::Float(f) => AMQPValue::Double(*f),
            HeaderValue::Timestamp(t) => AMQPValue::Timestamp(*t),
            HeaderValue::Bytes(b) => AMQPValue::ByteArray(b.clone().into()),
            HeaderValue::Array(a) => {
                let values: Vec<AMQPValue> = a.iter().map(AMQPValue::from).collect();
                AMQPValue::FieldArray(values.into())
            }
            HeaderValue::Table(t) => AMQPValue::FieldTable(table_from_headers(t)),
            HeaderValue::Void => AMQPValue::Void,
        }
    }
}
