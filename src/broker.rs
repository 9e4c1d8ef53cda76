// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstraction
//!
//! `Broker` is the set of AMQP primitives the façade needs: declare, bind,
//! publish, consume and close. `AmqpBroker` implements it over one `lapin`
//! connection and channel.

use crate::{
    channel::new_amqp_channel,
    configs::RabbitMQConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::Message,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    message::Delivery,
    options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection,
};
#[cfg(test)]
use mockall::automock;
use std::{collections::BTreeMap, fmt::Display, future::Future};
use tracing::{debug, error};

/// AMQP reply code for a normal shutdown.
pub const REPLY_SUCCESS: u16 = 200;

/// Deliveries of one consumer. Ends when the channel or connection closes.
pub type DeliveryStream = BoxStream<'static, Result<Message, AmqpError>>;

/// The AMQP operations a façade performs on its connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declares the exchange. Fails when it exists with other flags.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares the queue and returns its name, which the broker picks when
    /// `def` has an empty one.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    /// Binds a queue to an exchange under the binding's routing key.
    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Fire-and-forget publish: not mandatory, not immediate, no confirms.
    async fn publish(&self, exchange: &str, key: &str, msg: &Message) -> Result<(), AmqpError>;

    /// Opens an auto-acknowledged consumer on `queue`.
    async fn consume(&self, queue: &str, tag: &str) -> Result<DeliveryStream, AmqpError>;

    /// Closes the channel, then the connection. The connection is closed
    /// even when closing the channel fails.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// `Broker` over one lapin connection and the single channel opened on it.
pub struct AmqpBroker {
    conn: Connection,
    channel: Channel,
}

impl AmqpBroker {
    /// Connects to RabbitMQ and opens the channel.
    ///
    /// # Parameters
    /// * `cfg` - RabbitMQ connection settings, including connect retries
    /// * `connection_name` - Name shown for the connection in the broker
    ///
    /// # Returns
    /// The connected broker, or `ConnectionError` / `ChannelError`
    pub async fn connect(
        cfg: &RabbitMQConfigs,
        connection_name: &str,
    ) -> Result<AmqpBroker, AmqpError> {
        let (conn, channel) = new_amqp_channel(cfg, connection_name).await?;

        Ok(AmqpBroker { conn, channel })
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Ok(queue) => {
                debug!("queue: {} was declared", queue.name());
                Ok(queue.name().to_string())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");

                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn publish(&self, exchange: &str, key: &str, msg: &Message) -> Result<(), AmqpError> {
        let mut props = BasicProperties::default()
            .with_content_type(ShortString::from(msg.content_type.clone()))
            .with_headers(header_table(&msg.headers));

        if let Some(id) = &msg.message_id {
            props = props.with_message_id(ShortString::from(id.clone()));
        }

        match self
            .channel
            .basic_publish(
                exchange,
                key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &msg.payload,
                props,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn consume(&self, queue: &str, tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: true,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError)
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(delivery_message(&delivery)),
                Err(err) => {
                    error!(error = err.to_string(), "errors consume msg");
                    Err(AmqpError::ConsumerError(err.to_string()))
                }
            })
            .boxed())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        // The broker closes the channel on its own after a failed declare.
        let channel = self
            .channel
            .status()
            .connected()
            .then(|| self.channel.close(REPLY_SUCCESS, "OK"));
        let conn = self
            .conn
            .status()
            .connected()
            .then(|| self.conn.close(REPLY_SUCCESS, "OK"));

        close_in_order(channel, conn).await
    }
}

/// Awaits the channel close, then the connection close, skipping the ones
/// already closed. Returns the first failure.
async fn close_in_order<C, K, E>(channel: Option<C>, conn: Option<K>) -> Result<(), AmqpError>
where
    C: Future<Output = Result<(), E>>,
    K: Future<Output = Result<(), E>>,
    E: Display,
{
    let mut result = Ok(());

    match channel {
        Some(close) => {
            if let Err(err) = close.await {
                error!(error = err.to_string(), "error to close the channel");
                result = Err(AmqpError::CloseError);
            }
        }
        None => debug!("amqp channel was already closed"),
    }

    match conn {
        Some(close) => {
            if let Err(err) = close.await {
                error!(error = err.to_string(), "error to close the connection");
                result = result.and(Err(AmqpError::CloseError));
            }
        }
        None => debug!("amqp connection was already closed"),
    }

    if result.is_ok() {
        debug!("amqp connection closed");
    }
    result
}

fn header_table(headers: &BTreeMap<String, String>) -> FieldTable {
    let btree = headers
        .iter()
        .map(|(key, value)| {
            (
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            )
        })
        .collect::<BTreeMap<ShortString, AMQPValue>>();

    FieldTable::from(btree)
}

fn delivery_message(delivery: &Delivery) -> Message {
    to_message(
        &delivery.exchange,
        &delivery.routing_key,
        &delivery.properties,
        &delivery.data,
    )
}

/// Builds a `Message` out of the parts of a delivery. Only string headers are
/// kept.
fn to_message(
    exchange: &ShortString,
    routing_key: &ShortString,
    props: &BasicProperties,
    data: &[u8],
) -> Message {
    let headers = props
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| match value {
                    AMQPValue::LongString(v) => Some((
                        key.to_string(),
                        String::from_utf8_lossy(v.as_bytes()).into_owned(),
                    )),
                    AMQPValue::ShortString(v) => Some((key.to_string(), v.to_string())),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    Message {
        payload: data.to_vec(),
        content_type: props
            .content_type()
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_default(),
        exchange: exchange.to_string(),
        routing_key: routing_key.to_string(),
        message_id: props.message_id().as_ref().map(|v| v.to_string()),
        headers,
    }
}
