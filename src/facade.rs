// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Façade
//!
//! `TopologyFacade` owns one broker connection and channel and moves messages
//! across one of the four topologies described by its `TopologyDescriptor`.
//!
//! Lifecycle: `Connected → (Declared)* → Closed`. Constructing the façade
//! connects it; every successful declare (explicit, or implied by `publish`
//! and `consume`) moves it to `Declared`; `teardown` closes it for good.

use crate::{
    broker::{AmqpBroker, Broker},
    configs::Configs,
    errors::AmqpError,
    handler::{LogHandler, MessageHandler},
    message::Message,
    otel,
    subscription::Subscription,
    topology::TopologyDescriptor,
};
use opentelemetry::Context;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error};
use uuid::Uuid;

/// Lifecycle state of a `TopologyFacade`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacadeState {
    /// Connection and channel are open, nothing declared yet.
    Connected,
    /// The topology was declared at least once.
    Declared,
    /// Torn down. Every operation fails with `AmqpError::Closed`.
    Closed,
}

/// One broker connection bound to one topology.
///
/// Not meant to be shared between tasks: operations take `&mut self`. Open
/// one façade per producer or consumer instead.
pub struct TopologyFacade {
    topology: TopologyDescriptor,
    broker: Arc<dyn Broker>,
    state: FacadeState,
    shutdown: watch::Sender<bool>,
}

impl TopologyFacade {
    /// Opens a connection and a channel to the broker in `cfg`.
    ///
    /// # Parameters
    /// * `cfg` - Application and RabbitMQ configuration; the app name becomes
    ///   the connection name
    /// * `topology` - The topology this façade works with
    ///
    /// # Returns
    /// A connected façade, or `InvalidTopology` / `ConnectionError` /
    /// `ChannelError`
    pub async fn connect(
        cfg: &Configs,
        topology: TopologyDescriptor,
    ) -> Result<TopologyFacade, AmqpError> {
        topology.validate()?;
        let broker = AmqpBroker::connect(&cfg.rabbitmq, &cfg.app.name).await?;

        Ok(TopologyFacade::new(Arc::new(broker), topology))
    }

    /// Simple mode: publish to and consume from the named queue.
    pub async fn simple(cfg: &Configs, queue: &str) -> Result<TopologyFacade, AmqpError> {
        TopologyFacade::connect(cfg, TopologyDescriptor::simple(queue)).await
    }

    /// Publish/subscribe over a fanout exchange.
    pub async fn pub_sub(cfg: &Configs, exchange: &str) -> Result<TopologyFacade, AmqpError> {
        TopologyFacade::connect(cfg, TopologyDescriptor::fanout(exchange)).await
    }

    /// Routing mode over a direct exchange.
    ///
    /// # Parameters
    /// * `cfg` - Application and RabbitMQ configuration
    /// * `exchange` - The direct exchange name
    /// * `key` - The routing key to publish with or bind to
    pub async fn routing(
        cfg: &Configs,
        exchange: &str,
        key: &str,
    ) -> Result<TopologyFacade, AmqpError> {
        TopologyFacade::connect(cfg, TopologyDescriptor::routing(exchange, key)).await
    }

    /// Topic mode over a topic exchange.
    ///
    /// # Parameters
    /// * `cfg` - Application and RabbitMQ configuration
    /// * `exchange` - The topic exchange name
    /// * `key` - A routing key when publishing, a pattern when consuming
    pub async fn topic(
        cfg: &Configs,
        exchange: &str,
        key: &str,
    ) -> Result<TopologyFacade, AmqpError> {
        TopologyFacade::connect(cfg, TopologyDescriptor::topic(exchange, key)).await
    }

    /// Wraps an already connected broker.
    pub fn new(broker: Arc<dyn Broker>, topology: TopologyDescriptor) -> TopologyFacade {
        let (shutdown, _) = watch::channel(false);

        TopologyFacade {
            topology,
            broker,
            state: FacadeState::Connected,
            shutdown,
        }
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> FacadeState {
        self.state
    }

    pub fn topology(&self) -> &TopologyDescriptor {
        &self.topology
    }

    /// Makes sure the exchange (or the simple-mode queue) exists. Safe to repeat.
    pub async fn declare_topology(&mut self) -> Result<(), AmqpError> {
        self.ensure_open()?;

        self.topology.install(self.broker.as_ref()).await?;
        self.state = FacadeState::Declared;

        Ok(())
    }

    /// Declares the topology and sends one message to it.
    ///
    /// The message gets a fresh id when it has none, and carries the current
    /// trace context in its headers.
    pub async fn publish(&mut self, mut msg: Message) -> Result<(), AmqpError> {
        self.declare_topology().await?;

        if msg.message_id.is_none() {
            msg.message_id = Some(Uuid::new_v4().to_string());
        }
        otel::inject(&Context::current(), &mut msg);

        let (exchange, key) = self.topology.publish_target();
        debug!(exchange = exchange, key = key, "publishing message");

        self.broker.publish(exchange, key, &msg).await
    }

    /// Publishes a `text/plain` message.
    pub async fn publish_text(&mut self, body: &str) -> Result<(), AmqpError> {
        self.publish(Message::text(body)).await
    }

    /// Subscribes and logs every message received.
    pub async fn consume(&mut self) -> Result<Subscription, AmqpError> {
        self.consume_with(Arc::new(LogHandler)).await
    }

    /// Declares the topology, declares and binds the consumer queue, and
    /// starts a worker handing every delivery to `handler`.
    ///
    /// Simple mode reads the named queue directly. The other modes read a
    /// fresh broker-named queue that is exclusive to this connection and bound
    /// to the exchange with the descriptor's routing key.
    pub async fn consume_with(
        &mut self,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, AmqpError> {
        self.declare_topology().await?;

        let queue_def = self.topology.consumer_queue();
        let queue = match self.broker.declare_queue(&queue_def).await {
            Err(err) => {
                error!(error = err.to_string(), "failure to declare the consumer queue");
                Err(err)
            }
            Ok(name) => Ok(name),
        }?;

        if let Some(binding) = self.topology.binding(&queue) {
            if let Err(err) = self.broker.bind_queue(&binding).await {
                error!(error = err.to_string(), "failure to bind the consumer queue");
                return Err(err);
            }
            debug!("queue was bounded");
        }

        let stream = self.broker.consume(&queue, "").await?;

        Ok(Subscription::spawn(
            queue,
            stream,
            handler,
            self.shutdown.subscribe(),
        ))
    }

    /// Stops every subscription started by this façade, then closes the
    /// channel and the connection. The façade stays closed even when closing
    /// the connection fails.
    pub async fn teardown(&mut self) -> Result<(), AmqpError> {
        self.ensure_open()?;

        self.state = FacadeState::Closed;
        self.shutdown.send_replace(true);

        self.broker.close().await
    }

    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.state == FacadeState::Closed {
            error!(topology = %self.topology.kind(), "the connection was already closed");
            return Err(AmqpError::Closed);
        }

        Ok(())
    }
}
