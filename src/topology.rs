// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Descriptors
//!
//! A `TopologyDescriptor` names one of the four classic messaging layouts and
//! knows which exchange, queue and binding each side of it needs:
//!
//! - `Simple`: a named queue on the default exchange, no binding
//! - `Fanout`: a durable fanout exchange, every consumer gets its own queue
//! - `Routing`: a durable direct exchange, consumers bind with an exact key
//! - `Topic`: a durable topic exchange, consumers bind with a `*` / `#` pattern
//!
//! Topic pattern matching is done by the broker; the key is passed through
//! untouched.

use crate::{
    broker::Broker,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use std::fmt::{Display, Formatter};
use tracing::{debug, error};

/// The default exchange routes on queue name, which is how simple mode publishes.
pub const DEFAULT_EXCHANGE: &str = "";

/// The four ways a façade can move messages.
///
/// - Simple: one named queue, published through the default exchange
/// - Fanout: publish/subscribe, every consumer gets every message
/// - Routing: direct exchange, consumers get exact routing key matches
/// - Topic: topic exchange, consumers bind with `*` / `#` patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopologyKind {
    Simple,
    Fanout,
    Routing,
    Topic,
}

impl TopologyKind {
    /// The exchange kind backing this topology, `None` for the simple mode.
    pub fn exchange_kind(&self) -> Option<ExchangeKind> {
        match self {
            TopologyKind::Simple => None,
            TopologyKind::Fanout => Some(ExchangeKind::Fanout),
            TopologyKind::Routing => Some(ExchangeKind::Direct),
            TopologyKind::Topic => Some(ExchangeKind::Topic),
        }
    }
}

impl Display for TopologyKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let printable = match self {
            TopologyKind::Simple => "simple",
            TopologyKind::Fanout => "fanout",
            TopologyKind::Routing => "routing",
            TopologyKind::Topic => "topic",
        };
        write!(f, "{}", printable)
    }
}

/// `{queue, exchange, routing key, kind}` for one façade.
///
/// Only the simple mode carries a queue name. Exchange-based modes leave it
/// empty so every consumer declares its own broker-named, exclusive,
/// auto-deleted queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyDescriptor {
    queue_name: String,
    exchange_name: String,
    routing_key: String,
    kind: TopologyKind,
}

impl TopologyDescriptor {
    /// Creates a simple mode descriptor.
    ///
    /// # Parameters
    /// * `queue` - The queue both publishers and consumers use
    ///
    /// # Returns
    /// A descriptor with no exchange and no routing key
    pub fn simple(queue: &str) -> TopologyDescriptor {
        TopologyDescriptor {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
            kind: TopologyKind::Simple,
        }
    }

    /// Publish/subscribe: the routing key is always empty.
    pub fn fanout(exchange: &str) -> TopologyDescriptor {
        TopologyDescriptor::with_exchange(TopologyKind::Fanout, exchange, "")
    }

    /// Creates a routing (direct exchange) descriptor.
    ///
    /// # Parameters
    /// * `exchange` - The direct exchange name
    /// * `key` - The routing key messages are published with and consumers
    ///   bind with
    ///
    /// # Returns
    /// A descriptor for the routing mode
    pub fn routing(exchange: &str, key: &str) -> TopologyDescriptor {
        TopologyDescriptor::with_exchange(TopologyKind::Routing, exchange, key)
    }

    /// `key` is a concrete routing key on the publishing side and a pattern on
    /// the consuming side.
    pub fn topic(exchange: &str, key: &str) -> TopologyDescriptor {
        TopologyDescriptor::with_exchange(TopologyKind::Topic, exchange, key)
    }

    fn with_exchange(kind: TopologyKind, exchange: &str, key: &str) -> TopologyDescriptor {
        TopologyDescriptor {
            queue_name: String::new(),
            exchange_name: exchange.to_owned(),
            routing_key: key.to_owned(),
            kind,
        }
    }

    /// Returns the topology kind.
    pub fn kind(&self) -> TopologyKind {
        self.kind
    }

    /// Returns the queue name, empty outside the simple mode.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Returns the exchange name, empty in the simple mode.
    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Checks the naming rules of the descriptor's kind.
    ///
    /// # Returns
    /// `InvalidTopology` when the simple mode has no queue name or an
    /// exchange-based mode has no exchange name
    pub fn validate(&self) -> Result<(), AmqpError> {
        match self.kind {
            TopologyKind::Simple if self.queue_name.is_empty() => Err(
                AmqpError::InvalidTopology("simple mode requires a queue name".to_owned()),
            ),
            TopologyKind::Simple => Ok(()),
            _ if self.exchange_name.is_empty() => Err(AmqpError::InvalidTopology(format!(
                "{} mode requires an exchange name",
                self.kind
            ))),
            _ => Ok(()),
        }
    }

    /// The exchange to declare, if this topology uses one. Always durable.
    pub fn exchange(&self) -> Option<ExchangeDefinition> {
        self.kind
            .exchange_kind()
            .map(|kind| ExchangeDefinition::new(&self.exchange_name).kind(kind).durable())
    }

    /// The queue a publisher has to make sure exists. Exchange-based publishers
    /// declare no queue at all.
    pub fn publisher_queue(&self) -> Option<QueueDefinition> {
        match self.kind {
            TopologyKind::Simple => Some(QueueDefinition::new(&self.queue_name)),
            _ => None,
        }
    }

    /// The queue a consumer reads from.
    pub fn consumer_queue(&self) -> QueueDefinition {
        match self.kind {
            TopologyKind::Simple => QueueDefinition::new(&self.queue_name),
            _ => QueueDefinition::server_named(),
        }
    }

    /// The binding for a consumer queue, `None` in simple mode.
    pub fn binding(&self, queue: &str) -> Option<QueueBinding> {
        match self.kind {
            TopologyKind::Simple => None,
            _ => Some(
                QueueBinding::new(queue)
                    .exchange(&self.exchange_name)
                    .routing_key(&self.routing_key),
            ),
        }
    }

    /// `(exchange, routing key)` a publish call targets.
    pub fn publish_target(&self) -> (&str, &str) {
        match self.kind {
            TopologyKind::Simple => (DEFAULT_EXCHANGE, &self.queue_name),
            _ => (&self.exchange_name, &self.routing_key),
        }
    }

    /// Declares the exchange (or, in simple mode, the named queue) on the broker.
    ///
    /// Declarations are idempotent as long as the flags match what already
    /// exists, so installing the same descriptor twice is safe.
    pub async fn install(&self, broker: &dyn Broker) -> Result<(), AmqpError> {
        self.validate()?;

        if let Some(exch) = self.exchange() {
            debug!("creating exchange: {}", exch.name());
            if let Err(err) = broker.declare_exchange(&exch).await {
                error!(
                    error = err.to_string(),
                    name = exch.name(),
                    "error to declare the exchange"
                );
                return Err(err);
            }
            debug!("exchange: {} was created", exch.name());
        }

        if let Some(queue) = self.publisher_queue() {
            debug!("creating queue: {}", queue.name());
            if let Err(err) = broker.declare_queue(&queue).await {
                error!(
                    error = err.to_string(),
                    name = queue.name(),
                    "error to declare the queue"
                );
                return Err(err);
            }
            debug!("queue: {} was created", queue.name());
        }

        Ok(())
    }
}
