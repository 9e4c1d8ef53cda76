// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A process-local stand-in for an AMQP broker, enough to exercise all four
//! topologies without a server. `InMemoryBroker` is the shared "server";
//! every `connection()` is one `Broker` handle, so several façades can talk
//! to the same exchanges and queues.
//!
//! Routing follows AMQP semantics: the default exchange routes by queue name,
//! fanout ignores the key, direct compares keys, topic matches `*` against
//! exactly one word and `#` against zero or more. A queue with several
//! consumers hands its messages out round-robin. Closing a connection deletes
//! the exclusive queues it declared and ends the streams of its consumers.

use crate::{
    broker::{Broker, DeliveryStream},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    handler::MessageHandler,
    message::Message,
    queue::{QueueBinding, QueueDefinition},
    topology::DEFAULT_EXCHANGE,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use opentelemetry::Context;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::sync::mpsc;
use tracing::debug;

type Delivery = Result<Message, AmqpError>;

struct QueueState {
    def: QueueDefinition,
    owner: u64,
    buffered: VecDeque<Message>,
    consumers: Vec<(u64, mpsc::UnboundedSender<Delivery>)>,
    next_consumer: usize,
}

#[derive(Default)]
struct ServerState {
    next_id: u64,
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<QueueBinding>,
}

impl ServerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn delete_queue(&mut self, name: &str) -> bool {
        self.bindings.retain(|b| b.queue_name != name);
        self.queues.remove(name).is_some()
    }

    fn route(&self, exchange: &str, key: &str) -> Vec<String> {
        if exchange == DEFAULT_EXCHANGE {
            return self
                .queues
                .contains_key(key)
                .then(|| vec![key.to_owned()])
                .unwrap_or_default();
        }

        let Some(exch) = self.exchanges.get(exchange) else {
            return vec![];
        };

        let mut targets: Vec<String> = vec![];
        for binding in self.bindings.iter().filter(|b| b.exchange_name == exchange) {
            let matched = match exch.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Direct => binding.routing_key == key,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, key),
            };

            if matched && !targets.contains(&binding.queue_name) {
                targets.push(binding.queue_name.clone());
            }
        }

        targets
    }

    fn deliver(&mut self, queue: &str, msg: Message) {
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };

        state.consumers.retain(|(_, sender)| !sender.is_closed());
        if state.consumers.is_empty() {
            state.buffered.push_back(msg);
            return;
        }

        let idx = state.next_consumer % state.consumers.len();
        state.next_consumer = state.next_consumer.wrapping_add(1);

        if let Err(mpsc::error::SendError(Ok(msg))) = state.consumers[idx].1.send(Ok(msg)) {
            state.buffered.push_back(msg);
        }
    }
}

/// The shared broker state. Cheap to clone.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<ServerState>>,
}

impl InMemoryBroker {
    pub fn new() -> InMemoryBroker {
        InMemoryBroker::default()
    }

    /// Opens a new connection (with its channel) to this broker.
    pub fn connection(&self) -> Arc<dyn Broker> {
        let id = self.lock().next_id();

        Arc::new(InMemoryConnection {
            id,
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    /// Messages sitting in `queue` with no consumer to take them.
    pub fn buffered(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.buffered.len())
            .unwrap_or_default()
    }

    /// Deletes a queue and its bindings, ending the streams of its consumers.
    pub fn delete_queue(&self, name: &str) -> bool {
        self.lock().delete_queue(name)
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct InMemoryConnection {
    id: u64,
    state: Arc<Mutex<ServerState>>,
    closed: AtomicBool,
}

impl InMemoryConnection {
    fn lock(&self) -> Result<MutexGuard<'_, ServerState>, AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::Closed);
        }

        Ok(self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

#[async_trait]
impl Broker for InMemoryConnection {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.lock()?;

        if let Some(existing) = state.exchanges.get(&def.name) {
            if existing != def {
                return Err(AmqpError::DeclareExchangeError(def.name.clone()));
            }
            return Ok(());
        }

        state.exchanges.insert(def.name.clone(), def.clone());
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        let mut state = self.lock()?;

        let name = if def.name.is_empty() {
            format!("amq.gen-{}", state.next_id())
        } else {
            def.name.clone()
        };

        if let Some(existing) = state.queues.get(&name) {
            let locked = existing.def.exclusive && existing.owner != self.id;
            let mismatch = existing.def.durable != def.durable
                || existing.def.exclusive != def.exclusive
                || existing.def.delete != def.delete;

            if locked || mismatch {
                return Err(AmqpError::DeclareQueueError(name));
            }
            return Ok(name);
        }

        let mut stored = def.clone();
        stored.name = name.clone();
        state.queues.insert(
            name.clone(),
            QueueState {
                def: stored,
                owner: self.id,
                buffered: VecDeque::new(),
                consumers: vec![],
                next_consumer: 0,
            },
        );

        debug!("queue: {} was declared", name);
        Ok(name)
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.lock()?;

        if !state.exchanges.contains_key(&binding.exchange_name)
            || !state.queues.contains_key(&binding.queue_name)
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }

        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }

        Ok(())
    }

    async fn publish(&self, exchange: &str, key: &str, msg: &Message) -> Result<(), AmqpError> {
        let mut state = self.lock()?;

        if exchange != DEFAULT_EXCHANGE && !state.exchanges.contains_key(exchange) {
            return Err(AmqpError::PublishingError);
        }

        let mut delivered = msg.clone();
        delivered.exchange = exchange.to_owned();
        delivered.routing_key = key.to_owned();

        for queue in state.route(exchange, key) {
            state.deliver(&queue, delivered.clone());
        }

        Ok(())
    }

    async fn consume(&self, queue: &str, _tag: &str) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.lock()?;

        let Some(queue_state) = state.queues.get_mut(queue) else {
            return Err(AmqpError::ConsumerDeclarationError);
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        for msg in queue_state.buffered.drain(..) {
            let _ = sender.send(Ok(msg));
        }
        queue_state.consumers.push((self.id, sender));

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        })
        .boxed())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.lock()?;
        self.closed.store(true, Ordering::SeqCst);

        let owned: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.def.exclusive && q.owner == self.id)
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            state.delete_queue(&name);
        }

        for queue in state.queues.values_mut() {
            queue.consumers.retain(|(owner, _)| *owner != self.id);
        }

        Ok(())
    }
}

/// AMQP topic matching over dot separated words.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();

    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            match_words(rest, key) || (!key.is_empty() && match_words(pattern, &key[1..]))
        }
        (Some((&"*", rest)), Some((_, key_rest))) => match_words(rest, key_rest),
        (Some((word, rest)), Some((part, key_rest))) if word == part => {
            match_words(rest, key_rest)
        }
        _ => false,
    }
}

/// Forwards every handled message to an unbounded channel.
pub struct ChannelHandler {
    sender: mpsc::UnboundedSender<Message>,
}

impl ChannelHandler {
    pub fn channel() -> (Arc<ChannelHandler>, mpsc::UnboundedReceiver<Message>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(ChannelHandler { sender }), receiver)
    }
}

#[async_trait]
impl MessageHandler for ChannelHandler {
    async fn exec(&self, _ctx: &Context, msg: &Message) -> Result<(), AmqpError> {
        self.sender
            .send(msg.clone())
            .map_err(|err| AmqpError::HandlerError(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        facade::TopologyFacade,
        otel::testing::{install_origin_propagator, Origin},
        subscription::SubscriptionEnd,
        topology::TopologyDescriptor,
    };
    use std::time::Duration;
    use tokio::time::timeout;

    struct OriginHandler {
        sender: mpsc::UnboundedSender<(Option<Origin>, Message)>,
    }

    #[async_trait]
    impl MessageHandler for OriginHandler {
        async fn exec(&self, ctx: &Context, msg: &Message) -> Result<(), AmqpError> {
            self.sender
                .send((ctx.get::<Origin>().cloned(), msg.clone()))
                .map_err(|err| AmqpError::HandlerError(err.to_string()))
        }
    }

    const WAIT: Duration = Duration::from_millis(200);

    async fn received(rx: &mut mpsc::UnboundedReceiver<Message>) -> Option<String> {
        timeout(WAIT, rx.recv())
            .await
            .ok()
            .flatten()
            .map(|msg| msg.body())
    }

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("imooc.topic.*", "imooc.topic.one"));
        assert!(topic_matches("imooc.#", "imooc.topic.one"));
        assert!(topic_matches("imooc.#", "imooc"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.topic.#", "imooc.topic"));
        assert!(!topic_matches("imooc.*", "imooc.hello.one"));
        assert!(!topic_matches("other.*", "imooc.topic.one"));
        assert!(!topic_matches("imooc.topic.*", "imooc.topic"));
    }

    #[tokio::test]
    async fn simple_mode_delivers_byte_for_byte() {
        let broker = InMemoryBroker::new();
        let mut publisher = TopologyFacade::new(
            broker.connection(),
            TopologyDescriptor::simple("imoocSimple"),
        );
        let mut consumer = TopologyFacade::new(
            broker.connection(),
            TopologyDescriptor::simple("imoocSimple"),
        );

        publisher.publish_text("Hello imooc!").await.unwrap();
        assert_eq!(broker.buffered("imoocSimple"), 1);

        let (handler, mut rx) = ChannelHandler::channel();
        let _sub = consumer.consume_with(handler).await.unwrap();

        let msg = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(msg.payload, b"Hello imooc!".to_vec());
        assert_eq!(msg.content_type, "text/plain");
        assert_eq!(msg.routing_key, "imoocSimple");
    }

    #[tokio::test]
    async fn fanout_reaches_every_bound_queue_until_it_is_deleted() {
        let broker = InMemoryBroker::new();
        let topology = TopologyDescriptor::fanout("exImoocFanout");

        let mut first = TopologyFacade::new(broker.connection(), topology.clone());
        let mut second = TopologyFacade::new(broker.connection(), topology.clone());
        let mut publisher = TopologyFacade::new(broker.connection(), topology);

        let (first_handler, mut first_rx) = ChannelHandler::channel();
        let (second_handler, mut second_rx) = ChannelHandler::channel();
        let first_sub = first.consume_with(first_handler).await.unwrap();
        let second_sub = second.consume_with(second_handler).await.unwrap();
        assert_ne!(first_sub.queue_name(), second_sub.queue_name());

        publisher.publish_text("broadcast 1").await.unwrap();
        assert_eq!(received(&mut first_rx).await, Some("broadcast 1".to_owned()));
        assert_eq!(received(&mut second_rx).await, Some("broadcast 1".to_owned()));

        let second_queue = second_sub.queue_name().to_owned();
        second.teardown().await.unwrap();
        assert!(!broker.queue_names().contains(&second_queue));

        publisher.publish_text("broadcast 2").await.unwrap();
        assert_eq!(received(&mut first_rx).await, Some("broadcast 2".to_owned()));
        assert_eq!(received(&mut second_rx).await, None);
    }

    #[tokio::test]
    async fn routing_mode_only_reaches_the_matching_key() {
        let broker = InMemoryBroker::new();

        let mut a = TopologyFacade::new(
            broker.connection(),
            TopologyDescriptor::routing("exImoocRouting", "key.A"),
        );
        let mut b = TopologyFacade::new(
            broker.connection(),
            TopologyDescriptor::routing("exImoocRouting", "key.B"),
        );
        let mut publisher = TopologyFacade::new(
            broker.connection(),
            TopologyDescriptor::routing("exImoocRouting", "key.A"),
        );

        let (a_handler, mut a_rx) = ChannelHandler::channel();
        let (b_handler, mut b_rx) = ChannelHandler::channel();
        let _a_sub = a.consume_with(a_handler).await.unwrap();
        let _b_sub = b.consume_with(b_handler).await.unwrap();

        publisher.publish_text("only A").await.unwrap();

        assert_eq!(received(&mut a_rx).await, Some("only A".to_owned()));
        assert_eq!(received(&mut b_rx).await, None);
    }

    #[tokio::test]
    async fn topic_mode_matches_patterns() {
        let broker = InMemoryBroker::new();
        let mut rxs = vec![];
        let mut subs = vec![];
        let mut consumers = vec![];

        for pattern in ["imooc.topic.*", "imooc.#", "other.*"] {
            let mut facade = TopologyFacade::new(
                broker.connection(),
                TopologyDescriptor::topic("exImoocTopic", pattern),
            );
            let (handler, rx) = ChannelHandler::channel();
            subs.push(facade.consume_with(handler).await.unwrap());
            rxs.push(rx);
            consumers.push(facade);
        }

        let mut publisher = TopologyFacade::new(
            broker.connection(),
            TopologyDescriptor::topic("exImoocTopic", "imooc.topic.one"),
        );
        publisher
            .publish_text("Hello imooc topic One!")
            .await
            .unwrap();

        let expected = Some("Hello imooc topic One!".to_owned());
        assert_eq!(received(&mut rxs[0]).await, expected);
        assert_eq!(received(&mut rxs[1]).await, expected);
        assert_eq!(received(&mut rxs[2]).await, None);
    }

    #[tokio::test]
    async fn redeclaring_with_another_kind_fails() {
        let broker = InMemoryBroker::new();
        let mut fanout = TopologyFacade::new(
            broker.connection(),
            TopologyDescriptor::fanout("exImooc"),
        );
        let mut topic = TopologyFacade::new(
            broker.connection(),
            TopologyDescriptor::topic("exImooc", "imooc.#"),
        );

        fanout.declare_topology().await.unwrap();
        fanout.declare_topology().await.unwrap();

        assert_eq!(
            topic.declare_topology().await,
            Err(AmqpError::DeclareExchangeError("exImooc".to_owned()))
        );
        assert!(broker.has_exchange("exImooc"));
    }

    #[tokio::test]
    async fn teardown_ends_consumers_and_drops_exclusive_queues() {
        let broker = InMemoryBroker::new();
        let mut consumer = TopologyFacade::new(
            broker.connection(),
            TopologyDescriptor::topic("exImoocTopic", "imooc.#"),
        );

        let sub = consumer.consume().await.unwrap();
        let queue = sub.queue_name().to_owned();
        assert!(broker.queue_names().contains(&queue));

        consumer.teardown().await.unwrap();

        assert!(broker.queue_names().is_empty());
        assert!(broker.has_exchange("exImoocTopic"));
        assert_eq!(
            timeout(WAIT, sub.wait()).await.ok(),
            Some(Ok(SubscriptionEnd::Cancelled))
        );
        assert!(matches!(
            consumer.publish_text("late").await,
            Err(AmqpError::Closed)
        ));
    }

    #[tokio::test]
    async fn deleted_queue_ends_the_stream() {
        let broker = InMemoryBroker::new();
        let mut consumer = TopologyFacade::new(
            broker.connection(),
            TopologyDescriptor::fanout("exImoocFanout"),
        );

        let sub = consumer.consume().await.unwrap();
        assert!(broker.delete_queue(sub.queue_name()));

        assert_eq!(
            timeout(WAIT, sub.wait()).await.ok(),
            Some(Ok(SubscriptionEnd::StreamClosed))
        );
    }

    #[tokio::test]
    async fn simple_queue_shares_messages_between_consumers() {
        let broker = InMemoryBroker::new();
        let topology = TopologyDescriptor::simple("imoocSimple");
        let mut first = TopologyFacade::new(broker.connection(), topology.clone());
        let mut second = TopologyFacade::new(broker.connection(), topology.clone());
        let mut publisher = TopologyFacade::new(broker.connection(), topology);

        let (first_handler, mut first_rx) = ChannelHandler::channel();
        let (second_handler, mut second_rx) = ChannelHandler::channel();
        let first_sub = first.consume_with(first_handler).await.unwrap();
        let _second_sub = second.consume_with(second_handler).await.unwrap();

        publisher.publish_text("one").await.unwrap();
        publisher.publish_text("two").await.unwrap();

        assert_eq!(received(&mut first_rx).await, Some("one".to_owned()));
        assert_eq!(received(&mut second_rx).await, Some("two".to_owned()));
        assert!(!first_sub.is_finished());

        second.teardown().await.unwrap();
        publisher.publish_text("three").await.unwrap();

        assert_eq!(received(&mut first_rx).await, Some("three".to_owned()));
        assert_eq!(broker.buffered("imoocSimple"), 0);
    }

    #[tokio::test]
    async fn trace_context_travels_from_publisher_to_handler() {
        install_origin_propagator();
        let broker = InMemoryBroker::new();
        let topology = TopologyDescriptor::routing("exImoocRouting", "key.A");
        let mut consumer = TopologyFacade::new(broker.connection(), topology.clone());
        let mut publisher = TopologyFacade::new(broker.connection(), topology);

        let (sender, mut rx) = mpsc::unbounded_channel();
        let _sub = consumer
            .consume_with(Arc::new(OriginHandler { sender }))
            .await
            .unwrap();

        {
            let _guard = Context::current()
                .with_value(Origin("checkout".to_owned()))
                .attach();
            publisher.publish_text("traced").await.unwrap();
        }

        let (origin, msg) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(
            msg.headers.get("x-origin").map(|v| v.as_str()),
            Some("checkout")
        );
        assert!(msg.message_id.is_some());
        assert_eq!(origin, Some(Origin("checkout".to_owned())));
    }
}
