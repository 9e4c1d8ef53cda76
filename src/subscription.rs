// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscriptions
//!
//! A `Subscription` is the worker task draining one delivery stream into a
//! `MessageHandler`. The worker stops when:
//!
//! - the subscription is cancelled, stopped or dropped
//! - the owning façade is torn down or dropped
//! - the delivery stream ends or yields an error
//!
//! and reports why through `SubscriptionEnd`.

use crate::{
    broker::DeliveryStream, errors::AmqpError, handler::MessageHandler, message::Message, otel,
};
use futures_util::StreamExt;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, warn};

/// Why a subscription worker returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEnd {
    /// Stopped by the subscription owner or by the façade.
    Cancelled,
    /// The broker ended the delivery stream, usually because the channel closed.
    StreamClosed,
    /// The delivery stream yielded an error.
    Failed(AmqpError),
}

/// Handle to a running consumer worker.
///
/// Dropping the handle cancels the worker. Use `wait` to block until the
/// worker returns on its own.
pub struct Subscription {
    queue: String,
    cancel: watch::Sender<bool>,
    handle: Option<JoinHandle<SubscriptionEnd>>,
}

impl Subscription {
    pub(crate) fn spawn(
        queue: String,
        stream: DeliveryStream,
        handler: Arc<dyn MessageHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Subscription {
        let (cancel, cancel_rx) = watch::channel(false);

        let handle = tokio::spawn(run(queue.clone(), stream, handler, cancel_rx, shutdown));

        Subscription {
            queue,
            cancel,
            handle: Some(handle),
        }
    }

    /// The queue this subscription reads from. For exchange-based topologies
    /// this is the broker-generated name.
    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// Signals the worker to stop without waiting for it.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(true)
    }

    /// Waits until the worker returns on its own (or is stopped elsewhere).
    pub async fn wait(mut self) -> Result<SubscriptionEnd, AmqpError> {
        let Some(handle) = self.handle.take() else {
            return Err(AmqpError::InternalError);
        };

        handle.await.map_err(|err| {
            error!(error = err.to_string(), "subscription worker failure");
            AmqpError::InternalError
        })
    }

    /// Cancels the worker and waits for it to return.
    pub async fn stop(self) -> Result<SubscriptionEnd, AmqpError> {
        self.cancel();
        self.wait().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
    }
}

async fn run(
    queue: String,
    mut stream: DeliveryStream,
    handler: Arc<dyn MessageHandler>,
    mut cancel: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) -> SubscriptionEnd {
    let tracer = global::tracer("amqp consumer");

    if *cancel.borrow() || *shutdown.borrow() {
        return SubscriptionEnd::Cancelled;
    }

    debug!(queue = %queue, "[*] waiting for messages");

    loop {
        tokio::select! {
            biased;

            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    debug!(queue = %queue, "subscription cancelled");
                    return SubscriptionEnd::Cancelled;
                }
            }

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!(queue = %queue, "subscription stopped by shutdown");
                    return SubscriptionEnd::Cancelled;
                }
            }

            next = stream.next() => match next {
                Some(Ok(msg)) => dispatch(&tracer, handler.as_ref(), &msg).await,
                Some(Err(err)) => {
                    error!(error = err.to_string(), queue = %queue, "delivery stream failure");
                    return SubscriptionEnd::Failed(err);
                }
                None => {
                    warn!(queue = %queue, "delivery stream closed");
                    return SubscriptionEnd::StreamClosed;
                }
            },
        }
    }
}

async fn dispatch(tracer: &BoxedTracer, handler: &dyn MessageHandler, msg: &Message) {
    let (ctx, mut span) = otel::new_span(msg, tracer);

    match handler.exec(&ctx, msg).await {
        Ok(_) => span.set_status(Status::Ok),
        Err(err) => {
            error!(error = err.to_string(), "error consume msg");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{handler::MockMessageHandler, mocks::ChannelHandler};
    use futures_util::stream;
    use std::time::Duration;
    use tokio::time::timeout;

    fn shutdown() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn ends_with_stream_closed_after_draining() {
        let (handler, mut rx) = ChannelHandler::channel();
        let (_shutdown_tx, shutdown_rx) = shutdown();
        let deliveries = stream::iter(vec![
            Ok(Message::text("one")),
            Ok(Message::text("two")),
        ])
        .boxed();

        let sub = Subscription::spawn(
            "imoocSimple".to_owned(),
            deliveries,
            handler,
            shutdown_rx,
        );

        assert_eq!(sub.queue_name(), "imoocSimple");
        assert_eq!(sub.wait().await, Ok(SubscriptionEnd::StreamClosed));
        assert_eq!(rx.recv().await.map(|m| m.body()), Some("one".to_owned()));
        assert_eq!(rx.recv().await.map(|m| m.body()), Some("two".to_owned()));
    }

    #[tokio::test]
    async fn stream_error_is_reported() {
        let (_shutdown_tx, shutdown_rx) = shutdown();
        let deliveries = stream::iter(vec![Err(AmqpError::ConsumerError(
            "channel closed".to_owned(),
        ))])
        .boxed();

        let mut handler = MockMessageHandler::new();
        handler.expect_exec().never();

        let sub = Subscription::spawn("q".to_owned(), deliveries, Arc::new(handler), shutdown_rx);

        assert_eq!(
            sub.wait().await,
            Ok(SubscriptionEnd::Failed(AmqpError::ConsumerError(
                "channel closed".to_owned()
            )))
        );
    }

    #[tokio::test]
    async fn handler_errors_do_not_stop_the_worker() {
        let (_shutdown_tx, shutdown_rx) = shutdown();
        let deliveries = stream::iter(vec![
            Ok(Message::text("bad")),
            Ok(Message::text("good")),
        ])
        .boxed();

        let mut handler = MockMessageHandler::new();
        handler
            .expect_exec()
            .times(2)
            .returning(|_, msg| match msg.body().as_str() {
                "bad" => Err(AmqpError::HandlerError("bad".to_owned())),
                _ => Ok(()),
            });

        let sub = Subscription::spawn("q".to_owned(), deliveries, Arc::new(handler), shutdown_rx);

        assert_eq!(sub.wait().await, Ok(SubscriptionEnd::StreamClosed));
    }

    #[tokio::test]
    async fn stop_unblocks_a_pending_stream() {
        let (_shutdown_tx, shutdown_rx) = shutdown();

        let sub = Subscription::spawn(
            "q".to_owned(),
            stream::pending::<Result<Message, AmqpError>>().boxed(),
            Arc::new(MockMessageHandler::new()),
            shutdown_rx,
        );

        let end = timeout(Duration::from_secs(1), sub.stop()).await;

        assert_eq!(end.ok(), Some(Ok(SubscriptionEnd::Cancelled)));
    }

    #[tokio::test]
    async fn shutdown_signal_stops_the_worker() {
        let (shutdown_tx, shutdown_rx) = shutdown();

        let sub = Subscription::spawn(
            "q".to_owned(),
            stream::pending::<Result<Message, AmqpError>>().boxed(),
            Arc::new(MockMessageHandler::new()),
            shutdown_rx,
        );
        assert!(!sub.is_finished());

        shutdown_tx.send(true).unwrap();
        let end = timeout(Duration::from_secs(1), sub.wait()).await;

        assert_eq!(end.ok(), Some(Ok(SubscriptionEnd::Cancelled)));
    }

    #[tokio::test]
    async fn dropping_the_shutdown_sender_stops_the_worker() {
        let (shutdown_tx, shutdown_rx) = shutdown();

        let sub = Subscription::spawn(
            "q".to_owned(),
            stream::pending::<Result<Message, AmqpError>>().boxed(),
            Arc::new(MockMessageHandler::new()),
            shutdown_rx,
        );

        drop(shutdown_tx);
        let end = timeout(Duration::from_secs(1), sub.wait()).await;

        assert_eq!(end.ok(), Some(Ok(SubscriptionEnd::Cancelled)));
    }
}
