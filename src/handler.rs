// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use crate::{errors::AmqpError, message::Message};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use opentelemetry::Context;
use tracing::info;

/// Processes every message a subscription receives.
///
/// Messages are auto-acknowledged, so an `Err` is logged and the subscription
/// keeps going; the message is not redelivered.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &Message) -> Result<(), AmqpError>;
}

/// Logs each received message.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandler;

#[async_trait]
impl MessageHandler for LogHandler {
    async fn exec(&self, _ctx: &Context, msg: &Message) -> Result<(), AmqpError> {
        info!(
            exchange = %msg.exchange,
            routing_key = %msg.routing_key,
            "Received a message: {}",
            msg.body()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_handler_accepts_every_message() {
        let res = LogHandler
            .exec(&Context::current(), &Message::text("Hello imooc!"))
            .await;

        assert!(res.is_ok());
    }
}
