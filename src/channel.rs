// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! Opens the single connection and channel a façade owns.

use crate::{configs::RabbitMQConfigs, errors::AmqpError};
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Connects to the broker described by `cfg` and opens one channel on it.
///
/// A failed connect is retried `cfg.connect_retries` times, waiting
/// `connect_backoff_ms * attempt` between tries. Channel creation is not
/// retried.
///
/// # Example
/// ```ignore
/// let (conn, channel) = new_amqp_channel(&cfg.rabbitmq, &cfg.app.name).await?;
/// ```
pub async fn new_amqp_channel(
    cfg: &RabbitMQConfigs,
    connection_name: &str,
) -> Result<(Connection, Channel), AmqpError> {
    let uri = cfg.uri();
    let mut attempt: u32 = 0;

    debug!(host = %cfg.host, port = cfg.port, "creating amqp connection...");
    let conn = loop {
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(connection_name.to_owned()));

        match Connection::connect(&uri, options).await {
            Ok(c) => break c,
            Err(err) if attempt < cfg.connect_retries => {
                attempt += 1;
                warn!(
                    error = err.to_string(),
                    attempt = attempt,
                    "failure to connect, retrying"
                );
                tokio::time::sleep(backoff(cfg, attempt)).await;
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                return Err(AmqpError::ConnectionError {});
            }
        }
    };
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((conn, c))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError {})
        }
    }
}

fn backoff(cfg: &RabbitMQConfigs, attempt: u32) -> Duration {
    Duration::from_millis(cfg.connect_backoff_ms.saturating_mul(attempt as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[test]
    fn backoff_grows_linearly() {
        let cfg = RabbitMQConfigs::default();

        assert_eq!(backoff(&cfg, 1), Duration::from_millis(500));
        assert_eq!(backoff(&cfg, 3), Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn unreachable_broker_is_a_connection_error() {
        let cfg = RabbitMQConfigs {
            host: "127.0.0.1".to_owned(),
            port: 1,
            ..RabbitMQConfigs::default()
        };

        let res = new_amqp_channel(&cfg, "test").await;

        assert_eq!(res.err(), Some(AmqpError::ConnectionError));
    }

    #[tokio::test]
    async fn retries_before_giving_up() {
        let cfg = RabbitMQConfigs {
            host: "127.0.0.1".to_owned(),
            port: 1,
            connect_retries: 2,
            connect_backoff_ms: 5,
            ..RabbitMQConfigs::default()
        };
        let started = Instant::now();

        let res = new_amqp_channel(&cfg, "test").await;

        assert_eq!(res.err(), Some(AmqpError::ConnectionError));
        // 5ms after the first failure, 10ms after the second
        assert!(started.elapsed() >= Duration::from_millis(15));
    }
}
