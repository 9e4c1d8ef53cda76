// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! `AmqpError` covers every broker-facing failure of the topology façade:
//! connecting, declaring exchanges and queues, binding, publishing and
//! consuming. Configuration loading and logger setup have their own small
//! error enums.

use thiserror::Error;

/// Represents errors that can occur while talking to the broker.
///
/// Every variant is returned to the caller; none of them terminates the process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the broker
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// The topology descriptor breaks the queue/exchange naming rules
    #[error("invalid topology `{0}`")]
    InvalidTopology(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error opening a consumer on a queue
    #[error("consumer declaration error")]
    ConsumerDeclarationError,

    /// Error reading from an open delivery stream
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// A message handler rejected a delivery
    #[error("failure to handle message `{0}`")]
    HandlerError(String),

    /// The façade was already torn down
    #[error("connection closed")]
    Closed,

    /// Error closing the channel or the connection
    #[error("failure to close the connection")]
    CloseError,
}

/// Errors raised while reading configuration values.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigsError {
    #[error("invalid value `{1}` for `{0}`")]
    InvalidValue(String, String),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LoggingError {
    #[error("logging internal error")]
    InternalError,
}
