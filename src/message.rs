// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use std::collections::BTreeMap;

/// Content type of every text message.
pub const TEXT_CONTENT_TYPE: &str = "text/plain";

/// An opaque payload plus the little metadata AMQP carries with it.
///
/// On the publishing side only `payload` and `content_type` matter. Delivered
/// messages also report where they came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub payload: Vec<u8>,
    pub content_type: String,
    pub exchange: String,
    pub routing_key: String,
    pub message_id: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>, content_type: &str) -> Message {
        Message {
            payload: payload.into(),
            content_type: content_type.to_owned(),
            ..Message::default()
        }
    }

    pub fn text(body: &str) -> Message {
        Message::new(body.as_bytes(), TEXT_CONTENT_TYPE)
    }

    /// The payload as UTF-8, with invalid sequences replaced.
    pub fn body(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}
