// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod broker;
pub mod channel;
pub mod configs;
pub mod errors;
pub mod exchange;
pub mod facade;
pub mod handler;
pub mod logging;
pub mod message;
pub mod queue;
pub mod subscription;
pub mod topology;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;

pub use facade::{FacadeState, TopologyFacade};
pub use message::Message;
pub use topology::{TopologyDescriptor, TopologyKind};
