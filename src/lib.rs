// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Messaging over RabbitMQ: topology management, the envelope wire format, a
//! consuming worker with stop conditions and rate limiting, and JSON-RPC calls
//! correlated over direct reply-to.

mod otel;

pub mod broker;
pub mod channel;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod headers;
pub mod publisher;
pub mod queue;
pub mod rate_limit;
pub mod rpc;
pub mod stop;
pub mod topology;
pub mod transport;
pub mod worker;
