// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Seam
//!
//! The `Broker` trait is the narrow set of channel operations the topology manager,
//! the receiver and the RPC client need. `channel::AmqpChannel` implements it on a
//! lapin channel; tests substitute a mock.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    headers::{from_field_table, Headers},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{message::Delivery, BasicProperties};

/// Stream of raw deliveries produced by a consumer.
pub type DeliveryStream = BoxStream<'static, Result<RawDelivery, AmqpError>>;

/// One physical delivery as handed over by the broker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

impl RawDelivery {
    /// Application headers of the delivery.
    pub fn headers(&self) -> Headers {
        self.properties
            .headers()
            .as_ref()
            .map(from_field_table)
            .unwrap_or_default()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.properties.correlation_id().as_ref().map(|id| id.as_str())
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.properties.reply_to().as_ref().map(|to| to.as_str())
    }
}

impl From<Delivery> for RawDelivery {
    fn from(delivery: Delivery) -> RawDelivery {
        RawDelivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
        }
    }
}

/// A fully resolved message ready to be written to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: BasicProperties,
}

impl OutboundMessage {
    pub fn headers(&self) -> Headers {
        self.properties
            .headers()
            .as_ref()
            .map(from_field_table)
            .unwrap_or_default()
    }
}

/// Channel level operations against the broker.
///
/// Implementations own exactly one primary channel. Existence probes run on a
/// disposable channel so a "not found" answer, which closes the channel it was
/// raised on, never takes the primary channel down.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn purge_queue(&self, name: &str) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Returns `Ok(false)` when the broker answers "not found".
    async fn exchange_exists(&self, name: &str) -> Result<bool, AmqpError>;

    /// Returns the approximate message count, `None` when the queue does not exist.
    async fn queue_message_count(&self, name: &str) -> Result<Option<u32>, AmqpError>;

    async fn publish(&self, message: OutboundMessage) -> Result<(), AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Rejects without requeueing, dead-lettering applies.
    async fn nack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Whether the underlying connection is still alive.
    fn is_connected(&self) -> bool;
}
