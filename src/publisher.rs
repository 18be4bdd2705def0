// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Sender
//!
//! This module publishes envelopes. `AmqpSender` encodes an envelope, resolves its
//! routing from the stamps and hands the result to the topology manager; the current
//! OpenTelemetry context travels in the headers. `EventPublisher` is the entry
//! point for publishing named events on the configured exchange.

use crate::{
    codec,
    envelope::{AmqpStamp, Envelope, Event, Message, MessageAttributes},
    errors::AmqpError,
    headers::{get_str, HEADER_CONTENT_TYPE},
    otel,
    topology::{AmqpTopology, DELIVERY_MODE_PERSISTENT},
};
use opentelemetry::Context;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub struct AmqpSender {
    topology: Arc<AmqpTopology>,
}

impl AmqpSender {
    pub fn new(topology: Arc<AmqpTopology>) -> AmqpSender {
        AmqpSender { topology }
    }

    /// Publishes the envelope and returns it unchanged.
    ///
    /// Without a routing stamp the envelope goes to the configured queue through the
    /// default exchange. An envelope received earlier keeps the attributes of its
    /// delivery; when it also carries a redelivery stamp it is routed back to the
    /// queue it was consumed from.
    ///
    /// # Parameters
    /// * `envelope` - The envelope to publish
    ///
    /// # Returns
    /// * `Ok(Envelope)` - The envelope as given
    /// * `Err(AmqpError)` - Encoding or publishing failed
    pub async fn send(&self, envelope: Envelope) -> Result<Envelope, AmqpError> {
        let mut stamp = envelope
            .amqp()
            .cloned()
            .unwrap_or_else(|| AmqpStamp::new(Some(""), None));

        let mut encoded = codec::encode(&envelope)?;

        if let Some(content_type) = get_str(&encoded.headers, HEADER_CONTENT_TYPE) {
            if stamp.attributes.content_type.is_none() {
                let attributes = MessageAttributes {
                    content_type: Some(content_type.to_owned()),
                    ..MessageAttributes::default()
                };
                stamp = AmqpStamp::with_attributes(attributes, Some(&stamp));
            }
        }

        if let Some(handle) = envelope.delivery() {
            let retry_routing_key = envelope.is_redelivered().then_some(handle.queue.as_str());
            stamp = AmqpStamp::from_delivery(handle, Some(&stamp), retry_routing_key);
        }

        otel::inject_context(&Context::current(), &mut encoded.headers);

        debug!(
            kind = envelope.message().kind(),
            retry = stamp.is_retry_attempt(),
            "sending envelope"
        );

        self.topology
            .publish(
                encoded.body,
                &encoded.headers,
                envelope.stamps().delay_ms,
                Some(&stamp),
            )
            .await?;

        Ok(envelope)
    }
}

/// Publishes named events on the configured exchange.
pub struct EventPublisher {
    sender: Arc<AmqpSender>,
}

impl EventPublisher {
    pub fn new(sender: Arc<AmqpSender>) -> EventPublisher {
        EventPublisher { sender }
    }

    /// Publishes `event` with its name as routing key.
    ///
    /// Every event is persistent and gets a fresh correlation id.
    pub async fn publish(&self, event: Event) -> Result<(), AmqpError> {
        let mut stamp = AmqpStamp::new(None, Some(&event.name));
        stamp.attributes = MessageAttributes {
            delivery_mode: Some(DELIVERY_MODE_PERSISTENT),
            correlation_id: Some(Uuid::new_v4().to_string()),
            ..MessageAttributes::default()
        };

        self.sender
            .send(Envelope::new(Message::EventPublish(event)).with_amqp(stamp))
            .await?;

        Ok(())
    }
}
