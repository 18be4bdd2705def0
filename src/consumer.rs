// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Receiver
//!
//! Subscribes to a queue and turns every raw delivery into an envelope. The
//! delivery handle and the source queue are attached to each envelope, so the
//! same envelope is what later gets acked or rejected.
//!
//! A delivery that cannot be decoded still carries its handle: it is yielded as
//! `Received::Undecodable` with a raw envelope so the caller can reject it.

use crate::{
    broker::RawDelivery,
    codec,
    envelope::{DeliveryHandle, Envelope, Message},
    errors::{AmqpError, CodecError},
    topology::AmqpTopology,
};
use futures_util::{stream::BoxStream, StreamExt};
use std::sync::Arc;
use tracing::{debug, warn};

/// One decoded delivery.
#[derive(Debug)]
pub enum Received {
    Decoded(Envelope),
    Undecodable(Envelope, CodecError),
}

impl Received {
    pub fn envelope(&self) -> &Envelope {
        match self {
            Received::Decoded(envelope) | Received::Undecodable(envelope, _) => envelope,
        }
    }
}

pub type EnvelopeStream = BoxStream<'static, Result<Received, AmqpError>>;

pub struct AmqpReceiver {
    topology: Arc<AmqpTopology>,
}

impl AmqpReceiver {
    pub fn new(topology: Arc<AmqpTopology>) -> AmqpReceiver {
        AmqpReceiver { topology }
    }

    /// Starts consuming `queue`, the configured queue when `None`.
    ///
    /// # Parameters
    /// * `queue` - Queue to consume from
    /// * `consumer_tag` - Tag to cancel the consumer with later
    /// * `no_ack` - Whether the broker settles deliveries on its own
    ///
    /// # Returns
    /// A stream yielding every delivery decoded into an envelope, or kept raw with
    /// its decoding error
    pub async fn consume(
        &self,
        queue: Option<&str>,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<EnvelopeStream, AmqpError> {
        let queue = queue.unwrap_or(self.topology.queue_name()).to_owned();
        debug!(queue, consumer_tag, "starting consumer");

        let deliveries = self
            .topology
            .broker()
            .consume(&queue, consumer_tag, no_ack)
            .await?;

        Ok(deliveries
            .map(move |result| result.map(|raw| receive(raw, &queue)))
            .boxed())
    }

    /// Asks the broker to stop delivering to `consumer_tag`.
    pub async fn stop_consume(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.topology.broker().cancel(consumer_tag).await
    }

    /// Acknowledges the delivery the envelope was received with.
    ///
    /// # Returns
    /// * `Err(AmqpError::MissingDeliveryHandle)` - The envelope was never received
    /// * `Err(AmqpError::DeliveryAlreadySettled)` - The delivery was acked or rejected before
    pub async fn ack(&self, envelope: &Envelope) -> Result<(), AmqpError> {
        let handle = envelope.delivery().ok_or(AmqpError::MissingDeliveryHandle)?;
        self.topology.ack(handle).await
    }

    pub async fn reject(&self, envelope: &Envelope) -> Result<(), AmqpError> {
        let handle = envelope.delivery().ok_or(AmqpError::MissingDeliveryHandle)?;
        self.topology.nack(handle).await
    }

    pub async fn message_count(&self) -> Result<u32, AmqpError> {
        self.topology.count_messages().await
    }
}

/// Decodes a delivery and attaches its handle.
pub fn receive(raw: RawDelivery, queue: &str) -> Received {
    let handle = Arc::new(DeliveryHandle::new(&raw, queue));
    let headers = raw.headers();

    match codec::decode(&raw.data, &headers) {
        Ok(envelope) => Received::Decoded(envelope.with_received(handle)),
        Err(err) => {
            warn!(
                error = err.to_string(),
                delivery_tag = raw.delivery_tag,
                queue,
                "undecodable delivery"
            );
            let envelope = Envelope::new(Message::Raw {
                body: raw.data,
                headers,
            })
            .with_received(handle);

            Received::Undecodable(envelope, err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::MockBroker,
        config::AmqpConfig,
        headers::{to_field_table, Headers, HEADER_MESSAGE_TYPE},
    };
    use futures_util::stream;
    use lapin::BasicProperties;
    use serde_json::json;

    fn raw(tag: u64, headers: &Headers, data: &[u8]) -> RawDelivery {
        RawDelivery {
            delivery_tag: tag,
            properties: BasicProperties::default().with_headers(to_field_table(headers)),
            data: data.to_vec(),
            ..RawDelivery::default()
        }
    }

    #[tokio::test]
    async fn attaches_delivery_handle_to_each_envelope() {
        let encoded = codec::encode(&Envelope::new(Message::command("ping", json!(1)))).unwrap();
        let garbage = Headers::from([(HEADER_MESSAGE_TYPE.to_owned(), json!("nope"))]);
        let deliveries = vec![
            Ok(raw(1, &encoded.headers, &encoded.body)),
            Ok(raw(2, &garbage, b"?")),
        ];

        let mut broker = MockBroker::new();
        broker
            .expect_consume()
            .withf(|queue, tag, no_ack| queue == "messages" && tag == "ctag" && !no_ack)
            .times(1)
            .return_once(move |_, _, _| Ok(stream::iter(deliveries).boxed()));

        let topology = Arc::new(AmqpTopology::new(AmqpConfig::default(), Arc::new(broker)));
        let receiver = AmqpReceiver::new(topology);
        let received: Vec<_> = receiver
            .consume(None, "ctag", false)
            .await
            .unwrap()
            .collect()
            .await;

        let Ok(Received::Decoded(first)) = &received[0] else {
            panic!("first delivery should decode");
        };
        let handle = first.delivery().unwrap();
        assert_eq!(handle.delivery_tag, 1);
        assert_eq!(handle.queue, "messages");

        let Ok(Received::Undecodable(second, err)) = &received[1] else {
            panic!("second delivery should not decode");
        };
        assert_eq!(err, &CodecError::UnsupportedMessageType("nope".to_owned()));
        assert_eq!(second.delivery().unwrap().delivery_tag, 2);
    }

    #[tokio::test]
    async fn ack_requires_a_delivery_handle() {
        let topology = Arc::new(AmqpTopology::new(
            AmqpConfig::default(),
            Arc::new(MockBroker::new()),
        ));
        let receiver = AmqpReceiver::new(topology);

        let envelope = Envelope::new(Message::command("ping", json!(1)));
        assert_eq!(
            receiver.ack(&envelope).await,
            Err(AmqpError::MissingDeliveryHandle)
        );
    }
}
