// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Transport
//!
//! The facade the worker and the RPC client talk to. It bundles one topology
//! manager with the receiver and the sender built on it, all sharing the same
//! broker channel.

use crate::{
    broker::Broker,
    channel::AmqpChannel,
    config::AmqpConfig,
    consumer::{AmqpReceiver, EnvelopeStream},
    envelope::Envelope,
    errors::AmqpError,
    publisher::{AmqpSender, EventPublisher},
    topology::AmqpTopology,
};
use lapin::Connection;
use std::sync::Arc;

pub struct AmqpTransport {
    topology: Arc<AmqpTopology>,
    receiver: AmqpReceiver,
    sender: Arc<AmqpSender>,
}

impl AmqpTransport {
    pub fn new(cfg: AmqpConfig, broker: Arc<dyn Broker>) -> AmqpTransport {
        let topology = Arc::new(AmqpTopology::new(cfg, broker));

        AmqpTransport {
            receiver: AmqpReceiver::new(topology.clone()),
            sender: Arc::new(AmqpSender::new(topology.clone())),
            topology,
        }
    }

    /// Opens a transport with its own connection.
    pub async fn connect(cfg: &AmqpConfig) -> Result<AmqpTransport, AmqpError> {
        let broker = AmqpChannel::open(cfg).await?;
        Ok(AmqpTransport::new(cfg.clone(), broker))
    }

    /// Opens a transport on a new channel of an existing connection.
    pub async fn with_connection(
        cfg: &AmqpConfig,
        connection: Arc<Connection>,
    ) -> Result<AmqpTransport, AmqpError> {
        let broker = AmqpChannel::with_connection(cfg, connection).await?;
        Ok(AmqpTransport::new(cfg.clone(), broker))
    }

    pub fn topology(&self) -> &Arc<AmqpTopology> {
        &self.topology
    }

    pub fn receiver(&self) -> &AmqpReceiver {
        &self.receiver
    }

    pub fn sender(&self) -> &Arc<AmqpSender> {
        &self.sender
    }

    pub fn event_publisher(&self) -> EventPublisher {
        EventPublisher::new(self.sender.clone())
    }

    pub async fn setup(&self) -> Result<(), AmqpError> {
        self.topology.setup().await
    }

    pub async fn bind(&self, keys: &[String]) -> Result<(), AmqpError> {
        self.topology.bind(keys).await
    }

    pub async fn send(&self, envelope: Envelope) -> Result<Envelope, AmqpError> {
        self.sender.send(envelope).await
    }

    pub async fn ack(&self, envelope: &Envelope) -> Result<(), AmqpError> {
        self.receiver.ack(envelope).await
    }

    pub async fn reject(&self, envelope: &Envelope) -> Result<(), AmqpError> {
        self.receiver.reject(envelope).await
    }

    pub async fn message_count(&self) -> Result<u32, AmqpError> {
        self.receiver.message_count().await
    }

    /// Consumes the configured queue with manual acknowledgement.
    pub async fn consumer(&self, consumer_tag: &str) -> Result<EnvelopeStream, AmqpError> {
        self.receiver.consume(None, consumer_tag, false).await
    }

    pub async fn stop_consume(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.receiver.stop_consume(consumer_tag).await
    }
}
