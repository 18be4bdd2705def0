// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! `AmqpTopology` owns one broker channel and everything the transport declares on
//! it. Declarations are idempotent: a name recorded as declared is never declared
//! again while the connection lives. Existence probes go through the broker's
//! disposable channel, so "not found" is a plain `false`.
//!
//! Delayed delivery needs no broker plugin. A delayed message is parked in a queue
//! named after its destination and delay, whose TTL expires it into the real
//! destination through dead-lettering.

use crate::{
    broker::{Broker, OutboundMessage},
    config::AmqpConfig,
    envelope::{AmqpStamp, DeliveryHandle, MessageAttributes},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    headers::{self, Headers},
    queue::{QueueBinding, QueueDefinition},
};
use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::{debug, info, warn};

/// Persistent delivery mode
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

#[derive(Debug, Default)]
struct Declared {
    exchanges: HashSet<String>,
    queues: HashSet<String>,
}

/// Connection scoped topology manager.
pub struct AmqpTopology {
    cfg: AmqpConfig,
    broker: Arc<dyn Broker>,
    declared: Mutex<Declared>,
}

impl AmqpTopology {
    /// Creates a new AmqpTopology instance.
    ///
    /// # Parameters
    /// * `cfg` - Validated connection options
    /// * `broker` - The broker every declaration and publish goes through
    ///
    /// # Returns
    /// A topology with nothing declared yet
    pub fn new(cfg: AmqpConfig, broker: Arc<dyn Broker>) -> AmqpTopology {
        AmqpTopology {
            cfg,
            broker,
            declared: Mutex::new(Declared::default()),
        }
    }

    pub fn config(&self) -> &AmqpConfig {
        &self.cfg
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Name of the configured queue.
    pub fn queue_name(&self) -> &str {
        self.cfg.queue_name()
    }

    /// Applies the default publish routing key pattern to `destination`.
    pub fn routing_key(&self, destination: &str) -> String {
        self.cfg
            .exchange
            .default_publish_routing_key
            .replacen("%s", destination, 1)
            .trim_start_matches('.')
            .to_owned()
    }

    fn with_declared<T>(&self, f: impl FnOnce(&mut Declared) -> T) -> T {
        let mut declared = self.declared.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut declared)
    }

    fn is_exchange_declared(&self, name: &str) -> bool {
        self.with_declared(|d| d.exchanges.contains(name))
    }

    fn is_queue_declared(&self, name: &str) -> bool {
        self.with_declared(|d| d.queues.contains(name))
    }

    fn clear_when_disconnected(&self) {
        if !self.broker.is_connected() {
            warn!("connection lost, forgetting declared topology");
            self.with_declared(|d| {
                d.exchanges.clear();
                d.queues.clear();
            });
        }
    }

    /// Declares the exchange unless it was already declared.
    ///
    /// # Parameters
    /// * `def` - An exchange definition
    ///
    /// # Returns
    /// * `Ok(())` - The exchange exists on the broker
    /// * `Err(AmqpError::DeclareExchangeError)` - The broker refused the declaration
    pub async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        if self.is_exchange_declared(def.name()) {
            return Ok(());
        }

        self.broker.declare_exchange(def).await?;
        self.with_declared(|d| d.exchanges.insert(def.name().to_owned()));

        Ok(())
    }

    /// Declares the queue unless it was already declared.
    ///
    /// # Parameters
    /// * `def` - A queue definition
    ///
    /// # Returns
    /// * `Ok(())` - The queue exists on the broker
    /// * `Err(AmqpError::DeclareQueueError)` - The broker refused the declaration
    pub async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        if self.is_queue_declared(def.name()) {
            return Ok(());
        }

        self.broker.declare_queue(def).await?;
        self.with_declared(|d| d.queues.insert(def.name().to_owned()));

        Ok(())
    }

    /// Deletes the exchange, if present.
    pub async fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<(), AmqpError> {
        if !self.exists_exchange(name).await? {
            return Ok(());
        }

        self.with_declared(|d| d.exchanges.remove(name));
        self.broker.delete_exchange(name, if_unused).await
    }

    /// Binds `queue` to `exchange` with the routing `key`.
    pub async fn bind_queue(&self, queue: &str, exchange: &str, key: &str) -> Result<(), AmqpError> {
        self.broker
            .bind_queue(&QueueBinding::new(queue).exchange(exchange).routing_key(key))
            .await
    }

    /// Binds the configured queue to the configured exchange with each key.
    pub async fn bind(&self, keys: &[String]) -> Result<(), AmqpError> {
        for key in keys {
            self.bind_queue(self.queue_name(), &self.cfg.exchange.name, key)
                .await?;
        }

        Ok(())
    }

    pub async fn exists_exchange(&self, name: &str) -> Result<bool, AmqpError> {
        if self.is_exchange_declared(name) {
            return Ok(true);
        }

        let exists = self.broker.exchange_exists(name).await?;
        if exists {
            self.with_declared(|d| d.exchanges.insert(name.to_owned()));
        }

        Ok(exists)
    }

    /// Probes the broker for the queue `name`.
    ///
    /// # Returns
    /// * `Ok(true)` - The queue was declared here or exists on the broker
    /// * `Ok(false)` - The broker does not know it
    pub async fn exists_queue(&self, name: &str) -> Result<bool, AmqpError> {
        if self.is_queue_declared(name) {
            return Ok(true);
        }

        let exists = self.broker.queue_message_count(name).await?.is_some();
        if exists {
            self.with_declared(|d| d.queues.insert(name.to_owned()));
        }

        Ok(exists)
    }

    /// Messages waiting in the configured queue, 0 when the queue does not exist.
    pub async fn count_messages(&self) -> Result<u32, AmqpError> {
        let count = self
            .broker
            .queue_message_count(self.queue_name())
            .await?
            .unwrap_or_default();

        Ok(count)
    }

    /// Declares the configured exchange and queue and binds them together.
    ///
    /// The queue is bound with its own name and with every configured binding key.
    pub async fn setup(&self) -> Result<(), AmqpError> {
        let exchange = ExchangeDefinition::new(&self.cfg.exchange.name)
            .kind(self.cfg.exchange.kind)
            .params(self.cfg.exchange.arguments.clone());
        self.declare_exchange(&exchange).await?;

        let queue = QueueDefinition::new(self.queue_name()).params(self.cfg.queue.arguments.clone());
        self.declare_queue(&queue).await?;

        self.bind_queue(self.queue_name(), &self.cfg.exchange.name, self.queue_name())
            .await?;

        for key in &self.cfg.queue.binding_keys {
            let binding = QueueBinding::new(self.queue_name())
                .exchange(&self.cfg.exchange.name)
                .routing_key(key)
                .arguments(self.cfg.queue.binding_arguments.clone());
            self.broker.bind_queue(&binding).await?;
        }

        info!(
            exchange = self.cfg.exchange.name,
            queue = self.queue_name(),
            "topology ready"
        );

        Ok(())
    }

    pub async fn purge_queues(&self) -> Result<(), AmqpError> {
        self.broker.purge_queue(self.queue_name()).await
    }

    /// Publishes a raw message.
    ///
    /// Without a stamp the message goes through the default exchange to the
    /// configured queue. A stamp without exchange targets the configured exchange;
    /// its routing key, when set, replaces the default pattern. With `delay_ms > 0`
    /// the message is parked in the delay queue of its destination instead.
    ///
    /// # Parameters
    /// * `body` - Encoded payload
    /// * `headers` - Per-call headers, layered over the stamp attribute headers
    /// * `delay_ms` - Delay before the destination sees the message, 0 for none
    /// * `stamp` - Optional routing and attribute overrides
    pub async fn publish(
        &self,
        body: Vec<u8>,
        headers: &Headers,
        delay_ms: u64,
        stamp: Option<&AmqpStamp>,
    ) -> Result<(), AmqpError> {
        self.clear_when_disconnected();

        let destination = match stamp.and_then(|s| s.routing_key.as_deref()) {
            Some(key) => key.to_owned(),
            None => self.routing_key(self.queue_name()),
        };
        let exchange = match stamp {
            Some(s) => s.exchange.clone().unwrap_or_else(|| self.cfg.exchange.name.clone()),
            None => String::new(),
        };

        self.declare_destination(&destination, &exchange).await?;
        let properties = message_attributes(stamp).to_properties(&application_headers(headers, stamp));

        if delay_ms == 0 {
            debug!(exchange, routing_key = destination, "publishing message");
            return self
                .broker
                .publish(OutboundMessage {
                    exchange,
                    routing_key: destination,
                    body,
                    properties,
                })
                .await;
        }

        let delay = QueueDefinition::delay(&exchange, &destination, delay_ms);
        if !self.exists_queue(delay.name()).await? {
            self.declare_queue(&delay).await?;
        }

        debug!(queue = delay.name(), delay_ms, "publishing delayed message");
        self.broker
            .publish(OutboundMessage {
                exchange: String::new(),
                routing_key: delay.name().to_owned(),
                body,
                properties,
            })
            .await
    }

    async fn declare_destination(&self, destination: &str, exchange: &str) -> Result<(), AmqpError> {
        if !exchange.is_empty() {
            if !self.exists_exchange(exchange).await? {
                let def = ExchangeDefinition::new(exchange).kind(self.cfg.exchange.kind);
                self.declare_exchange(&def).await?;
            }
            return Ok(());
        }

        // amq.* names are reserved by the broker, direct reply-to included
        if destination.starts_with("amq.") || self.exists_queue(destination).await? {
            return Ok(());
        }

        self.declare_queue(&QueueDefinition::new(destination)).await
    }

    /// Acknowledges a delivery; a handle settles only once.
    pub async fn ack(&self, handle: &DeliveryHandle) -> Result<(), AmqpError> {
        handle.settle()?;
        self.broker.ack(handle.delivery_tag).await
    }

    /// Rejects a delivery without requeueing it.
    pub async fn nack(&self, handle: &DeliveryHandle) -> Result<(), AmqpError> {
        handle.settle()?;
        self.broker.nack(handle.delivery_tag).await
    }
}

/// Persistent JSON defaults with the stamp attributes layered on top.
fn message_attributes(stamp: Option<&AmqpStamp>) -> MessageAttributes {
    let defaults = MessageAttributes {
        content_type: Some(crate::codec::JSON_CONTENT_TYPE.to_owned()),
        delivery_mode: Some(DELIVERY_MODE_PERSISTENT),
        ..MessageAttributes::default()
    };

    match stamp {
        Some(stamp) => defaults.merge_over(&stamp.attributes),
        None => defaults,
    }
}

/// Attribute headers of the stamp overlaid with the per-call headers.
fn application_headers(call: &Headers, stamp: Option<&AmqpStamp>) -> Headers {
    let empty = Headers::new();
    let attributes = stamp
        .and_then(|s| s.attributes.headers.as_ref())
        .unwrap_or(&empty);

    headers::merge([attributes, call])
}
