// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! This module provides types for defining RabbitMQ queues, including the delay
//! queues the transport uses instead of a broker-side delay plugin: a message parked
//! in a delay queue expires after its TTL and is dead-lettered back to the real
//! destination. Delay queues expire themselves once unused.

use crate::headers::{to_field_table, Headers};
use lapin::types::FieldTable;
use serde_json::Value;

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify the idle lifetime of the queue
pub const AMQP_HEADERS_EXPIRES: &str = "x-expires";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the argument used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// Named arguments (TTL, expiry, length bounds, dead lettering) are layered over the
/// free-form `params` when the definition is turned into declare arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) ttl: Option<i64>,
    pub(crate) expires: Option<i64>,
    pub(crate) max_length: Option<i64>,
    pub(crate) max_length_bytes: Option<i64>,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
    pub(crate) params: Headers,
}

impl QueueDefinition {
    /// Creates a durable, non-exclusive queue definition.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: true,
            delete: false,
            exclusive: false,
            ttl: None,
            expires: None,
            max_length: None,
            max_length_bytes: None,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            params: Headers::new(),
        }
    }

    /// Defines the queue parking messages for `delay_ms` before dead-lettering them
    /// to `routing_key` on `exchange`.
    ///
    /// The name is derived from the destination and the delay only, so every publish
    /// with the same pair reuses the same queue.
    pub fn delay(exchange: &str, routing_key: &str, delay_ms: u64) -> Self {
        let ttl = i64::try_from(delay_ms).unwrap_or(i64::MAX / 2);

        QueueDefinition::new(&delay_queue_name(exchange, routing_key, delay_ms))
            .ttl(ttl)
            .expires(ttl.saturating_mul(2))
            .dead_letter(exchange, routing_key)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn auto_delete(mut self, delete: bool) -> Self {
        self.delete = delete;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(mut self, ttl: i64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Deletes the queue after it went unused for `expires` milliseconds.
    pub fn expires(mut self, expires: i64) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn max_length(mut self, max: i64) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn max_length_bytes(mut self, max_bytes: i64) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    pub fn dead_letter(mut self, exchange: &str, routing_key: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self.dead_letter_routing_key = Some(routing_key.to_owned());
        self
    }

    pub fn params(mut self, params: Headers) -> Self {
        self.params = params;
        self
    }

    /// Declare arguments, named settings winning over `params`.
    pub fn arguments(&self) -> Headers {
        let mut args = self.params.clone();

        if let Some(exchange) = &self.dead_letter_exchange {
            args.insert(
                AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(),
                Value::from(exchange.clone()),
            );
        }
        if let Some(key) = &self.dead_letter_routing_key {
            args.insert(
                AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY.to_owned(),
                Value::from(key.clone()),
            );
        }
        if let Some(ttl) = self.ttl {
            args.insert(AMQP_HEADERS_MESSAGE_TTL.to_owned(), Value::from(ttl));
        }
        if let Some(expires) = self.expires {
            args.insert(AMQP_HEADERS_EXPIRES.to_owned(), Value::from(expires));
        }
        if let Some(max) = self.max_length {
            args.insert(AMQP_HEADERS_MAX_LENGTH.to_owned(), Value::from(max));
        }
        if let Some(max) = self.max_length_bytes {
            args.insert(AMQP_HEADERS_MAX_LENGTH_BYTES.to_owned(), Value::from(max));
        }

        args
    }

    pub(crate) fn field_table(&self) -> FieldTable {
        to_field_table(&self.arguments())
    }
}

/// Name of the delay queue for a destination and a delay.
///
/// The exchange is part of the name unless it is the default one, so one routing
/// key behind two exchanges gets two delay queues, each dead-lettering to its own.
pub fn delay_queue_name(exchange: &str, routing_key: &str, delay_ms: u64) -> String {
    if exchange.is_empty() {
        return format!("{}.delay.{}", routing_key, delay_ms);
    }

    format!("{}.{}.delay.{}", exchange, routing_key, delay_ms)
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
    pub(crate) arguments: Headers,
}

impl QueueBinding {
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
            arguments: Headers::new(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn arguments(mut self, arguments: Headers) -> Self {
        self.arguments = arguments;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn delay_queue_dead_letters_to_destination() {
        let def = QueueDefinition::delay("messages", "orders", 1500);
        let args = def.arguments();

        assert_eq!(def.name(), "messages.orders.delay.1500");
        assert!(def.durable);
        assert_eq!(args.get(AMQP_HEADERS_MESSAGE_TTL), Some(&json!(1500)));
        assert_eq!(args.get(AMQP_HEADERS_EXPIRES), Some(&json!(3000)));
        assert_eq!(args.get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE), Some(&json!("messages")));
        assert_eq!(args.get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY), Some(&json!("orders")));
    }

    #[test]
    fn delay_queues_are_kept_apart_per_exchange() {
        assert_eq!(delay_queue_name("", "orders", 500), "orders.delay.500");
        assert_ne!(
            delay_queue_name("billing", "orders", 500),
            delay_queue_name("shipping", "orders", 500)
        );
    }

    #[test]
    fn named_arguments_override_params() {
        let def = QueueDefinition::new("jobs")
            .params(Headers::from([
                (AMQP_HEADERS_MAX_LENGTH.to_owned(), json!(1)),
                ("x-queue-mode".to_owned(), json!("lazy")),
            ]))
            .max_length(50);

        let args = def.arguments();
        assert_eq!(args.get(AMQP_HEADERS_MAX_LENGTH), Some(&json!(50)));
        assert_eq!(args.get("x-queue-mode"), Some(&json!("lazy")));
    }
}
