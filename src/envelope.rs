// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Envelopes
//!
//! An `Envelope` is a logical message plus its stamps. Stamps are named optional
//! fields instead of an open list: setting one replaces the previous value, header
//! stamps are merged with the newest value winning. Envelopes are values; every
//! `with_*` call returns a new envelope.

use crate::{
    broker::RawDelivery,
    errors::AmqpError,
    headers::{self, Headers},
};
use lapin::{
    types::{FieldTable, ShortString},
    BasicProperties,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// A named event and its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub payload: Value,
    #[serde(default)]
    pub headers: Headers,
}

impl Event {
    pub fn new(name: &str, payload: Value) -> Event {
        Event {
            name: name.to_owned(),
            payload,
            headers: Headers::new(),
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Event {
        self.headers = headers;
        self
    }
}

/// A JSON-RPC request or response batch, kept as raw JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcMessage {
    pub body: String,
    #[serde(default)]
    pub headers: Headers,
}

/// The logical message carried by an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    /// Fire-and-forget command handled by name
    Command { name: String, payload: Value },
    /// Event on its way out
    EventPublish(Event),
    /// Event as received by a listener
    EventReceive(Event),
    Request(RpcMessage),
    Response(RpcMessage),
    /// A delivery that could not be decoded
    Raw { body: Vec<u8>, headers: Headers },
}

impl Message {
    pub fn command(name: &str, payload: Value) -> Message {
        Message::Command {
            name: name.to_owned(),
            payload,
        }
    }

    /// Wire discriminator of the message.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Command { .. } => "message",
            Message::EventPublish(_) | Message::EventReceive(_) => "event",
            Message::Request(_) => "request",
            Message::Response(_) => "response",
            Message::Raw { .. } => "raw",
        }
    }
}

/// Broker attributes of a message, all optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageAttributes {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Milliseconds, as a decimal string
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub headers: Option<Headers>,
}

impl MessageAttributes {
    pub fn from_properties(props: &BasicProperties) -> MessageAttributes {
        let text = |value: &Option<ShortString>| value.as_ref().map(|s| s.as_str().to_owned());

        MessageAttributes {
            content_type: text(props.content_type()),
            content_encoding: text(props.content_encoding()),
            delivery_mode: *props.delivery_mode(),
            priority: *props.priority(),
            correlation_id: text(props.correlation_id()),
            reply_to: text(props.reply_to()),
            expiration: text(props.expiration()),
            message_id: text(props.message_id()),
            timestamp: *props.timestamp(),
            kind: text(props.kind()),
            user_id: text(props.user_id()),
            app_id: text(props.app_id()),
            headers: props.headers().as_ref().map(headers::from_field_table),
        }
    }

    /// Fills every absent attribute from `other`; present values are kept.
    pub fn merge_missing(mut self, other: &MessageAttributes) -> MessageAttributes {
        fn fill<T: Clone>(slot: &mut Option<T>, other: &Option<T>) {
            if slot.is_none() {
                slot.clone_from(other);
            }
        }

        fill(&mut self.content_type, &other.content_type);
        fill(&mut self.content_encoding, &other.content_encoding);
        fill(&mut self.delivery_mode, &other.delivery_mode);
        fill(&mut self.priority, &other.priority);
        fill(&mut self.correlation_id, &other.correlation_id);
        fill(&mut self.reply_to, &other.reply_to);
        fill(&mut self.expiration, &other.expiration);
        fill(&mut self.message_id, &other.message_id);
        fill(&mut self.timestamp, &other.timestamp);
        fill(&mut self.kind, &other.kind);
        fill(&mut self.user_id, &other.user_id);
        fill(&mut self.app_id, &other.app_id);
        fill(&mut self.headers, &other.headers);
        self
    }

    /// Overrides attributes with every value present in `other`.
    pub fn merge_over(self, other: &MessageAttributes) -> MessageAttributes {
        other.clone().merge_missing(&self)
    }

    /// Builds the lapin properties, `headers` becoming the application headers.
    pub fn to_properties(&self, headers: &Headers) -> BasicProperties {
        let mut props = BasicProperties::default();
        let short = |value: &str| ShortString::from(value.to_owned());

        if let Some(v) = &self.content_type {
            props = props.with_content_type(short(v));
        }
        if let Some(v) = &self.content_encoding {
            props = props.with_content_encoding(short(v));
        }
        if let Some(v) = self.delivery_mode {
            props = props.with_delivery_mode(v);
        }
        if let Some(v) = self.priority {
            props = props.with_priority(v);
        }
        if let Some(v) = &self.correlation_id {
            props = props.with_correlation_id(short(v));
        }
        if let Some(v) = &self.reply_to {
            props = props.with_reply_to(short(v));
        }
        if let Some(v) = &self.expiration {
            props = props.with_expiration(short(v));
        }
        if let Some(v) = &self.message_id {
            props = props.with_message_id(short(v));
        }
        if let Some(v) = self.timestamp {
            props = props.with_timestamp(v);
        }
        if let Some(v) = &self.kind {
            props = props.with_kind(short(v));
        }
        if let Some(v) = &self.user_id {
            props = props.with_user_id(short(v));
        }
        if let Some(v) = &self.app_id {
            props = props.with_app_id(short(v));
        }

        let table: FieldTable = headers::to_field_table(headers);
        props.with_headers(table)
    }
}

/// Routing override and broker attributes for the next publish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AmqpStamp {
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
    pub attributes: MessageAttributes,
    retry_attempt: bool,
}

impl AmqpStamp {
    pub fn new(exchange: Option<&str>, routing_key: Option<&str>) -> AmqpStamp {
        AmqpStamp {
            exchange: exchange.map(str::to_owned),
            routing_key: routing_key.map(str::to_owned),
            attributes: MessageAttributes::default(),
            retry_attempt: false,
        }
    }

    /// Stamp for re-publishing a received delivery.
    ///
    /// Attributes of `previous` win over the ones of the delivery. With a
    /// `retry_routing_key` the message goes back to that key and the stamp is
    /// flagged as a retry attempt.
    pub fn from_delivery(
        delivery: &DeliveryHandle,
        previous: Option<&AmqpStamp>,
        retry_routing_key: Option<&str>,
    ) -> AmqpStamp {
        let mut attributes = previous
            .map(|stamp| stamp.attributes.clone())
            .unwrap_or_default()
            .merge_missing(&delivery.attributes);
        if attributes.headers.is_none() {
            attributes.headers = Some(Headers::new());
        }

        match retry_routing_key {
            None => AmqpStamp {
                exchange: Some(delivery.exchange.clone()),
                routing_key: previous
                    .and_then(|stamp| stamp.routing_key.clone())
                    .or_else(|| Some(delivery.routing_key.clone())),
                attributes,
                retry_attempt: false,
            },
            Some(key) => AmqpStamp {
                exchange: Some(delivery.exchange.clone()),
                routing_key: Some(key.to_owned()),
                attributes,
                retry_attempt: true,
            },
        }
    }

    /// Copy of `previous` with `attributes` layered over its attributes.
    pub fn with_attributes(attributes: MessageAttributes, previous: Option<&AmqpStamp>) -> AmqpStamp {
        let base = previous.cloned().unwrap_or_default();
        AmqpStamp {
            attributes: base.attributes.merge_over(&attributes),
            ..base
        }
    }

    pub fn is_retry_attempt(&self) -> bool {
        self.retry_attempt
    }
}

/// Marker of a message sent again after a failed handling.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RedeliveryStamp {
    pub retry_count: u32,
}

/// The broker side of one physical delivery.
///
/// Exactly one handle exists per delivery and it settles once, by ack or nack.
#[derive(Debug)]
pub struct DeliveryHandle {
    pub delivery_tag: u64,
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub attributes: MessageAttributes,
    settled: AtomicBool,
}

impl DeliveryHandle {
    pub fn new(delivery: &RawDelivery, queue: &str) -> DeliveryHandle {
        DeliveryHandle {
            delivery_tag: delivery.delivery_tag,
            queue: queue.to_owned(),
            exchange: delivery.exchange.clone(),
            routing_key: delivery.routing_key.clone(),
            redelivered: delivery.redelivered,
            attributes: MessageAttributes::from_properties(&delivery.properties),
            settled: AtomicBool::new(false),
        }
    }

    /// Native application headers of the delivery.
    pub fn headers(&self) -> Headers {
        self.attributes.headers.clone().unwrap_or_default()
    }

    /// Marks the delivery as settled, failing if it already was.
    pub fn settle(&self) -> Result<(), AmqpError> {
        self.settled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| AmqpError::DeliveryAlreadySettled(self.delivery_tag))
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }
}

/// Metadata attached to an envelope.
///
/// Only `headers`, `delay_ms` and `redelivery` travel with the generic encoding,
/// the rest is local to the process that set it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stamps {
    #[serde(skip)]
    pub amqp: Option<AmqpStamp>,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub redelivery: Option<RedeliveryStamp>,
    #[serde(skip)]
    pub received: Option<Arc<DeliveryHandle>>,
    #[serde(skip)]
    pub no_auto_ack: Option<String>,
    #[serde(skip)]
    pub flush_batches: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    message: Message,
    #[serde(default)]
    stamps: Stamps,
}

impl Envelope {
    pub fn new(message: Message) -> Envelope {
        Envelope {
            message,
            stamps: Stamps::default(),
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn stamps(&self) -> &Stamps {
        &self.stamps
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    pub fn with_message(mut self, message: Message) -> Envelope {
        self.message = message;
        self
    }

    pub fn with_amqp(mut self, stamp: AmqpStamp) -> Envelope {
        self.stamps.amqp = Some(stamp);
        self
    }

    /// Adds a header stamp, its values win over earlier ones.
    pub fn with_headers(mut self, headers: Headers) -> Envelope {
        self.stamps.headers = headers::merge([&self.stamps.headers, &headers]);
        self
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Envelope {
        self.stamps.delay_ms = delay_ms;
        self
    }

    pub fn with_redelivery(mut self, stamp: RedeliveryStamp) -> Envelope {
        self.stamps.redelivery = Some(stamp);
        self
    }

    pub fn with_received(mut self, handle: Arc<DeliveryHandle>) -> Envelope {
        self.stamps.received = Some(handle);
        self
    }

    /// Defers the acknowledgement of this delivery to the batch `key`.
    pub fn with_no_auto_ack(mut self, key: &str) -> Envelope {
        self.stamps.no_auto_ack = Some(key.to_owned());
        self
    }

    /// Asks the worker to flush its deferred batches after this delivery.
    pub fn with_flush_batches(mut self) -> Envelope {
        self.stamps.flush_batches = true;
        self
    }

    pub fn without_flush_batches(mut self) -> Envelope {
        self.stamps.flush_batches = false;
        self
    }

    pub fn amqp(&self) -> Option<&AmqpStamp> {
        self.stamps.amqp.as_ref()
    }

    pub fn delivery(&self) -> Option<&Arc<DeliveryHandle>> {
        self.stamps.received.as_ref()
    }

    pub fn is_redelivered(&self) -> bool {
        self.stamps.redelivery.is_some()
    }

    /// Every header visible on the envelope.
    ///
    /// Attribute headers of the routing stamp, then the native headers of the
    /// received delivery, then the header stamps; later sources win.
    pub fn all_headers(&self) -> Headers {
        let empty = Headers::new();
        let attributes = self
            .amqp()
            .and_then(|stamp| stamp.attributes.headers.as_ref())
            .unwrap_or(&empty);
        let native = self.delivery().map(|d| d.headers()).unwrap_or_default();

        headers::merge([attributes, &native, &self.stamps.headers])
    }

    /// Reads a single header from `all_headers`.
    pub fn header(&self, name: &str) -> Option<Value> {
        self.all_headers().remove(name)
    }
}
