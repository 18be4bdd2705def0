// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Wire Codec
//!
//! Converts envelopes to a body and a header map and back. The `X-Message-Type`
//! header selects the decoding path:
//!
//! - `message`: the whole envelope serialized with serde, opaque to other services
//! - `event`: JSON payload, event name in `X-Event-Name`
//! - `request` / `response`: JSON-RPC batch kept as raw text, decoded by the RPC layer
//!
//! A redelivered envelope always takes the `message` path so a retry carries the
//! exact payload it failed with.

use crate::{
    envelope::{Envelope, Event, Message, RpcMessage},
    errors::CodecError,
    headers::{self, get_str, Headers, HEADER_CONTENT_TYPE, HEADER_EVENT_NAME, HEADER_MESSAGE_TYPE},
};
use serde_json::Value;

/// Content type of JSON bodies
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type of the generic envelope encoding
pub const SERIALIZED_CONTENT_TYPE: &str = "application/x-serialized-envelope";

pub const TYPE_MESSAGE: &str = "message";
pub const TYPE_EVENT: &str = "event";
pub const TYPE_REQUEST: &str = "request";
pub const TYPE_RESPONSE: &str = "response";

/// Body and headers of an encoded envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedMessage {
    pub body: Vec<u8>,
    pub headers: Headers,
}

pub fn encode(envelope: &Envelope) -> Result<EncodedMessage, CodecError> {
    if envelope.is_redelivered() {
        return encode_message(envelope);
    }

    match envelope.message() {
        Message::EventPublish(event) | Message::EventReceive(event) => {
            encode_event(event, &stamp_headers(envelope))
        }
        Message::Request(rpc) => Ok(encode_rpc(rpc, &stamp_headers(envelope), TYPE_REQUEST)),
        Message::Response(rpc) => Ok(encode_rpc(rpc, &stamp_headers(envelope), TYPE_RESPONSE)),
        _ => encode_message(envelope),
    }
}

pub fn decode(body: &[u8], headers: &Headers) -> Result<Envelope, CodecError> {
    let Some(kind) = get_str(headers, HEADER_MESSAGE_TYPE) else {
        return Err(CodecError::MissingMessageType);
    };

    match kind {
        TYPE_MESSAGE => {
            require_content_type(headers, "message", SERIALIZED_CONTENT_TYPE)?;
            serde_json::from_slice::<Envelope>(body)
                .map_err(|err| CodecError::InvalidPayload(err.to_string()))
        }
        TYPE_EVENT => {
            require_content_type(headers, "event", JSON_CONTENT_TYPE)?;
            let name = get_str(headers, HEADER_EVENT_NAME).ok_or(CodecError::MissingEventName)?;
            let payload = serde_json::from_slice::<Value>(body)
                .map_err(|err| CodecError::InvalidPayload(err.to_string()))?;

            Ok(Envelope::new(Message::EventReceive(
                Event::new(name, payload).with_headers(headers.clone()),
            )))
        }
        TYPE_REQUEST => {
            require_content_type(headers, "RPC", JSON_CONTENT_TYPE)?;
            Ok(Envelope::new(Message::Request(rpc_message(body, headers)?)))
        }
        TYPE_RESPONSE => {
            require_content_type(headers, "RPC", JSON_CONTENT_TYPE)?;
            Ok(Envelope::new(Message::Response(rpc_message(body, headers)?)))
        }
        other => Err(CodecError::UnsupportedMessageType(other.to_owned())),
    }
}

/// Attribute headers of the routing stamp overlaid with the header stamps.
fn stamp_headers(envelope: &Envelope) -> Headers {
    let empty = Headers::new();
    let attributes = envelope
        .amqp()
        .and_then(|stamp| stamp.attributes.headers.as_ref())
        .unwrap_or(&empty);

    headers::merge([attributes, &envelope.stamps().headers])
}

fn encode_message(envelope: &Envelope) -> Result<EncodedMessage, CodecError> {
    let body =
        serde_json::to_vec(envelope).map_err(|err| CodecError::EncodePayload(err.to_string()))?;

    Ok(EncodedMessage {
        body,
        headers: Headers::from([
            (HEADER_MESSAGE_TYPE.to_owned(), Value::from(TYPE_MESSAGE)),
            (HEADER_CONTENT_TYPE.to_owned(), Value::from(SERIALIZED_CONTENT_TYPE)),
        ]),
    })
}

fn encode_event(event: &Event, stamped: &Headers) -> Result<EncodedMessage, CodecError> {
    let body = serde_json::to_vec(&event.payload)
        .map_err(|err| CodecError::EncodePayload(err.to_string()))?;

    let forced = Headers::from([
        (HEADER_MESSAGE_TYPE.to_owned(), Value::from(TYPE_EVENT)),
        (HEADER_EVENT_NAME.to_owned(), Value::from(event.name.clone())),
        (HEADER_CONTENT_TYPE.to_owned(), Value::from(JSON_CONTENT_TYPE)),
    ]);

    Ok(EncodedMessage {
        body,
        headers: headers::merge([&event.headers, stamped, &forced]),
    })
}

fn encode_rpc(rpc: &RpcMessage, stamped: &Headers, kind: &str) -> EncodedMessage {
    let forced = Headers::from([
        (HEADER_MESSAGE_TYPE.to_owned(), Value::from(kind)),
        (HEADER_CONTENT_TYPE.to_owned(), Value::from(JSON_CONTENT_TYPE)),
    ]);

    EncodedMessage {
        body: rpc.body.clone().into_bytes(),
        headers: headers::merge([&rpc.headers, stamped, &forced]),
    }
}

fn require_content_type(headers: &Headers, kind: &str, expected: &str) -> Result<(), CodecError> {
    match get_str(headers, HEADER_CONTENT_TYPE) {
        Some(content_type) if content_type == expected => Ok(()),
        other => Err(CodecError::UnsupportedContentType {
            kind: kind.to_owned(),
            content_type: other.unwrap_or_default().to_owned(),
        }),
    }
}

fn rpc_message(body: &[u8], headers: &Headers) -> Result<RpcMessage, CodecError> {
    let body = String::from_utf8(body.to_vec())
        .map_err(|err| CodecError::InvalidPayload(err.to_string()))?;

    Ok(RpcMessage {
        body,
        headers: headers.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::RedeliveryStamp;
    use serde_json::json;

    #[test]
    fn event_survives_the_wire() {
        let event = Event::new("user.created", json!({"id": 42, "tags": ["a", "b"]}))
            .with_headers(Headers::from([("tenant".to_owned(), json!("acme"))]));
        let envelope = Envelope::new(Message::EventPublish(event))
            .with_headers(Headers::from([("trace".to_owned(), json!("t-1"))]));

        let encoded = encode(&envelope).unwrap();
        assert_eq!(get_str(&encoded.headers, HEADER_MESSAGE_TYPE), Some("event"));
        assert_eq!(get_str(&encoded.headers, HEADER_EVENT_NAME), Some("user.created"));

        let decoded = decode(&encoded.body, &encoded.headers).unwrap();
        let Message::EventReceive(received) = decoded.message() else {
            panic!("expected a received event, got {:?}", decoded.message());
        };

        assert_eq!(received.name, "user.created");
        assert_eq!(received.payload, json!({"id": 42, "tags": ["a", "b"]}));
        assert_eq!(received.headers, encoded.headers);
        assert_eq!(received.headers.get("tenant"), Some(&json!("acme")));
        assert_eq!(received.headers.get("trace"), Some(&json!("t-1")));
    }

    #[test]
    fn stamped_headers_cannot_override_the_discriminator() {
        let envelope = Envelope::new(Message::Request(RpcMessage {
            body: "[]".to_owned(),
            headers: Headers::new(),
        }))
        .with_headers(Headers::from([(HEADER_MESSAGE_TYPE.to_owned(), json!("event"))]));

        let encoded = encode(&envelope).unwrap();
        assert_eq!(get_str(&encoded.headers, HEADER_MESSAGE_TYPE), Some("request"));
        assert_eq!(encoded.body, b"[]".to_vec());
    }

    #[test]
    fn redelivered_envelope_uses_generic_encoding() {
        let envelope = Envelope::new(Message::EventPublish(Event::new("x", json!(1))))
            .with_redelivery(RedeliveryStamp { retry_count: 1 });

        let encoded = encode(&envelope).unwrap();
        assert_eq!(get_str(&encoded.headers, HEADER_MESSAGE_TYPE), Some("message"));
        assert_eq!(
            get_str(&encoded.headers, HEADER_CONTENT_TYPE),
            Some(SERIALIZED_CONTENT_TYPE)
        );

        let decoded = decode(&encoded.body, &encoded.headers).unwrap();
        assert!(decoded.is_redelivered());
        assert!(matches!(decoded.message(), Message::EventPublish(e) if e.name == "x"));
    }

    #[test]
    fn command_round_trip_keeps_sendable_stamps() {
        let envelope = Envelope::new(Message::command("send-mail", json!({"to": "a@b.c"})))
            .with_headers(Headers::from([("k".to_owned(), json!("v"))]))
            .with_delay(500);

        let encoded = encode(&envelope).unwrap();
        let decoded = decode(&encoded.body, &encoded.headers).unwrap();

        assert_eq!(decoded.message(), envelope.message());
        assert_eq!(decoded.stamps().headers.get("k"), Some(&json!("v")));
        assert_eq!(decoded.stamps().delay_ms, 500);
    }

    #[test]
    fn missing_discriminator_fails() {
        let err = decode(b"{}", &Headers::new()).unwrap_err();
        assert_eq!(err, CodecError::MissingMessageType);
    }

    #[test]
    fn unsupported_discriminator_fails() {
        let headers = Headers::from([(HEADER_MESSAGE_TYPE.to_owned(), json!("audit"))]);

        let err = decode(b"{}", &headers).unwrap_err();
        assert_eq!(err, CodecError::UnsupportedMessageType("audit".to_owned()));
    }

    #[test]
    fn event_with_wrong_content_type_fails() {
        let headers = Headers::from([
            (HEADER_MESSAGE_TYPE.to_owned(), json!("event")),
            (HEADER_EVENT_NAME.to_owned(), json!("x")),
            (HEADER_CONTENT_TYPE.to_owned(), json!("text/plain")),
        ]);

        let err = decode(b"{}", &headers).unwrap_err();
        assert_eq!(
            err,
            CodecError::UnsupportedContentType {
                kind: "event".to_owned(),
                content_type: "text/plain".to_owned()
            }
        );
    }

    #[test]
    fn generic_message_requires_serialized_content_type() {
        let headers = Headers::from([
            (HEADER_MESSAGE_TYPE.to_owned(), json!("message")),
            (HEADER_CONTENT_TYPE.to_owned(), json!(JSON_CONTENT_TYPE)),
        ]);

        assert!(matches!(
            decode(b"{}", &headers),
            Err(CodecError::UnsupportedContentType { .. })
        ));
    }
}
