// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! This module provides the error taxonomy of the messenger. Broker faults are
//! `AmqpError`, wire-format faults are `CodecError`, option validation faults are
//! `ConfigError`, and the remote procedure call layer has `RpcError` on the client
//! side and `EvaluatorError` on the server side.

use serde_json::Value;
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// A "not found" answer to an existence probe is never an `AmqpError`, it is a
/// plain `false`. Everything else the broker refuses ends up here.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error deleting an exchange with the given name
    #[error("failure to delete an exchange `{0}`")]
    DeleteExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error purging a queue with the given name
    #[error("failure to purge a queue `{0}`")]
    PurgeQueueError(String),

    /// Error probing the broker for an exchange or a queue
    #[error("failure to probe `{0}`")]
    ProbeError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Publishing did not complete within the configured write timeout
    #[error("publish timed out")]
    PublishTimeout,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// The envelope carries no delivery handle, it was never received from the broker
    #[error("no delivery handle found on the envelope")]
    MissingDeliveryHandle,

    /// The delivery was already acked or nacked
    #[error("delivery `{0}` was already settled")]
    DeliveryAlreadySettled(u64),

    /// Error declaring a consumer
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error encoding or decoding an envelope
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Errors raised while converting envelopes to and from their wire form.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("message type not found in headers")]
    MissingMessageType,

    #[error("unsupported message type: {0}")]
    UnsupportedMessageType(String),

    #[error("unsupported content type for {kind}: {content_type}")]
    UnsupportedContentType { kind: String, content_type: String },

    #[error("event name not found in headers")]
    MissingEventName,

    #[error("failure to decode payload: {0}")]
    InvalidPayload(String),

    #[error("failure to encode payload: {0}")]
    EncodePayload(String),
}

/// Errors raised while validating connection or worker options.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid option(s) passed to the AMQP transport: {0}")]
    InvalidOptions(String),

    #[error("integer expected for queue argument `{key}`, `{given}` given")]
    NonIntegerArgument { key: String, given: String },

    #[error("no CA certificate has been provided, set `cacert` to use TLS")]
    MissingCaCert,

    #[error("option `{0}` must be a positive integer")]
    NonPositiveLimit(&'static str),

    #[error("invalid memory limit `{0}`")]
    InvalidMemoryLimit(String),

    #[error("unsupported exchange type `{0}`")]
    UnsupportedExchangeType(String),

    #[error("TLS option `{0}` is not supported by the connector")]
    UnsupportedTlsOption(&'static str),

    #[error("method `{0}` is already defined")]
    DuplicateMethod(String),
}

/// Errors surfaced to the caller of a remote procedure.
#[derive(Error, Debug, PartialEq)]
pub enum RpcError {
    /// No correlated reply arrived before the deadline
    #[error("the server took too long to respond")]
    Timeout,

    /// The reply could not be decoded
    #[error("server error: {0}")]
    Server(String),

    /// The remote side rejected the arguments with field level messages
    #[error("{message}")]
    Validation {
        code: i64,
        message: String,
        errors: Option<Value>,
    },

    /// Any other error answered by the remote side
    #[error("{message}")]
    Request {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error(transparent)]
    Transport(#[from] AmqpError),
}

/// JSON-RPC error code of a request whose body is not valid JSON.
pub const PARSE_ERROR: i64 = -32700;
/// JSON-RPC error code of a structurally invalid request.
pub const INVALID_REQUEST: i64 = -32600;
/// JSON-RPC error code of an unknown method.
pub const INVALID_METHOD: i64 = -32601;
/// JSON-RPC error code of rejected arguments.
pub const INVALID_ARGUMENTS: i64 = -32602;
/// Error code reserved for field validation failures.
pub const VALIDATION_ERROR: i64 = -30422;

/// Server side procedure errors.
///
/// `MethodNotFound` means the call never executed, `Application` means it executed
/// and failed. Clients branch on the code carried by each variant.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluatorError {
    #[error("method not found")]
    MethodNotFound(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{message}")]
    Application {
        code: i64,
        message: String,
        data: Option<Value>,
    },
}

impl EvaluatorError {
    pub fn code(&self) -> i64 {
        match self {
            EvaluatorError::MethodNotFound(_) => INVALID_METHOD,
            EvaluatorError::InvalidArguments(_) => INVALID_ARGUMENTS,
            EvaluatorError::Application { code, .. } => *code,
        }
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            EvaluatorError::Application { data, .. } => data.as_ref(),
            _ => None,
        }
    }
}
