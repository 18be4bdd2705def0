// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Request Handler
//!
//! Server side of the remote procedure calls. A request body is evaluated call by
//! call and the response batch is published to the `reply_to` address of the
//! delivery, under the correlation id of the request.

use crate::{
    envelope::{AmqpStamp, Envelope, Message, MessageAttributes, RpcMessage},
    errors::{AmqpError, EvaluatorError, INVALID_REQUEST, PARSE_ERROR},
    headers::Headers,
    publisher::AmqpSender,
    topology::DELIVERY_MODE_PERSISTENT,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{
    evaluator::Evaluator,
    jsonrpc::{ErrorObject, Response, VERSION},
};

pub struct RequestHandler {
    evaluator: Arc<Evaluator>,
    sender: Arc<AmqpSender>,
}

impl RequestHandler {
    pub fn new(evaluator: Arc<Evaluator>, sender: Arc<AmqpSender>) -> RequestHandler {
        RequestHandler { evaluator, sender }
    }

    /// Answers a received request envelope.
    ///
    /// Nothing is published when the body holds notifications only.
    pub async fn handle(&self, envelope: &Envelope) -> Result<(), AmqpError> {
        let Message::Request(request) = envelope.message() else {
            warn!(kind = envelope.message().kind(), "not a request, ignoring");
            return Ok(());
        };

        let Some(body) = self.reply(&request.body).await else {
            debug!("notifications only, nothing to reply");
            return Ok(());
        };

        let attributes = envelope.delivery().map(|handle| &handle.attributes);
        let Some(reply_to) = attributes.and_then(|a| a.reply_to.as_deref()) else {
            warn!("request without reply_to, dropping the response");
            return Ok(());
        };

        let mut stamp = AmqpStamp::new(Some(""), Some(reply_to));
        stamp.attributes = MessageAttributes {
            delivery_mode: Some(DELIVERY_MODE_PERSISTENT),
            correlation_id: attributes.and_then(|a| a.correlation_id.clone()),
            ..MessageAttributes::default()
        };

        let response = Envelope::new(Message::Response(RpcMessage {
            body,
            headers: Headers::new(),
        }))
        .with_amqp(stamp);

        self.sender.send(response).await?;

        Ok(())
    }

    /// Evaluates a JSON-RPC body and returns the response body, if any.
    pub async fn reply(&self, body: &str) -> Option<String> {
        let request: Value = match serde_json::from_str(body) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = err.to_string(), "unparsable request");
                let error = ErrorObject::new(PARSE_ERROR, "Parse error");
                return Some(Response::error(Value::Null, error).to_value().to_string());
            }
        };

        match request {
            Value::Array(calls) if !calls.is_empty() => {
                let mut responses = Vec::with_capacity(calls.len());
                for call in calls {
                    if let Some(response) = self.evaluate(call).await {
                        responses.push(response.to_value());
                    }
                }

                (!responses.is_empty()).then(|| Value::Array(responses).to_string())
            }
            call => self
                .evaluate(call)
                .await
                .map(|response| response.to_value().to_string()),
        }
    }

    /// Runs one call; notifications yield no response.
    async fn evaluate(&self, call: Value) -> Option<Response> {
        let invalid = || {
            Some(Response::error(
                Value::Null,
                ErrorObject::new(INVALID_REQUEST, "Invalid Request"),
            ))
        };

        let Value::Object(mut call) = call else {
            return invalid();
        };
        if call.get("jsonrpc") != Some(&Value::from(VERSION)) {
            return invalid();
        }
        let Some(Value::String(method)) = call.remove("method") else {
            return invalid();
        };

        let id = call.remove("id");
        if matches!(id, Some(Value::Array(_) | Value::Object(_) | Value::Bool(_))) {
            return invalid();
        }

        let args = match call.remove("params") {
            None => vec![],
            Some(Value::Array(args)) => args,
            Some(named @ Value::Object(_)) => vec![named],
            Some(_) => return invalid(),
        };

        let outcome = self.evaluator.evaluate(&method, args).await;
        if let Err(err) = &outcome {
            warn!(method, error = err.to_string(), "procedure failed");
        }

        let id = id?;
        Some(match outcome {
            Ok(value) => Response::result(id, value),
            Err(err) => Response::error(id, error_object(&err)),
        })
    }
}

fn error_object(err: &EvaluatorError) -> ErrorObject {
    ErrorObject {
        code: err.code(),
        message: err.to_string(),
        data: err.data().cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{MockBroker, RawDelivery},
        codec,
        config::AmqpConfig,
        consumer::{receive, Received},
        headers::{get_str, to_field_table, HEADER_MESSAGE_TYPE},
        rpc::evaluator::{Procedure, ProcedureError, Target},
        topology::AmqpTopology,
    };
    use async_trait::async_trait;
    use lapin::{types::ShortString, BasicProperties};
    use serde_json::json;

    struct Calculator;

    #[async_trait]
    impl Procedure for Calculator {
        async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, ProcedureError> {
            match method {
                "sum" => Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>())),
                _ => Err(EvaluatorError::Application {
                    code: 7,
                    message: "overflow".to_owned(),
                    data: Some(json!({"limit": 10})),
                }
                .into()),
            }
        }
    }

    fn handler(broker: MockBroker) -> RequestHandler {
        let mut evaluator = Evaluator::new();
        evaluator
            .add_method("sum", Target::service(Arc::new(Calculator), "sum"))
            .unwrap();
        evaluator
            .add_method("explode", Target::service(Arc::new(Calculator), "explode"))
            .unwrap();

        let topology = Arc::new(AmqpTopology::new(AmqpConfig::default(), Arc::new(broker)));
        RequestHandler::new(Arc::new(evaluator), Arc::new(AmqpSender::new(topology)))
    }

    fn request(body: &str) -> Envelope {
        let envelope = Envelope::new(Message::Request(RpcMessage {
            body: body.to_owned(),
            headers: Headers::new(),
        }));
        let encoded = codec::encode(&envelope).unwrap();
        let raw = RawDelivery {
            delivery_tag: 1,
            properties: BasicProperties::default()
                .with_correlation_id(ShortString::from("c-1"))
                .with_reply_to(ShortString::from("amq.rabbitmq.reply-to.g1h2"))
                .with_headers(to_field_table(&encoded.headers)),
            data: encoded.body,
            ..RawDelivery::default()
        };

        let Received::Decoded(envelope) = receive(raw, "calculator") else {
            panic!("request should decode");
        };
        envelope
    }

    #[tokio::test]
    async fn replies_to_the_caller() {
        let mut broker = MockBroker::new();
        broker.expect_is_connected().returning(|| true);
        broker
            .expect_publish()
            .withf(|msg| {
                let body: Value = serde_json::from_slice(&msg.body).unwrap();
                msg.exchange.is_empty()
                    && msg.routing_key == "amq.rabbitmq.reply-to.g1h2"
                    && msg.properties.correlation_id().as_ref().map(|c| c.as_str()) == Some("c-1")
                    && get_str(&msg.headers(), HEADER_MESSAGE_TYPE) == Some("response")
                    && body == json!({"jsonrpc": "2.0", "id": 1, "result": 5})
            })
            .times(1)
            .returning(|_| Ok(()));

        handler(broker)
            .handle(&request(
                r#"{"jsonrpc": "2.0", "id": 1, "method": "sum", "params": [2, 3]}"#,
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn notifications_get_no_reply() {
        let mut broker = MockBroker::new();
        broker.expect_publish().never();

        handler(broker)
            .handle(&request(
                r#"[{"jsonrpc": "2.0", "method": "sum", "params": [1]}]"#,
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn maps_errors_to_json_rpc_codes() {
        let handler = handler(MockBroker::new());

        let parse: Value = serde_json::from_str(&handler.reply("{").await.unwrap()).unwrap();
        assert_eq!(parse["error"]["code"], json!(PARSE_ERROR));

        let batch: Value = serde_json::from_str(
            &handler
                .reply(
                    r#"[
                        {"jsonrpc": "2.0", "id": 1, "method": "nope"},
                        {"jsonrpc": "2.0", "id": 2, "method": "explode"},
                        {"jsonrpc": "1.0", "id": 3, "method": "sum"},
                        {"jsonrpc": "2.0", "method": "sum"}
                    ]"#,
                )
                .await
                .unwrap(),
        )
        .unwrap();

        assert_eq!(batch.as_array().unwrap().len(), 3);
        assert_eq!(batch[0]["error"]["code"], json!(-32601));
        assert_eq!(
            batch[1]["error"],
            json!({"code": 7, "message": "overflow", "data": {"limit": 10}})
        );
        assert_eq!(batch[2]["error"]["code"], json!(INVALID_REQUEST));
    }
}
