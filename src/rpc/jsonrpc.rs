// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! JSON-RPC 2.0 bodies: the client side batch, the responses it reads back, and
//! the error objects both sides exchange.

use crate::errors::{RpcError, VALIDATION_ERROR};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const VERSION: &str = "2.0";

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Query { id: Value, method: String, args: Vec<Value> },
    Notification { method: String, args: Vec<Value> },
}

impl Call {
    fn to_value(&self) -> Value {
        match self {
            Call::Query { id, method, args } => {
                json!({ "jsonrpc": VERSION, "id": id, "method": method, "params": args })
            }
            Call::Notification { method, args } => {
                json!({ "jsonrpc": VERSION, "method": method, "params": args })
            }
        }
    }
}

/// Calls accumulated for one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    calls: Vec<Call>,
}

impl Batch {
    /// Adds a call that expects a response identified by `id`.
    pub fn query(mut self, id: impl Into<Value>, method: &str, args: Vec<Value>) -> Self {
        self.calls.push(Call::Query {
            id: id.into(),
            method: method.to_owned(),
            args,
        });
        self
    }

    /// Adds a call without response slot.
    pub fn notify(mut self, method: &str, args: Vec<Value>) -> Self {
        self.calls.push(Call::Notification {
            method: method.to_owned(),
            args,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Whether at least one call waits for a response.
    pub fn expects_reply(&self) -> bool {
        self.calls
            .iter()
            .any(|call| matches!(call, Call::Query { .. }))
    }

    /// Puts `responses` in the order of the queries they answer.
    ///
    /// Servers may answer a batch in any order. Responses with an id no query
    /// carries keep their relative order after the matched ones.
    pub fn in_order(&self, mut responses: Vec<Response>) -> Vec<Response> {
        let position = |id: &Value| {
            self.calls
                .iter()
                .filter_map(|call| match call {
                    Call::Query { id, .. } => Some(id),
                    Call::Notification { .. } => None,
                })
                .position(|query| query == id)
                .unwrap_or(usize::MAX)
        };

        responses.sort_by_key(|response| position(&response.id));
        responses
    }

    /// A single call is sent as an object, several as an array.
    pub fn encode(&self) -> String {
        match self.calls.as_slice() {
            [call] => call.to_value().to_string(),
            calls => Value::Array(calls.iter().map(Call::to_value).collect()).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i64, message: &str) -> ErrorObject {
        ErrorObject {
            code,
            message: message.to_owned(),
            data: None,
        }
    }
}

impl From<ErrorObject> for RpcError {
    fn from(error: ErrorObject) -> Self {
        if error.code == VALIDATION_ERROR {
            return RpcError::Validation {
                code: error.code,
                message: error.message,
                errors: error.data,
            };
        }

        RpcError::Request {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}

/// One entry of a response batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: Value,
    pub outcome: Result<Value, ErrorObject>,
}

impl Response {
    pub fn result(id: Value, value: Value) -> Response {
        Response {
            id,
            outcome: Ok(value),
        }
    }

    pub fn error(id: Value, error: ErrorObject) -> Response {
        Response {
            id,
            outcome: Err(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }

    /// The value, or the error promoted to its `RpcError` kind.
    pub fn into_value(self) -> Result<Value, RpcError> {
        self.outcome.map_err(RpcError::from)
    }

    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("jsonrpc".to_owned(), Value::from(VERSION));
        object.insert("id".to_owned(), self.id.clone());
        match &self.outcome {
            Ok(value) => object.insert("result".to_owned(), value.clone()),
            Err(error) => object.insert("error".to_owned(), json!(error)),
        };

        Value::Object(object)
    }
}

/// Reads a response body, a single object or an array of them.
pub fn decode_responses(body: &str) -> Result<Vec<Response>, RpcError> {
    let invalid = |reason: &str| RpcError::Server(format!("failed to decode the response: {reason}"));

    let value: Value = serde_json::from_str(body).map_err(|err| invalid(&err.to_string()))?;
    let entries = match value {
        Value::Array(entries) => entries,
        entry @ Value::Object(_) => vec![entry],
        _ => return Err(invalid("not an object or an array")),
    };

    entries
        .into_iter()
        .map(|entry| {
            let Value::Object(mut entry) = entry else {
                return Err(invalid("entry is not an object"));
            };
            let id = entry.remove("id").unwrap_or(Value::Null);

            if let Some(error) = entry.remove("error") {
                let error: ErrorObject =
                    serde_json::from_value(error).map_err(|err| invalid(&err.to_string()))?;
                return Ok(Response::error(id, error));
            }

            match entry.remove("result") {
                Some(value) => Ok(Response::result(id, value)),
                None => Err(invalid("entry has neither result nor error")),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_single_call_as_object() {
        let batch = Batch::default().query(1, "sum", vec![json!(1), json!(2)]);

        let body: Value = serde_json::from_str(&batch.encode()).unwrap();
        assert_eq!(
            body,
            json!({"jsonrpc": "2.0", "id": 1, "method": "sum", "params": [1, 2]})
        );
        assert!(batch.expects_reply());
    }

    #[test]
    fn notifications_have_no_id() {
        let batch = Batch::default()
            .notify("log", vec![json!("a")])
            .notify("log", vec![json!("b")]);

        let body: Value = serde_json::from_str(&batch.encode()).unwrap();
        assert_eq!(body.as_array().unwrap().len(), 2);
        assert!(body[0].get("id").is_none());
        assert!(!batch.expects_reply());
    }

    #[test]
    fn decodes_results_and_errors() {
        let responses = decode_responses(
            r#"[
                {"jsonrpc": "2.0", "id": 1, "result": null},
                {"jsonrpc": "2.0", "id": 2, "error": {"code": -30422, "message": "invalid", "data": {"name": ["required"]}}},
                {"jsonrpc": "2.0", "id": 3, "error": {"code": -32601, "message": "Method not found"}}
            ]"#,
        )
        .unwrap();

        assert_eq!(responses[0], Response::result(json!(1), Value::Null));
        assert_eq!(
            responses[1].clone().into_value(),
            Err(RpcError::Validation {
                code: VALIDATION_ERROR,
                message: "invalid".to_owned(),
                errors: Some(json!({"name": ["required"]})),
            })
        );
        assert_eq!(
            responses[2].clone().into_value(),
            Err(RpcError::Request {
                code: -32601,
                message: "Method not found".to_owned(),
                data: None,
            })
        );
    }

    #[test]
    fn orders_responses_like_the_queries() {
        let batch = Batch::default()
            .query("a", "sum", vec![])
            .notify("log", vec![])
            .query("b", "sum", vec![]);

        let responses = batch.in_order(vec![
            Response::result(json!("x"), json!(0)),
            Response::result(json!("b"), json!(2)),
            Response::result(json!("a"), json!(1)),
        ]);

        let ids: Vec<_> = responses.iter().map(|response| response.id.clone()).collect();
        assert_eq!(ids, vec![json!("a"), json!("b"), json!("x")]);
    }

    #[test]
    fn rejects_malformed_responses() {
        assert!(matches!(decode_responses("nope"), Err(RpcError::Server(_))));
        assert!(matches!(
            decode_responses(r#"{"jsonrpc": "2.0", "id": 1}"#),
            Err(RpcError::Server(_))
        ));
    }
}
