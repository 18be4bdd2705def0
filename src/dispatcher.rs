// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatcher
//!
//! The default `MessageBus` of the worker. Decoded envelopes are routed by kind:
//! requests go to the RPC request handler, received events to every listener
//! registered for their name, and commands to the handler registered for theirs.
//!
//! The registered event names are what the worker binds its queue to.

use crate::{
    envelope::{Envelope, Message},
    rpc::RequestHandler,
    worker::{HandlerFailure, MessageBus, Settlement},
};
use async_trait::async_trait;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tracing::{debug, error};

/// Handles one envelope and returns the envelope to acknowledge.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn exec(&self, envelope: Envelope) -> Result<Envelope, HandlerFailure>;
}

/// Settles the envelopes a handler deferred under a batch name.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn flush(&self, envelope: Envelope, force: bool) -> Result<Vec<Settlement>, HandlerFailure>;
}

#[derive(Default)]
pub struct Dispatcher {
    requests: Option<Arc<RequestHandler>>,
    events: BTreeMap<String, Vec<Arc<dyn EnvelopeHandler>>>,
    commands: HashMap<String, Arc<dyn EnvelopeHandler>>,
    batches: HashMap<String, Arc<dyn BatchHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher::default()
    }

    pub fn requests(mut self, handler: Arc<RequestHandler>) -> Self {
        self.requests = Some(handler);
        self
    }

    /// Adds a listener for the event `name`; listeners run in registration order.
    pub fn on_event(mut self, name: &str, handler: Arc<dyn EnvelopeHandler>) -> Self {
        self.events.entry(name.to_owned()).or_default().push(handler);
        self
    }

    /// Sets the handler of the command `name`, replacing any previous one.
    pub fn on_command(mut self, name: &str, handler: Arc<dyn EnvelopeHandler>) -> Self {
        self.commands.insert(name.to_owned(), handler);
        self
    }

    pub fn batch(mut self, name: &str, handler: Arc<dyn BatchHandler>) -> Self {
        self.batches.insert(name.to_owned(), handler);
        self
    }

    /// Names of the events with at least one listener, sorted.
    pub fn event_names(&self) -> Vec<String> {
        self.events.keys().cloned().collect()
    }
}

#[async_trait]
impl MessageBus for Dispatcher {
    async fn dispatch(&self, envelope: Envelope) -> Result<Envelope, HandlerFailure> {
        match envelope.message() {
            Message::Request(_) => {
                let Some(requests) = &self.requests else {
                    return Err(HandlerFailure::new("no request handler registered"));
                };

                if let Err(err) = requests.handle(&envelope).await {
                    error!(error = err.to_string(), "failure to answer request");
                    return Err(HandlerFailure::new(&err.to_string()));
                }

                Ok(envelope)
            }
            Message::EventReceive(event) | Message::EventPublish(event) => {
                let Some(listeners) = self.events.get(&event.name) else {
                    debug!(event = event.name, "no listener for event");
                    return Ok(envelope);
                };

                let mut envelope = envelope.clone();
                for listener in listeners {
                    envelope = listener.exec(envelope).await?;
                }

                Ok(envelope)
            }
            Message::Command { name, .. } => match self.commands.get(name) {
                Some(handler) => handler.exec(envelope.clone()).await,
                None => Err(HandlerFailure::new(&format!("no handler for message `{name}`"))),
            },
            Message::Response(_) | Message::Raw { .. } => Err(HandlerFailure::new(&format!(
                "no handler for `{}` messages",
                envelope.message().kind()
            ))),
        }
    }

    async fn flush(
        &self,
        batch: &str,
        envelope: Envelope,
        force: bool,
    ) -> Result<Vec<Settlement>, HandlerFailure> {
        match self.batches.get(batch) {
            Some(handler) => handler.flush(envelope, force).await,
            None => Err(HandlerFailure::new(&format!("no handler for batch `{batch}`"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Event;
    use serde_json::json;

    fn event(name: &str) -> Envelope {
        Envelope::new(Message::EventReceive(Event::new(name, json!({"id": 1}))))
    }

    #[tokio::test]
    async fn events_go_to_every_listener_in_order() {
        let mut first = MockEnvelopeHandler::new();
        first
            .expect_exec()
            .times(1)
            .returning(|envelope| Ok(envelope.with_no_auto_ack("digest")));
        let mut second = MockEnvelopeHandler::new();
        second
            .expect_exec()
            .withf(|envelope| envelope.stamps().no_auto_ack.as_deref() == Some("digest"))
            .times(1)
            .returning(Ok);

        let dispatcher = Dispatcher::new()
            .on_event("user.created", Arc::new(first))
            .on_event("user.created", Arc::new(second))
            .on_event("user.deleted", Arc::new(MockEnvelopeHandler::new()));

        let handled = dispatcher.dispatch(event("user.created")).await.unwrap();

        assert_eq!(handled.stamps().no_auto_ack.as_deref(), Some("digest"));
        assert_eq!(dispatcher.event_names(), vec!["user.created", "user.deleted"]);
    }

    #[tokio::test]
    async fn unknown_events_are_acknowledged() {
        let dispatcher = Dispatcher::new();
        assert!(dispatcher.dispatch(event("nobody.cares")).await.is_ok());
    }

    #[tokio::test]
    async fn commands_need_a_handler() {
        let mut handler = MockEnvelopeHandler::new();
        handler
            .expect_exec()
            .times(1)
            .returning(|_| Err(HandlerFailure::new("boom").stop_worker()));

        let dispatcher = Dispatcher::new().on_command("ping", Arc::new(handler));

        let failure = dispatcher
            .dispatch(Envelope::new(Message::command("ping", json!(null))))
            .await
            .unwrap_err();
        assert!(failure.stop_worker);

        let failure = dispatcher
            .dispatch(Envelope::new(Message::command("pong", json!(null))))
            .await
            .unwrap_err();
        assert_eq!(failure.message, "no handler for message `pong`");
    }

    #[tokio::test]
    async fn flush_goes_to_the_batch_handler() {
        let mut batch = MockBatchHandler::new();
        batch
            .expect_flush()
            .withf(|_, force| *force)
            .times(1)
            .returning(|envelope, _| Ok(vec![(envelope, None)]));

        let dispatcher = Dispatcher::new().batch("digest", Arc::new(batch));

        let settled = dispatcher.flush("digest", event("a"), true).await.unwrap();
        assert_eq!(settled.len(), 1);
        assert!(dispatcher.flush("other", event("a"), true).await.is_err());
    }
}
