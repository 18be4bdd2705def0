// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Client
//!
//! Sends JSON-RPC batches to a remote queue and waits for the correlated reply on
//! the broker's direct reply-to pseudo queue.
//!
//! Every request registers a ticket keyed by its correlation id before it is
//! published. One waiter at a time owns the reply stream and routes each reply to
//! the ticket it belongs to, so concurrent calls never lose each other's replies.

use crate::{
    consumer::{EnvelopeStream, Received},
    envelope::{AmqpStamp, Envelope, Message, MessageAttributes, RpcMessage},
    errors::{AmqpError, RpcError},
    headers::Headers,
    topology::DELIVERY_MODE_PERSISTENT,
    transport::AmqpTransport,
};
use futures_util::StreamExt;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{
    sync::{oneshot, Mutex as AsyncMutex},
    time::Instant,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::jsonrpc::{decode_responses, Batch, Response};

/// RabbitMQ direct reply-to pseudo queue.
pub const DIRECT_REPLY_TO: &str = "amq.rabbitmq.reply-to";

type Outcome = Result<Envelope, RpcError>;
type Tickets = HashMap<String, oneshot::Sender<Outcome>>;

/// The live reply consumer.
struct Replies {
    consumer_tag: String,
    stream: EnvelopeStream,
}

pub struct RpcClient {
    queue: String,
    transport: Arc<AmqpTransport>,
    read_timeout: Option<Duration>,
    batch: Mutex<Batch>,
    replies: AsyncMutex<Option<Replies>>,
    tickets: Mutex<Tickets>,
}

/// Withdraws a ticket once its caller stops waiting, whatever the reason.
struct PendingTicket<'a> {
    tickets: &'a Mutex<Tickets>,
    correlation_id: &'a str,
}

impl Drop for PendingTicket<'_> {
    fn drop(&mut self) {
        self.tickets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(self.correlation_id);
    }
}

impl RpcClient {
    /// A client for the procedures served on `queue`.
    pub fn new(queue: &str, transport: Arc<AmqpTransport>) -> RpcClient {
        let read_timeout = transport.topology().config().read_timeout();

        RpcClient {
            queue: queue.to_owned(),
            transport,
            read_timeout,
            batch: Mutex::new(Batch::default()),
            replies: AsyncMutex::new(None),
            tickets: Mutex::new(HashMap::new()),
        }
    }

    /// Queues a call expecting a response with `id`.
    pub fn query(&self, id: impl Into<Value>, method: &str, args: Vec<Value>) -> &Self {
        let mut batch = self.batch.lock().unwrap_or_else(PoisonError::into_inner);
        *batch = std::mem::take(&mut *batch).query(id, method, args);
        self
    }

    /// Queues a notification.
    pub fn notify(&self, method: &str, args: Vec<Value>) -> &Self {
        let mut batch = self.batch.lock().unwrap_or_else(PoisonError::into_inner);
        *batch = std::mem::take(&mut *batch).notify(method, args);
        self
    }

    /// Calls one method and returns its result.
    ///
    /// # Parameters
    /// * `method` - Name of the remote procedure
    /// * `args` - Positional arguments
    /// * `timeout` - How long to wait for the reply
    ///
    /// # Returns
    /// * `Result<Value, RpcError>` - The result, or the error answered by the server
    pub async fn call(
        &self,
        method: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let responses = self
            .send_batch(Batch::default().query(1, method, args), timeout)
            .await?;

        responses
            .into_iter()
            .next()
            .ok_or_else(|| RpcError::Server("empty response".to_owned()))?
            .into_value()
    }

    /// Sends the queued calls.
    pub async fn send(&self, timeout: Duration) -> Result<Vec<Response>, RpcError> {
        let batch = std::mem::take(&mut *self.batch.lock().unwrap_or_else(PoisonError::into_inner));
        self.send_batch(batch, timeout).await
    }

    /// Sends `batch` and waits up to `timeout` for its responses.
    ///
    /// A batch of notifications only is published without waiting. Responses
    /// come back in the order of the queries of `batch`.
    pub async fn send_batch(&self, batch: Batch, timeout: Duration) -> Result<Vec<Response>, RpcError> {
        if batch.is_empty() {
            return Ok(vec![]);
        }

        if !batch.expects_reply() {
            self.transport
                .send(self.request(batch.encode(), None, timeout))
                .await?;
            return Ok(vec![]);
        }

        // direct reply-to needs the consumer before the request goes out
        self.listen().await?;

        let correlation_id = Uuid::new_v4().to_string();
        let (ticket, reply) = oneshot::channel();
        self.tickets().insert(correlation_id.clone(), ticket);
        let _pending = PendingTicket {
            tickets: &self.tickets,
            correlation_id: &correlation_id,
        };

        let request = self.request(batch.encode(), Some(&correlation_id), timeout);
        self.transport.send(request).await?;
        debug!(correlation_id, queue = self.queue, "request sent");

        let deadline = Instant::now() + timeout;
        let Ok(reply) = tokio::time::timeout_at(deadline, self.wait(reply)).await else {
            warn!(correlation_id, queue = self.queue, "no reply before the deadline");
            return Err(RpcError::Timeout);
        };

        Ok(batch.in_order(decode_responses(&reply_body(reply?)?)?))
    }

    fn request(&self, body: String, correlation_id: Option<&str>, timeout: Duration) -> Envelope {
        let mut stamp = AmqpStamp::new(Some(""), Some(&self.queue));
        stamp.attributes = MessageAttributes {
            delivery_mode: Some(DELIVERY_MODE_PERSISTENT),
            correlation_id: correlation_id.map(str::to_owned),
            reply_to: correlation_id.map(|_| DIRECT_REPLY_TO.to_owned()),
            expiration: Some(timeout.as_millis().to_string()),
            ..MessageAttributes::default()
        };

        Envelope::new(Message::Request(RpcMessage {
            body,
            headers: Headers::new(),
        }))
        .with_amqp(stamp)
    }

    fn tickets(&self) -> MutexGuard<'_, Tickets> {
        self.tickets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the reply consumer unless one is running.
    async fn listen(&self) -> Result<(), AmqpError> {
        // a waiter pumping the replies holds the lock, so the consumer is live
        let Ok(mut replies) = self.replies.try_lock() else {
            return Ok(());
        };

        if replies.is_none() {
            let consumer_tag = format!("rpc-client-{}", Uuid::new_v4());
            let stream = self
                .transport
                .receiver()
                .consume(Some(DIRECT_REPLY_TO), &consumer_tag, true)
                .await?;
            *replies = Some(Replies {
                consumer_tag,
                stream,
            });
        }

        Ok(())
    }

    /// Waits for the reply of one ticket, pumping the reply stream when no other
    /// waiter does.
    async fn wait(&self, mut reply: oneshot::Receiver<Outcome>) -> Outcome {
        tokio::select! {
            biased;
            routed = &mut reply => routed.unwrap_or_else(|_| Err(RpcError::Server("reply ticket dropped".to_owned()))),
            mut replies = self.replies.lock() => loop {
                if let Ok(routed) = reply.try_recv() {
                    return routed;
                }

                let Some(current) = replies.as_mut() else {
                    return Err(AmqpError::ConsumerError(DIRECT_REPLY_TO.to_owned()).into());
                };

                let next = match self.read_timeout {
                    Some(limit) => match tokio::time::timeout(limit, current.stream.next()).await {
                        Ok(next) => next,
                        Err(_) => {
                            debug!(consumer_tag = current.consumer_tag, "no reply within the read timeout");
                            continue;
                        }
                    },
                    None => current.stream.next().await,
                };

                let err = match next {
                    Some(Ok(received)) => {
                        self.route(received);
                        continue;
                    }
                    Some(Err(err)) => {
                        if let Err(err) = self.transport.stop_consume(&current.consumer_tag).await {
                            debug!(error = err.to_string(), "failure to cancel the reply consumer");
                        }
                        err
                    }
                    None => AmqpError::ConsumerError(DIRECT_REPLY_TO.to_owned()),
                };

                // the next request starts a fresh consumer
                *replies = None;
                self.abandon(&err);
                return Err(err.into());
            },
        }
    }

    /// Hands a reply to the ticket of its correlation id.
    fn route(&self, received: Received) {
        let envelope = match received {
            Received::Decoded(envelope) => envelope,
            Received::Undecodable(envelope, err) => {
                warn!(error = err.to_string(), "undecodable reply");
                envelope
            }
        };

        let Some(correlation_id) = envelope
            .delivery()
            .and_then(|handle| handle.attributes.correlation_id.clone())
        else {
            warn!("reply without correlation id, discarding");
            return;
        };

        match self.tickets().remove(&correlation_id) {
            Some(ticket) => {
                if ticket.send(Ok(envelope)).is_err() {
                    debug!(correlation_id, "waiter gone, discarding reply");
                }
            }
            None => warn!(correlation_id, "no waiter for reply, discarding"),
        }
    }

    /// Fails every pending ticket once the reply consumer is lost.
    fn abandon(&self, err: &AmqpError) {
        let tickets = std::mem::take(&mut *self.tickets());
        if !tickets.is_empty() {
            error!(error = err.to_string(), pending = tickets.len(), "reply consumer lost");
        }

        for (_, ticket) in tickets {
            let _ = ticket.send(Err(AmqpError::ConsumerError(DIRECT_REPLY_TO.to_owned()).into()));
        }
    }
}

fn reply_body(reply: Envelope) -> Result<String, RpcError> {
    match reply.into_message() {
        Message::Response(response) => Ok(response.body),
        Message::Raw { body, .. } => String::from_utf8(body)
            .map_err(|err| RpcError::Server(format!("failed to decode the response: {err}"))),
        other => Err(RpcError::Server(format!(
            "unexpected `{}` reply",
            other.kind()
        ))),
    }
}
