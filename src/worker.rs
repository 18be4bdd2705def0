// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Worker
//!
//! The consume loop. Every delivery goes through the message bus and ends in
//! exactly one ack or nack, unless the handler deferred it to a batch that is
//! settled when flushed. Listeners observe the loop and may stop it.
//!
//! Lifecycle: `Idle` -> `Starting` (topology setup, event bindings) -> `Consuming`
//! -> `Stopping` (consumer cancelled, deferred batches force flushed) -> `Stopped`.

use crate::{
    consumer::Received,
    envelope::{DeliveryHandle, Envelope},
    errors::AmqpError,
    otel,
    rate_limit::RateLimiter,
    stop::{StopCondition, StopOnFailureMarker},
    transport::AmqpTransport,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use std::{
    borrow::Cow,
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A failure raised while handling an envelope.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct HandlerFailure {
    pub message: String,
    /// Replacement envelope, e.g. the original one enriched with diagnostics
    pub envelope: Option<Envelope>,
    /// The message was redelivered already; reject it before the failure observers run
    pub redelivered: bool,
    /// Stop the worker after this failure
    pub stop_worker: bool,
}

impl HandlerFailure {
    pub fn new(message: &str) -> HandlerFailure {
        HandlerFailure {
            message: message.to_owned(),
            envelope: None,
            redelivered: false,
            stop_worker: false,
        }
    }

    pub fn with_envelope(mut self, envelope: Envelope) -> Self {
        self.envelope = Some(envelope);
        self
    }

    pub fn redelivered(mut self) -> Self {
        self.redelivered = true;
        self
    }

    pub fn stop_worker(mut self) -> Self {
        self.stop_worker = true;
        self
    }
}

/// An envelope and the outcome of its handling.
pub type Settlement = (Envelope, Option<HandlerFailure>);

/// Hands envelopes to the application.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Handles one envelope; the returned envelope is the one acknowledged.
    async fn dispatch(&self, envelope: Envelope) -> Result<Envelope, HandlerFailure>;

    /// Flushes the batch that deferred `envelope` and returns every delivery it settled.
    async fn flush(
        &self,
        batch: &str,
        envelope: Envelope,
        force: bool,
    ) -> Result<Vec<Settlement>, HandlerFailure>;
}

/// Observes the worker loop. Every hook defaults to doing nothing.
pub trait WorkerListener: Send + Sync {
    fn on_started(&self, _worker: &WorkerHandle) {}

    /// Called before (`idle == false`) and after (`idle == true`) each delivery.
    fn on_running(&self, _idle: bool, _worker: &WorkerHandle) {}

    fn on_message_failed(&self, envelope: Envelope, _failure: &HandlerFailure) -> Envelope {
        envelope
    }

    fn on_message_handled(&self, envelope: Envelope) -> Envelope {
        envelope
    }

    fn on_rate_limited(&self) {}

    fn on_stopped(&self) {}
}

/// Services holding per-message state.
pub trait ServiceResetter: Send + Sync {
    fn reset(&self);
}

/// Resets services before each message and once the worker stopped.
pub struct ResetServicesListener {
    resetter: Arc<dyn ServiceResetter>,
}

impl ResetServicesListener {
    pub fn new(resetter: Arc<dyn ServiceResetter>) -> ResetServicesListener {
        ResetServicesListener { resetter }
    }
}

impl WorkerListener for ResetServicesListener {
    fn on_running(&self, idle: bool, _worker: &WorkerHandle) {
        if !idle {
            self.resetter.reset();
        }
    }

    fn on_stopped(&self) {
        self.resetter.reset();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Starting,
    Consuming,
    Stopping,
    Stopped,
}

#[derive(Debug)]
struct HandleState {
    stopping: AtomicBool,
    notify: Notify,
    state: Mutex<WorkerState>,
}

/// Shared view of a worker, used to stop it from elsewhere.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    inner: Arc<HandleState>,
}

impl Default for WorkerHandle {
    fn default() -> Self {
        WorkerHandle {
            inner: Arc::new(HandleState {
                stopping: AtomicBool::new(false),
                notify: Notify::new(),
                state: Mutex::new(WorkerState::Idle),
            }),
        }
    }
}

impl WorkerHandle {
    /// Requests the worker to stop. The handler in flight is not interrupted.
    pub fn stop(&self) {
        if !self.inner.stopping.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_one();
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::Acquire)
    }

    pub fn state(&self) -> WorkerState {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: WorkerState) {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn reset(&self) {
        self.inner.stopping.store(false, Ordering::Release);
    }

    async fn stopped(&self) {
        while !self.is_stopping() {
            self.inner.notify.notified().await;
        }
    }
}

pub struct Worker {
    transport: Arc<AmqpTransport>,
    bus: Arc<dyn MessageBus>,
    listeners: Vec<Arc<dyn WorkerListener>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    listened_events: Vec<String>,
    consumer_tag: String,
    handle: WorkerHandle,
    tracer: BoxedTracer,
    acks: Vec<Settlement>,
    unacks: BTreeMap<String, Envelope>,
}

impl Worker {
    pub fn new(transport: Arc<AmqpTransport>, bus: Arc<dyn MessageBus>) -> Worker {
        Worker {
            transport,
            bus,
            listeners: vec![Arc::new(StopOnFailureMarker::default())],
            rate_limiter: None,
            listened_events: vec![],
            consumer_tag: format!("worker-{}", Uuid::new_v4()),
            handle: WorkerHandle::default(),
            tracer: global::tracer("amqp consumer"),
            acks: vec![],
            unacks: BTreeMap::new(),
        }
    }

    pub fn listener(mut self, listener: Arc<dyn WorkerListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn stop_conditions(mut self, conditions: Vec<StopCondition>) -> Self {
        for condition in conditions {
            self.listeners.push(Arc::new(condition));
        }
        self
    }

    pub fn rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Event names the queue gets bound to on start.
    pub fn listened_events(mut self, events: Vec<String>) -> Self {
        self.listened_events = events;
        self
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> WorkerState {
        self.handle.state()
    }

    pub fn stop(&self) {
        info!(consumer_tag = self.consumer_tag, "stopping worker");
        self.handle.stop();
    }

    /// Consumes until stopped or until the broker closes the consumer.
    ///
    /// Setup failures are returned; failures of single deliveries are logged and
    /// never end the loop.
    pub async fn run(&mut self) -> Result<(), AmqpError> {
        let handle = self.handle.clone();
        handle.reset();
        handle.set_state(WorkerState::Starting);
        info!(consumer_tag = self.consumer_tag, "worker starting");

        for listener in &self.listeners {
            listener.on_started(&handle);
        }

        let mut deliveries = match self.start().await {
            Ok(deliveries) => deliveries,
            Err(err) => {
                error!(error = err.to_string(), "failure to start the worker");
                handle.set_state(WorkerState::Stopped);
                return Err(err);
            }
        };

        handle.set_state(WorkerState::Consuming);
        debug!("worker consuming");

        loop {
            if handle.is_stopping() {
                break;
            }

            let next = tokio::select! {
                biased;
                _ = handle.stopped() => break,
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(received)) => self.handle_delivery(received).await,
                Some(Err(err)) => error!(error = err.to_string(), "errors consume msg"),
                None => {
                    warn!("consumer closed by the broker");
                    break;
                }
            }
        }

        handle.set_state(WorkerState::Stopping);
        if let Err(err) = self.transport.stop_consume(&self.consumer_tag).await {
            warn!(error = err.to_string(), "failure to cancel the consumer");
        }
        drop(deliveries);

        self.flush(true).await;

        for listener in &self.listeners {
            listener.on_stopped();
        }
        handle.set_state(WorkerState::Stopped);
        info!(consumer_tag = self.consumer_tag, "worker stopped");

        Ok(())
    }

    async fn start(&self) -> Result<crate::consumer::EnvelopeStream, AmqpError> {
        self.transport.setup().await?;

        if !self.listened_events.is_empty() {
            self.transport.bind(&self.listened_events).await?;
        }

        self.transport.consumer(&self.consumer_tag).await
    }

    async fn handle_delivery(&mut self, received: Received) {
        self.running(false);
        self.rate_limit().await;

        let (envelope, failure) = match received {
            Received::Decoded(envelope) => self.dispatch(envelope).await,
            Received::Undecodable(envelope, err) => {
                (envelope, Some(HandlerFailure::new(&err.to_string())))
            }
        };

        let flush = failure.is_none() && envelope.stamps().flush_batches;
        match (failure, envelope.stamps().no_auto_ack.clone()) {
            (None, Some(batch)) => {
                debug!(batch, "acknowledgement deferred");
                self.unacks.insert(batch, envelope.without_flush_batches());
            }
            (failure, _) => self.acks.push((envelope, failure)),
        }

        self.apply_acks().await;
        self.running(true);

        if flush {
            self.flush(false).await;
        }
    }

    async fn dispatch(&self, envelope: Envelope) -> Settlement {
        let kind = envelope.message().kind();
        let (_ctx, mut span) = otel::new_span(&envelope.all_headers(), &self.tracer, kind);
        debug!(kind, "received");

        let handle = envelope.delivery().cloned();
        match self.bus.dispatch(envelope.clone()).await {
            Ok(handled) => {
                span.set_status(Status::Ok);
                (keep_handle(handled, handle.as_ref()), None)
            }
            Err(failure) => {
                span.record_error(&failure);
                span.set_status(Status::Error {
                    description: Cow::from(failure.message.clone()),
                });
                (envelope, Some(failure))
            }
        }
    }

    fn running(&self, idle: bool) {
        for listener in &self.listeners {
            listener.on_running(idle, &self.handle);
        }
    }

    async fn rate_limit(&self) {
        let Some(limiter) = &self.rate_limiter else {
            return;
        };

        if limiter.try_consume() {
            return;
        }

        info!("worker is being rate limited, waiting for token to become available");
        for listener in &self.listeners {
            listener.on_rate_limited();
        }
        limiter.wait().await;
    }

    /// Acks or rejects every queued settlement.
    async fn apply_acks(&mut self) {
        for (envelope, failure) in std::mem::take(&mut self.acks) {
            let handle = envelope.delivery().cloned();

            let Some(failure) = failure else {
                let envelope = self
                    .listeners
                    .iter()
                    .fold(envelope, |envelope, l| l.on_message_handled(envelope));
                let envelope = keep_handle(envelope, handle.as_ref());

                debug!(kind = envelope.message().kind(), "message handled, acknowledging");
                if let Err(err) = self.transport.ack(&envelope).await {
                    error!(error = err.to_string(), "error whiling ack msg");
                }
                continue;
            };

            // redelivered messages are rejected first so failing observers cannot
            // cause endless redelivery
            let reject_first = failure.redelivered;
            if reject_first {
                self.reject(&envelope).await;
            }

            let envelope = match &failure.envelope {
                Some(replacement) => keep_handle(replacement.clone(), handle.as_ref()),
                None => envelope,
            };
            warn!(error = failure.message, kind = envelope.message().kind(), "message failed");

            let envelope = self
                .listeners
                .iter()
                .fold(envelope, |envelope, l| l.on_message_failed(envelope, &failure));

            if !reject_first {
                self.reject(&keep_handle(envelope, handle.as_ref())).await;
            }
        }
    }

    async fn reject(&self, envelope: &Envelope) {
        if let Err(err) = self.transport.reject(envelope).await {
            error!(error = err.to_string(), "error whiling nack msg");
        }
    }

    /// Flushes every deferred batch, then settles what they returned.
    async fn flush(&mut self, force: bool) {
        if self.unacks.is_empty() {
            return;
        }

        for (batch, envelope) in std::mem::take(&mut self.unacks) {
            debug!(batch, force, "flushing batch");
            match self.bus.flush(&batch, envelope.clone(), force).await {
                Ok(settled) => self.acks.extend(settled),
                Err(failure) => self.acks.push((envelope, Some(failure))),
            }
        }

        self.apply_acks().await;
    }
}

/// Puts the delivery handle back on an envelope that lost it.
fn keep_handle(envelope: Envelope, handle: Option<&Arc<DeliveryHandle>>) -> Envelope {
    match (envelope.delivery(), handle) {
        (None, Some(handle)) => envelope.with_received(handle.clone()),
        _ => envelope,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{MockBroker, RawDelivery},
        codec,
        config::AmqpConfig,
        envelope::Message,
        headers::{to_field_table, Headers, HEADER_MESSAGE_TYPE},
        rate_limit::TokenBucket,
    };
    use futures_util::stream;
    use lapin::BasicProperties;
    use serde_json::json;
    use std::{sync::atomic::AtomicUsize, time::Duration};

    fn delivery(tag: u64) -> RawDelivery {
        let encoded = codec::encode(&Envelope::new(Message::command("ping", json!(tag)))).unwrap();
        RawDelivery {
            delivery_tag: tag,
            properties: BasicProperties::default().with_headers(to_field_table(&encoded.headers)),
            data: encoded.body,
            ..RawDelivery::default()
        }
    }

    /// Exchange and routing key of every queue binding.
    type Bindings = Arc<Mutex<Vec<(String, String)>>>;

    fn broker(deliveries: Vec<RawDelivery>, endless: bool) -> MockBroker {
        binding_broker(deliveries, endless, Bindings::default())
    }

    fn binding_broker(deliveries: Vec<RawDelivery>, endless: bool, bindings: Bindings) -> MockBroker {
        let mut broker = MockBroker::new();
        broker.expect_declare_exchange().returning(|_| Ok(()));
        broker.expect_declare_queue().returning(|_| Ok(()));
        broker.expect_bind_queue().returning(move |binding| {
            bindings
                .lock()
                .unwrap()
                .push((binding.exchange_name.clone(), binding.routing_key.clone()));
            Ok(())
        });
        broker.expect_cancel().times(1).returning(|_| Ok(()));

        let items = stream::iter(deliveries.into_iter().map(Ok));
        broker.expect_consume().times(1).return_once(move |_, _, _| {
            if endless {
                Ok(items.chain(stream::pending()).boxed())
            } else {
                Ok(items.boxed())
            }
        });

        broker
    }

    fn worker(broker: MockBroker, bus: MockMessageBus) -> Worker {
        let transport = Arc::new(AmqpTransport::new(AmqpConfig::default(), Arc::new(broker)));
        Worker::new(transport, Arc::new(bus))
    }

    async fn run(worker: &mut Worker) {
        tokio::time::timeout(Duration::from_secs(5), worker.run())
            .await
            .expect("worker did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn stops_after_message_limit_and_resets_counter() {
        let mut broker = broker((1..=5).map(delivery).collect(), true);
        broker.expect_ack().times(3).returning(|_| Ok(()));

        let mut bus = MockMessageBus::new();
        bus.expect_dispatch().times(3).returning(Ok);

        let condition = Arc::new(StopCondition::message_limit(3).unwrap());
        let mut worker = worker(broker, bus).listener(condition.clone());

        run(&mut worker).await;

        assert_eq!(condition.counter(), 0);
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    struct NackObserver {
        nacks: Arc<AtomicUsize>,
        seen: Mutex<Vec<usize>>,
    }

    impl WorkerListener for NackObserver {
        fn on_message_failed(&self, envelope: Envelope, _failure: &HandlerFailure) -> Envelope {
            self.seen
                .lock()
                .unwrap()
                .push(self.nacks.load(Ordering::SeqCst));
            envelope
        }
    }

    #[tokio::test]
    async fn redelivered_failure_is_rejected_before_observers() {
        let nacks = Arc::new(AtomicUsize::new(0));

        let mut broker = broker(vec![delivery(1)], false);
        let counted = nacks.clone();
        broker.expect_nack().times(1).returning(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        broker.expect_ack().never();

        let mut bus = MockMessageBus::new();
        bus.expect_dispatch()
            .times(1)
            .returning(|_| Err(HandlerFailure::new("boom").redelivered()));

        let observer = Arc::new(NackObserver {
            nacks: nacks.clone(),
            seen: Mutex::new(vec![]),
        });
        let mut worker = worker(broker, bus).listener(observer.clone());

        run(&mut worker).await;

        assert_eq!(*observer.seen.lock().unwrap(), vec![1]);
        assert_eq!(nacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_is_rejected_after_observers() {
        let nacks = Arc::new(AtomicUsize::new(0));

        let mut broker = broker(vec![delivery(1)], false);
        let counted = nacks.clone();
        broker.expect_nack().times(1).returning(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let mut bus = MockMessageBus::new();
        bus.expect_dispatch()
            .times(1)
            .returning(|_| Err(HandlerFailure::new("boom")));

        let observer = Arc::new(NackObserver {
            nacks: nacks.clone(),
            seen: Mutex::new(vec![]),
        });
        let mut worker = worker(broker, bus).listener(observer.clone());

        run(&mut worker).await;

        assert_eq!(*observer.seen.lock().unwrap(), vec![0]);
    }

    struct ReplacementObserver(Mutex<Vec<(String, Option<u64>)>>);

    impl WorkerListener for ReplacementObserver {
        fn on_message_failed(&self, envelope: Envelope, _failure: &HandlerFailure) -> Envelope {
            let name = match envelope.message() {
                Message::Command { name, .. } => name.clone(),
                other => other.kind().to_owned(),
            };
            let tag = envelope.delivery().map(|handle| handle.delivery_tag);
            self.0.lock().unwrap().push((name, tag));
            envelope
        }
    }

    #[tokio::test]
    async fn replacement_envelope_is_observed_and_rejects_the_delivery() {
        let mut broker = broker(vec![delivery(1)], false);
        broker
            .expect_nack()
            .withf(|tag| *tag == 1)
            .times(1)
            .returning(|_| Ok(()));
        broker.expect_ack().never();

        let mut bus = MockMessageBus::new();
        bus.expect_dispatch().times(1).returning(|_| {
            let replacement = Envelope::new(Message::command("ping.retry", json!(1)));
            Err(HandlerFailure::new("boom").with_envelope(replacement))
        });

        let observer = Arc::new(ReplacementObserver(Mutex::new(vec![])));
        let mut worker = worker(broker, bus).listener(observer.clone());

        run(&mut worker).await;

        assert_eq!(
            *observer.0.lock().unwrap(),
            vec![("ping.retry".to_owned(), Some(1))]
        );
    }

    #[tokio::test]
    async fn flush_marker_flushes_right_after_handling() {
        let mut broker = broker(vec![delivery(1)], false);
        broker.expect_ack().times(1).returning(|_| Ok(()));

        let mut bus = MockMessageBus::new();
        bus.expect_dispatch()
            .times(1)
            .returning(|envelope| Ok(envelope.with_no_auto_ack("digest").with_flush_batches()));
        // no forced flush follows on stop, the batch is already empty
        bus.expect_flush()
            .withf(|batch, envelope, force| {
                batch == "digest" && !*force && !envelope.stamps().flush_batches
            })
            .times(1)
            .returning(|_, envelope, _| Ok(vec![(envelope, None)]));

        run(&mut worker(broker, bus)).await;
    }

    #[tokio::test]
    async fn listened_events_are_bound_on_start() {
        let bindings = Bindings::default();
        let broker = binding_broker(vec![], false, bindings.clone());

        let mut bus = MockMessageBus::new();
        bus.expect_dispatch().never();

        let mut worker = worker(broker, bus)
            .listened_events(vec!["user.created".to_owned(), "user.deleted".to_owned()]);

        run(&mut worker).await;

        let exchange = AmqpConfig::default().exchange.name;
        let bindings = bindings.lock().unwrap();
        assert!(bindings.contains(&(exchange.clone(), "user.created".to_owned())));
        assert!(bindings.contains(&(exchange, "user.deleted".to_owned())));
    }

    #[tokio::test]
    async fn deferred_batches_are_flushed_on_stop() {
        let mut broker = broker(vec![delivery(1)], false);
        broker.expect_ack().times(1).returning(|_| Ok(()));

        let mut bus = MockMessageBus::new();
        bus.expect_dispatch()
            .times(1)
            .returning(|envelope| Ok(envelope.with_no_auto_ack("digest")));
        bus.expect_flush()
            .withf(|batch, _, force| batch == "digest" && *force)
            .times(1)
            .returning(|_, envelope, _| Ok(vec![(envelope, None)]));

        run(&mut worker(broker, bus)).await;
    }

    #[tokio::test]
    async fn undecodable_delivery_is_rejected_without_dispatch() {
        let headers = Headers::from([(HEADER_MESSAGE_TYPE.to_owned(), json!("mystery"))]);
        let raw = RawDelivery {
            delivery_tag: 4,
            properties: BasicProperties::default().with_headers(to_field_table(&headers)),
            data: b"?".to_vec(),
            ..RawDelivery::default()
        };

        let mut broker = broker(vec![raw], false);
        broker
            .expect_nack()
            .withf(|tag| *tag == 4)
            .times(1)
            .returning(|_| Ok(()));

        let mut bus = MockMessageBus::new();
        bus.expect_dispatch().never();

        let failures = Arc::new(StopCondition::failure_limit(10).unwrap());
        let mut worker = worker(broker, bus).listener(failures.clone());

        run(&mut worker).await;

        assert_eq!(failures.counter(), 1);
    }

    #[tokio::test]
    async fn stop_worker_failure_ends_the_loop() {
        let mut broker = broker((1..=3).map(delivery).collect(), true);
        broker.expect_nack().times(1).returning(|_| Ok(()));

        let mut bus = MockMessageBus::new();
        bus.expect_dispatch()
            .times(1)
            .returning(|_| Err(HandlerFailure::new("fatal").stop_worker()));

        run(&mut worker(broker, bus)).await;
    }

    struct RateObserver(AtomicUsize);

    impl WorkerListener for RateObserver {
        fn on_rate_limited(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_the_rate_limiter() {
        let mut broker = broker(vec![delivery(1), delivery(2)], false);
        broker.expect_ack().times(2).returning(|_| Ok(()));

        let mut bus = MockMessageBus::new();
        bus.expect_dispatch().times(2).returning(Ok);

        let observer = Arc::new(RateObserver(AtomicUsize::new(0)));
        let mut worker = worker(broker, bus)
            .listener(observer.clone())
            .rate_limiter(Arc::new(TokenBucket::new(1, Duration::from_secs(1))));

        let started = tokio::time::Instant::now();
        run(&mut worker).await;

        assert_eq!(observer.0.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn external_stop_ends_an_idle_worker() {
        let broker = broker(vec![], true);
        let bus = MockMessageBus::new();

        let mut worker = worker(broker, bus);
        let handle = worker.handle();

        let running = tokio::spawn(async move {
            worker.run().await.unwrap();
            worker.state()
        });

        while handle.state() != WorkerState::Consuming {
            tokio::task::yield_now().await;
        }
        handle.stop();

        let state = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, WorkerState::Stopped);
    }
}
