// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation of AMQP connections and channels and implements
//! the `Broker` seam on top of a lapin channel. A connection is shared between the
//! channels of one process; each worker and each RPC client owns its own channel.

use crate::{
    broker::{Broker, DeliveryStream, OutboundMessage, RawDelivery},
    config::AmqpConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    headers::to_field_table,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions,
        QueueDeclareOptions, QueuePurgeOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    tcp::OwnedTLSConfig,
    types::{FieldTable, LongString},
    uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo},
    Channel, Connection, ConnectionProperties,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::OnceCell;
use tracing::{debug, error};

/// Creates a new AMQP connection to RabbitMQ.
///
/// The connection URI is assembled from the host, port, vhost and credentials of
/// `cfg`; heartbeat and connect timeout travel in the URI query. When TLS is
/// enabled the CA certificate chain is read from `cfg.cacert`.
pub async fn new_amqp_connection(cfg: &AmqpConfig) -> Result<Arc<Connection>, AmqpError> {
    debug!("creating amqp connection...");
    let mut options = ConnectionProperties::default();
    if let Some(name) = &cfg.connection_name {
        options = options.with_connection_name(LongString::from(name.clone()));
    }

    let uri = AMQPUri {
        scheme: if cfg.tls {
            AMQPScheme::AMQPS
        } else {
            AMQPScheme::AMQP
        },
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: cfg.user.clone(),
                password: cfg.password.clone(),
            },
            host: cfg.host.clone(),
            port: cfg.port(),
        },
        vhost: cfg.vhost.clone(),
        query: AMQPQueryString {
            heartbeat: cfg.heartbeat,
            connection_timeout: cfg
                .connect_timeout()
                .map(|timeout| timeout.as_millis() as u64),
            ..AMQPQueryString::default()
        },
    };

    let connected = if cfg.tls {
        Connection::connect_uri_with_config(uri, options, tls_config(cfg)?).await
    } else {
        Connection::connect_uri(uri, options).await
    };

    let conn = match connected {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), host = cfg.host, "failure to connect");
            Err(AmqpError::ConnectionError {})
        }
    }?;
    debug!("amqp connected");

    Ok(Arc::new(conn))
}

fn tls_config(cfg: &AmqpConfig) -> Result<OwnedTLSConfig, AmqpError> {
    let cert_chain = match &cfg.cacert {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(pem) => Some(pem),
            Err(err) => {
                error!(error = err.to_string(), path, "failure to read the CA certificate");
                return Err(AmqpError::ConnectionError);
            }
        },
        None => None,
    };

    Ok(OwnedTLSConfig {
        cert_chain,
        ..OwnedTLSConfig::default()
    })
}

/// A lapin channel implementing the `Broker` seam.
///
/// With a lazy configuration nothing touches the network until the first
/// operation; otherwise `AmqpChannel::open` connects immediately.
pub struct AmqpChannel {
    cfg: AmqpConfig,
    connection: OnceCell<Arc<Connection>>,
    channel: OnceCell<Channel>,
}

impl AmqpChannel {
    /// Creates a channel that owns its connection.
    pub async fn open(cfg: &AmqpConfig) -> Result<Arc<AmqpChannel>, AmqpError> {
        let broker = AmqpChannel {
            cfg: cfg.clone(),
            connection: OnceCell::new(),
            channel: OnceCell::new(),
        };

        if !cfg.lazy {
            broker.channel().await?;
        }

        Ok(Arc::new(broker))
    }

    /// Creates a channel on an already established connection.
    pub async fn with_connection(
        cfg: &AmqpConfig,
        connection: Arc<Connection>,
    ) -> Result<Arc<AmqpChannel>, AmqpError> {
        let broker = AmqpChannel {
            cfg: cfg.clone(),
            connection: OnceCell::from(connection),
            channel: OnceCell::new(),
        };

        if !cfg.lazy {
            broker.channel().await?;
        }

        Ok(Arc::new(broker))
    }

    async fn connection(&self) -> Result<&Arc<Connection>, AmqpError> {
        self.connection
            .get_or_try_init(|| new_amqp_connection(&self.cfg))
            .await
    }

    async fn channel(&self) -> Result<&Channel, AmqpError> {
        self.channel
            .get_or_try_init(|| async {
                let conn = self.connection().await?;
                create_channel(conn).await
            })
            .await
    }

    fn write_timeout(&self) -> Option<Duration> {
        self.cfg.write_timeout()
    }
}

async fn create_channel(conn: &Connection) -> Result<Channel, AmqpError> {
    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok(c)
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError {})
        }
    }
}

fn is_not_found(err: &lapin::Error) -> bool {
    match err {
        lapin::Error::ProtocolError(amqp) => {
            matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND))
        }
        _ => false,
    }
}

async fn close_disposable(channel: &Channel) {
    if let Err(err) = channel.close(200, "OK").await {
        debug!(error = err.to_string(), "disposable channel was already closed");
    }
}

#[async_trait]
impl Broker for AmqpChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel()
            .await?
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: false,
                },
                to_field_table(&def.params),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<(), AmqpError> {
        match self
            .channel()
            .await?
            .exchange_delete(
                name,
                ExchangeDeleteOptions {
                    if_unused,
                    nowait: false,
                },
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name, "error to delete the exchange");
                Err(AmqpError::DeleteExchangeError(name.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel()
            .await?
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                def.field_table(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn purge_queue(&self, name: &str) -> Result<(), AmqpError> {
        match self
            .channel()
            .await?
            .queue_purge(name, QueuePurgeOptions { nowait: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name, "error to purge the queue");
                Err(AmqpError::PurgeQueueError(name.to_owned()))
            }
            Ok(purged) => {
                debug!(purged, "queue: {} was purged", name);
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .channel()
            .await?
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                to_field_table(&binding.arguments),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");

                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn exchange_exists(&self, name: &str) -> Result<bool, AmqpError> {
        let channel = create_channel(self.connection().await?).await?;

        match channel
            .exchange_declare(
                name,
                lapin::ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    passive: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(()) => {
                close_disposable(&channel).await;
                Ok(true)
            }
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => {
                error!(error = err.to_string(), name, "error to probe the exchange");
                Err(AmqpError::ProbeError(name.to_owned()))
            }
        }
    }

    async fn queue_message_count(&self, name: &str) -> Result<Option<u32>, AmqpError> {
        let channel = create_channel(self.connection().await?).await?;

        match channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(queue) => {
                close_disposable(&channel).await;
                Ok(Some(queue.message_count()))
            }
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => {
                error!(error = err.to_string(), name, "error to probe the queue");
                Err(AmqpError::ProbeError(name.to_owned()))
            }
        }
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), AmqpError> {
        let channel = self.channel().await?;
        let publishing = channel.basic_publish(
            &message.exchange,
            &message.routing_key,
            BasicPublishOptions {
                immediate: false,
                mandatory: false,
            },
            &message.body,
            message.properties,
        );

        let published = match self.write_timeout() {
            Some(timeout) => match tokio::time::timeout(timeout, publishing).await {
                Ok(published) => published,
                Err(_) => {
                    error!(exchange = message.exchange, "publish timed out");
                    return Err(AmqpError::PublishTimeout);
                }
            },
            None => publishing.await,
        };

        match published {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        match self
            .channel()
            .await?
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                Err(AmqpError::AckMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn nack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        match self
            .channel()
            .await?
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue: false,
                },
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), delivery_tag, "error whiling nack msg");
                Err(AmqpError::NackMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel()
            .await?
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(RawDelivery::from(delivery)),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        match self
            .channel()
            .await?
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), consumer_tag, "error to cancel the consumer");
                Err(AmqpError::CancelConsumerError(consumer_tag.to_owned()))
            }
            _ => Ok(()),
        }
    }

    fn is_connected(&self) -> bool {
        self.connection
            .get()
            .map(|conn| conn.status().connected())
            .unwrap_or(true)
    }
}
