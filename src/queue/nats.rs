//! NATS JetStream broker
//!
//! Each job class gets its own connection and its own stream:
//!
//! - direct classes use work-queue retention (one consumer takes each job)
//! - fan-out classes use interest retention (every consumer group gets a copy)
//! - durable classes are file-backed, the rest live in memory
//!
//! Connection events that leave the client unusable are forwarded to the
//! handle's fault notifier. Plain disconnects are left to the client's own
//! reconnect logic.

use async_nats::jetstream::{
    self,
    context::PublishErrorKind,
    stream::{RetentionPolicy, StorageType},
};
use async_nats::{ConnectOptions, Event};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::NatsArgs;
use crate::queue::broker::{BrokerConnector, FaultNotifier, JobPublisher};
use crate::queue::{HandleSpec, JobClass, RoutingMode};
use crate::types::{Result, TollgateError};

const PING_INTERVAL: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Jobs nobody picked up within a week are dropped by the stream
const JOB_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 3600);

pub struct NatsConnector {
    args: NatsArgs,
    client_name: String,
}

impl NatsConnector {
    pub fn new(args: NatsArgs, client_name: impl Into<String>) -> Self {
        Self {
            args,
            client_name: client_name.into(),
        }
    }

    fn stream_config(&self, spec: &HandleSpec) -> jetstream::stream::Config {
        let prefix = &self.args.nats_subject_prefix;
        jetstream::stream::Config {
            name: spec.class.stream_name(prefix),
            subjects: vec![spec.class.subject(prefix)],
            retention: match spec.routing {
                RoutingMode::Direct => RetentionPolicy::WorkQueue,
                RoutingMode::FanOut => RetentionPolicy::Interest,
            },
            storage: if spec.durable {
                StorageType::File
            } else {
                StorageType::Memory
            },
            max_age: JOB_MAX_AGE,
            ..Default::default()
        }
    }
}

#[async_trait]
impl BrokerConnector for NatsConnector {
    async fn open(&self, spec: &HandleSpec, faults: FaultNotifier) -> Result<Arc<dyn JobPublisher>> {
        let class = spec.class;
        let events = faults.clone();

        let mut options = ConnectOptions::new()
            .name(format!("{}-{}", self.client_name, class))
            .ping_interval(PING_INTERVAL)
            .connection_timeout(CONNECT_TIMEOUT)
            .event_callback(move |event| {
                let events = events.clone();
                async move {
                    match event {
                        Event::Closed => events.notify("connection closed"),
                        Event::ServerError(e) => events.notify(format!("server error: {}", e)),
                        Event::ClientError(e) => events.notify(format!("client error: {}", e)),
                        Event::Disconnected => warn!(class = %class, "NATS disconnected, client will reconnect"),
                        Event::Connected => debug!(class = %class, "NATS connected"),
                        other => debug!(class = %class, event = %other, "NATS event"),
                    }
                }
            });

        if let (Some(user), Some(pass)) = (&self.args.nats_user, &self.args.nats_password) {
            options = options.user_and_password(user.clone(), pass.clone());
        }

        let client = options
            .connect(&self.args.nats_url)
            .await
            .map_err(|e| TollgateError::Nats(format!("Failed to connect for {}: {}", class, e)))?;

        let context = jetstream::new(client.clone());
        let config = self.stream_config(spec);
        let stream_name = config.name.clone();
        context
            .get_or_create_stream(config)
            .await
            .map_err(|e| TollgateError::Nats(format!("Failed to ensure stream {}: {}", stream_name, e)))?;

        info!(class = %class, stream = %stream_name, generation = faults.generation(), "JetStream handle ready");

        Ok(Arc::new(NatsPublisher {
            class,
            subject: spec.class.subject(&self.args.nats_subject_prefix),
            client,
            context,
            timeout: self.args.publish_timeout(),
            faults,
        }))
    }
}

struct NatsPublisher {
    class: JobClass,
    subject: String,
    client: async_nats::Client,
    context: jetstream::Context,
    timeout: Duration,
    faults: FaultNotifier,
}

#[async_trait]
impl JobPublisher for NatsPublisher {
    async fn publish(&self, payload: Bytes) -> Result<()> {
        let publish = async {
            let ack = self
                .context
                .publish(self.subject.clone(), payload)
                .await
                .map_err(|e| (e.kind(), e.to_string()))?;
            ack.await.map_err(|e| (e.kind(), e.to_string()))
        };

        match tokio::time::timeout(self.timeout, publish).await {
            Ok(Ok(_ack)) => Ok(()),
            Ok(Err((kind, message))) => {
                // a missing stream or a dead socket will not heal by itself
                if matches!(kind, PublishErrorKind::StreamNotFound | PublishErrorKind::BrokenPipe) {
                    self.faults.notify(format!("publish failed: {}", message));
                }
                Err(TollgateError::QueuePublish(format!("{}: {}", self.class, message)))
            }
            Err(_) => Err(TollgateError::QueuePublish(format!(
                "{}: no ack within {:?}",
                self.class, self.timeout
            ))),
        }
    }

    async fn close(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| TollgateError::Nats(format!("Flush failed for {}: {}", self.class, e)))
    }
}
