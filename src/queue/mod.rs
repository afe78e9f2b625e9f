//! Job queues
//!
//! Every class of asynchronous work has its own publish handle. The
//! [`QueueManager`] owns those handles and replaces any of them in place when
//! the broker reports it broken.
//!
//! ## Routing
//!
//! - **Direct**: each job is delivered to exactly one consumer of the class.
//! - **Fan-out**: every subscribed consumer group sees each job (key creation,
//!   where every node must hold the new key).
//!
//! Routing and durability are fixed per class, never chosen per request.

pub mod broker;
pub mod manager;
pub mod memory;
pub mod messages;
pub mod nats;

pub use broker::{BrokerConnector, FaultNotifier, HandleFault, JobHandle, JobPublisher};
pub use manager::{ClassStatus, FaultWatch, QueueManager};
pub use memory::MemoryBroker;
pub use nats::NatsConnector;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Named category of asynchronous work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobClass {
    Pin,
    ClusterPin,
    File,
    KeyCreation,
    IpnsEntry,
    Email,
    PubsubPublish,
    TokenPaymentConfirmation,
    WalletPaymentConfirmation,
    ForwardPaymentConfirmation,
}

impl JobClass {
    pub const ALL: [JobClass; 10] = [
        JobClass::Pin,
        JobClass::ClusterPin,
        JobClass::File,
        JobClass::KeyCreation,
        JobClass::IpnsEntry,
        JobClass::Email,
        JobClass::PubsubPublish,
        JobClass::TokenPaymentConfirmation,
        JobClass::WalletPaymentConfirmation,
        JobClass::ForwardPaymentConfirmation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pin => "pin",
            Self::ClusterPin => "cluster-pin",
            Self::File => "file",
            Self::KeyCreation => "key-creation",
            Self::IpnsEntry => "ipns-entry",
            Self::Email => "email",
            Self::PubsubPublish => "pubsub-publish",
            Self::TokenPaymentConfirmation => "token-payment-confirmation",
            Self::WalletPaymentConfirmation => "wallet-payment-confirmation",
            Self::ForwardPaymentConfirmation => "forward-payment-confirmation",
        }
    }

    pub fn routing(&self) -> RoutingMode {
        match self {
            Self::KeyCreation => RoutingMode::FanOut,
            _ => RoutingMode::Direct,
        }
    }

    /// Pubsub messages are ephemeral; everything else survives a broker restart
    pub fn durable(&self) -> bool {
        !matches!(self, Self::PubsubPublish)
    }

    /// Broker subject, e.g. `tollgate.jobs.cluster-pin`
    pub fn subject(&self, prefix: &str) -> String {
        format!("{}.jobs.{}", prefix, self.as_str())
    }

    /// JetStream stream name, e.g. `TOLLGATE_CLUSTER_PIN`
    pub fn stream_name(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, self.as_str())
            .replace(['-', '.'], "_")
            .to_uppercase()
    }
}

impl fmt::Display for JobClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a class's jobs reach consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingMode {
    Direct,
    FanOut,
}

/// Everything needed to (re)open a class's handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleSpec {
    pub class: JobClass,
    pub routing: RoutingMode,
    pub durable: bool,
}

impl HandleSpec {
    pub fn for_class(class: JobClass) -> Self {
        Self {
            class,
            routing: class.routing(),
            durable: class.durable(),
        }
    }

    /// Specs for every job class
    pub fn all() -> Vec<Self> {
        JobClass::ALL.iter().copied().map(Self::for_class).collect()
    }
}
