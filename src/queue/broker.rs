//! Broker seam
//!
//! A [`BrokerConnector`] opens one [`JobPublisher`] per job class. Each open
//! is given its own [`FaultNotifier`]; the connector fires it whenever the
//! underlying connection becomes unusable. The notifier is stamped with the
//! handle's generation so faults from a handle that has already been
//! replaced can be told apart from faults on the live one.

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use std::sync::Arc;

use crate::queue::{HandleSpec, JobClass};
use crate::types::Result;

/// An error reported for a specific handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleFault {
    pub class: JobClass,
    pub generation: u64,
    pub cause: String,
}

/// Sending half of a handle's fault channel
#[derive(Debug, Clone)]
pub struct FaultNotifier {
    class: JobClass,
    generation: u64,
    tx: mpsc::UnboundedSender<HandleFault>,
}

impl FaultNotifier {
    /// Create a notifier and the receiver the manager listens on
    pub fn channel(class: JobClass, generation: u64) -> (Self, mpsc::UnboundedReceiver<HandleFault>) {
        let (tx, rx) = mpsc::unbounded();
        (
            Self {
                class,
                generation,
                tx,
            },
            rx,
        )
    }

    pub fn notify(&self, cause: impl Into<String>) {
        // the receiver is gone once the manager has shut down
        let _ = self.tx.unbounded_send(HandleFault {
            class: self.class,
            generation: self.generation,
            cause: cause.into(),
        });
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Live publish channel for one job class
#[async_trait]
pub trait JobPublisher: Send + Sync {
    /// Publish and wait until the broker has accepted the job
    async fn publish(&self, payload: Bytes) -> Result<()>;

    /// Flush pending work and release the connection
    async fn close(&self) -> Result<()>;
}

/// Opens publish handles
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn open(&self, spec: &HandleSpec, faults: FaultNotifier) -> Result<Arc<dyn JobPublisher>>;
}

/// An opened handle. Immutable once built; replaced wholesale on rebuild.
pub struct JobHandle {
    pub spec: HandleSpec,
    pub generation: u64,
    publisher: Arc<dyn JobPublisher>,
}

impl JobHandle {
    pub fn new(spec: HandleSpec, generation: u64, publisher: Arc<dyn JobPublisher>) -> Self {
        Self {
            spec,
            generation,
            publisher,
        }
    }

    pub async fn publish(&self, payload: Bytes) -> Result<()> {
        self.publisher.publish(payload).await
    }

    pub async fn close(&self) -> Result<()> {
        self.publisher.close().await
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("spec", &self.spec)
            .field("generation", &self.generation)
            .finish()
    }
}
