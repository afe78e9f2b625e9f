//! Broker connection resilience manager
//!
//! Holds one active [`JobHandle`] per class. Publishers clone the handle's
//! `Arc` under a read lock and publish without holding any lock; the run loop
//! is the only writer and swaps a fully built replacement in one step.
//!
//! If a replacement cannot be opened the loop returns
//! [`TollgateError::BrokerFatal`] and the process is expected to exit.

use bytes::Bytes;
use futures::channel::mpsc;
use futures::stream::SelectAll;
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::queue::broker::{BrokerConnector, FaultNotifier, HandleFault, JobHandle};
use crate::queue::{HandleSpec, JobClass, RoutingMode};
use crate::types::{Result, TollgateError};

struct Slot {
    spec: HandleSpec,
    generation: AtomicU64,
    active: RwLock<Arc<JobHandle>>,
}

impl Slot {
    fn current(&self) -> Arc<JobHandle> {
        let guard = self.active.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    fn replace(&self, handle: Arc<JobHandle>) -> Arc<JobHandle> {
        let mut guard = self.active.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *guard, handle)
    }
}

/// Merged fault channels of every live handle
pub struct FaultWatch {
    faults: SelectAll<mpsc::UnboundedReceiver<HandleFault>>,
}

/// Per-class view for health reporting
#[derive(Debug, Clone, Serialize)]
pub struct ClassStatus {
    pub class: JobClass,
    pub routing: RoutingMode,
    pub durable: bool,
    pub generation: u64,
}

pub struct QueueManager {
    connector: Arc<dyn BrokerConnector>,
    slots: HashMap<JobClass, Slot>,
    rebuilds: AtomicU64,
}

impl QueueManager {
    /// Open one handle per spec. Any failure here aborts startup.
    pub async fn start(
        connector: Arc<dyn BrokerConnector>,
        specs: impl IntoIterator<Item = HandleSpec>,
    ) -> Result<(Arc<Self>, FaultWatch)> {
        let mut slots = HashMap::new();
        let mut faults = SelectAll::new();

        for spec in specs {
            let (handle, rx) = open_handle(connector.as_ref(), spec, 0).await?;
            info!(class = %spec.class, routing = ?spec.routing, durable = spec.durable, "job handle opened");
            faults.push(rx);
            slots.insert(
                spec.class,
                Slot {
                    spec,
                    generation: AtomicU64::new(0),
                    active: RwLock::new(handle),
                },
            );
        }

        let manager = Arc::new(Self {
            connector,
            slots,
            rebuilds: AtomicU64::new(0),
        });
        Ok((manager, FaultWatch { faults }))
    }

    /// Currently active handle for a class
    pub fn handle(&self, class: JobClass) -> Result<Arc<JobHandle>> {
        self.slots
            .get(&class)
            .map(Slot::current)
            .ok_or_else(|| TollgateError::QueuePublish(format!("no handle for job class {}", class)))
    }

    /// Serialize and publish a job, waiting for broker acceptance
    pub async fn publish<T: Serialize + ?Sized>(&self, class: JobClass, message: &T) -> Result<()> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| TollgateError::Internal(format!("failed to encode {} job: {}", class, e)))?;
        let handle = self.handle(class)?;
        handle.publish(Bytes::from(payload)).await.map_err(|e| match e {
            TollgateError::QueuePublish(_) => e,
            other => TollgateError::QueuePublish(format!("{}: {}", class, other)),
        })?;
        debug!(class = %class, generation = handle.generation, "job published");
        Ok(())
    }

    /// Fan-in loop over every class's fault channel.
    ///
    /// Runs until `shutdown` flips to true (returns `Ok`, handles stay open for
    /// requests still draining) or a handle cannot be rebuilt (returns
    /// `BrokerFatal`). Call [`QueueManager::close_all`] once the HTTP side has
    /// drained.
    pub async fn run(
        self: Arc<Self>,
        mut watch: FaultWatch,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(classes = self.slots.len(), "queue resilience loop started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(fault) = watch.faults.next(), if !watch.faults.is_empty() => {
                    if let Some(rx) = self.recover(fault).await? {
                        watch.faults.push(rx);
                    }
                }
            }
        }

        info!("queue resilience loop stopped");
        Ok(())
    }

    async fn recover(&self, fault: HandleFault) -> Result<Option<mpsc::UnboundedReceiver<HandleFault>>> {
        let Some(slot) = self.slots.get(&fault.class) else {
            warn!(class = %fault.class, "fault for unmanaged job class");
            return Ok(None);
        };

        let current = slot.generation.load(Ordering::SeqCst);
        if fault.generation != current {
            debug!(
                class = %fault.class,
                generation = fault.generation,
                current,
                "ignoring fault from replaced handle"
            );
            return Ok(None);
        }

        warn!(class = %fault.class, generation = current, cause = %fault.cause, "job handle failed, rebuilding");

        let next = current + 1;
        let (handle, rx) = match open_handle(self.connector.as_ref(), slot.spec, next).await {
            Ok(opened) => opened,
            Err(e) => {
                error!(class = %fault.class, error = %e, "job handle rebuild failed, stopping service");
                return Err(TollgateError::BrokerFatal(format!(
                    "could not rebuild {} handle after '{}': {}",
                    fault.class, fault.cause, e
                )));
            }
        };

        slot.generation.store(next, Ordering::SeqCst);
        let old = slot.replace(handle);
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
        info!(class = %fault.class, generation = next, "job handle rebuilt");

        // in-flight publishes on the old handle finish on their own clones
        tokio::spawn(async move {
            if let Err(e) = old.close().await {
                debug!(class = %old.spec.class, error = %e, "closing replaced handle failed");
            }
        });

        Ok(Some(rx))
    }

    /// Close every active handle
    pub async fn close_all(&self) {
        for slot in self.slots.values() {
            let handle = slot.current();
            if let Err(e) = handle.close().await {
                warn!(class = %slot.spec.class, error = %e, "failed to close job handle");
            }
        }
        info!("all job handles closed");
    }

    pub fn status(&self) -> Vec<ClassStatus> {
        let mut status: Vec<ClassStatus> = self
            .slots
            .values()
            .map(|slot| ClassStatus {
                class: slot.spec.class,
                routing: slot.spec.routing,
                durable: slot.spec.durable,
                generation: slot.generation.load(Ordering::SeqCst),
            })
            .collect();
        status.sort_by_key(|s| s.class.as_str());
        status
    }

    /// Number of successful rebuilds since start
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds.load(Ordering::Relaxed)
    }
}

async fn open_handle(
    connector: &dyn BrokerConnector,
    spec: HandleSpec,
    generation: u64,
) -> Result<(Arc<JobHandle>, mpsc::UnboundedReceiver<HandleFault>)> {
    let (notifier, rx) = FaultNotifier::channel(spec.class, generation);
    let publisher = connector.open(&spec, notifier).await?;
    Ok((Arc::new(JobHandle::new(spec, generation, publisher)), rx))
}
