//! In-process broker
//!
//! Used in dev mode when NATS is unreachable, and as the broker double in
//! tests. Jobs are recorded per class; failures can be injected per class.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::queue::broker::{BrokerConnector, FaultNotifier, JobPublisher};
use crate::queue::{HandleSpec, JobClass};
use crate::types::{Result, TollgateError};

#[derive(Default)]
struct Inner {
    published: DashMap<JobClass, Vec<Bytes>>,
    failing: DashMap<JobClass, String>,
    notifiers: DashMap<(JobClass, u64), FaultNotifier>,
    broken: DashMap<(JobClass, u64), Arc<AtomicBool>>,
    fail_open: AtomicBool,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw payloads accepted for a class, in publish order
    pub fn published(&self, class: JobClass) -> Vec<Bytes> {
        self.inner
            .published
            .get(&class)
            .map(|jobs| jobs.clone())
            .unwrap_or_default()
    }

    /// Accepted payloads decoded as `T`
    pub fn published_as<T: DeserializeOwned>(&self, class: JobClass) -> Vec<T> {
        self.published(class)
            .iter()
            .filter_map(|payload| serde_json::from_slice(payload).ok())
            .collect()
    }

    /// Reject every publish for `class` on all handles until cleared
    pub fn fail_publish(&self, class: JobClass, cause: Option<&str>) {
        match cause {
            Some(cause) => {
                self.inner.failing.insert(class, cause.to_string());
            }
            None => {
                self.inner.failing.remove(&class);
            }
        }
    }

    /// Make every subsequent `open` fail
    pub fn fail_open(&self, fail: bool) {
        self.inner.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Break the newest handle of `class` and raise its fault signal
    pub fn trip(&self, class: JobClass, cause: &str) {
        let Some(generation) = self.latest_generation(class) else {
            return;
        };
        if let Some(flag) = self.inner.broken.get(&(class, generation)) {
            flag.store(true, Ordering::SeqCst);
        }
        self.notify_generation(class, generation, cause);
    }

    /// Raise the fault signal of a specific handle generation
    pub fn notify_generation(&self, class: JobClass, generation: u64, cause: &str) {
        if let Some(notifier) = self.inner.notifiers.get(&(class, generation)) {
            notifier.notify(cause);
        }
    }

    pub fn opens(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    fn latest_generation(&self, class: JobClass) -> Option<u64> {
        self.inner
            .notifiers
            .iter()
            .filter(|entry| entry.key().0 == class)
            .map(|entry| entry.key().1)
            .max()
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn open(&self, spec: &HandleSpec, faults: FaultNotifier) -> Result<Arc<dyn JobPublisher>> {
        if self.inner.fail_open.load(Ordering::SeqCst) {
            return Err(TollgateError::Nats(format!("cannot open {} handle", spec.class)));
        }
        self.inner.opens.fetch_add(1, Ordering::SeqCst);

        let key = (spec.class, faults.generation());
        let broken = Arc::new(AtomicBool::new(false));
        self.inner.broken.insert(key, Arc::clone(&broken));
        self.inner.notifiers.insert(key, faults);

        Ok(Arc::new(MemoryPublisher {
            class: spec.class,
            broken,
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MemoryPublisher {
    class: JobClass,
    broken: Arc<AtomicBool>,
    inner: Arc<Inner>,
}

#[async_trait]
impl JobPublisher for MemoryPublisher {
    async fn publish(&self, payload: Bytes) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(TollgateError::QueuePublish(format!("{} handle is broken", self.class)));
        }
        if let Some(cause) = self.inner.failing.get(&self.class) {
            return Err(TollgateError::QueuePublish(format!("{}: {}", self.class, cause.value())));
        }
        self.inner.published.entry(self.class).or_default().push(payload);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
