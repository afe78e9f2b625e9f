//! Paid operation dispatcher
//!
//! Every metered endpoint goes through [`Dispatcher::dispatch`]:
//!
//! 1. price the operation (admin accounts pay nothing)
//! 2. reserve the credits
//! 3. publish the job, carrying the reserved cost
//! 4. refund the reservation if the publish was not accepted
//!
//! A reservation therefore always ends in either an accepted job or a refund
//! attempt. Success is only reported once the broker has accepted the job.

pub mod pricing;
pub mod sizing;

pub use pricing::{KeyType, NetworkTier, PricingPolicy};
pub use sizing::{IpfsObjectSizer, ObjectSizer, StaticSizer};

use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::ledger::CreditLedger;
use crate::queue::messages::{FileJob, IpnsEntryJob, KeyCreationJob, PinJob, PubsubPublishJob};
use crate::queue::{JobClass, QueueManager};
use crate::types::{Result, TollgateError};

/// A metered action, with everything its job needs
#[derive(Debug, Clone, PartialEq)]
pub enum PaidOperation {
    Pin {
        cid: String,
        network_name: String,
        hold_months: u32,
        size: u64,
    },
    ClusterPin {
        cid: String,
        network_name: String,
        hold_months: u32,
        size: u64,
    },
    FileUpload {
        object_name: String,
        network_name: String,
        hold_months: u32,
        size: u64,
    },
    KeyCreation {
        name: String,
        key_type: KeyType,
        bits: u32,
        network_name: String,
    },
    NamePublish {
        cid: String,
        key: String,
        life_time_secs: u64,
        ttl_secs: u64,
        resolve: bool,
        network_name: String,
    },
    PubsubPublish {
        topic: String,
        message: String,
        network_name: String,
    },
}

impl PaidOperation {
    pub fn class(&self) -> JobClass {
        match self {
            Self::Pin { .. } => JobClass::Pin,
            Self::ClusterPin { .. } => JobClass::ClusterPin,
            Self::FileUpload { .. } => JobClass::File,
            Self::KeyCreation { .. } => JobClass::KeyCreation,
            Self::NamePublish { .. } => JobClass::IpnsEntry,
            Self::PubsubPublish { .. } => JobClass::PubsubPublish,
        }
    }

    /// Reject malformed operations before any money moves
    pub fn validate(&self, pricing: &PricingPolicy) -> Result<()> {
        match self {
            Self::Pin { cid, hold_months, .. } | Self::ClusterPin { cid, hold_months, .. } => {
                check_cid(cid)?;
                pricing.check_hold_time(*hold_months)?;
            }
            Self::FileUpload {
                object_name,
                hold_months,
                ..
            } => {
                non_empty("object_name", object_name)?;
                pricing.check_hold_time(*hold_months)?;
            }
            Self::KeyCreation { name, key_type, bits, .. } => {
                non_empty("name", name)?;
                key_type.check_size(*bits)?;
            }
            Self::NamePublish { cid, key, .. } => {
                check_cid(cid)?;
                non_empty("key", key)?;
            }
            Self::PubsubPublish { topic, .. } => non_empty("topic", topic)?,
        }
        Ok(())
    }

    /// Cost before any admin exemption
    pub fn price(&self, pricing: &PricingPolicy) -> Result<Decimal> {
        match self {
            Self::Pin {
                network_name,
                hold_months,
                size,
                ..
            }
            | Self::ClusterPin {
                network_name,
                hold_months,
                size,
                ..
            }
            | Self::FileUpload {
                network_name,
                hold_months,
                size,
                ..
            } => pricing.storage_cost(*size, *hold_months, NetworkTier::of(network_name)),
            Self::KeyCreation { key_type, .. } => Ok(pricing.key_cost(*key_type)),
            Self::NamePublish { .. } => Ok(pricing.ipns_cost()),
            Self::PubsubPublish { .. } => Ok(pricing.pubsub_cost()),
        }
    }

    async fn publish(&self, queues: &QueueManager, account: &str, cost: Decimal) -> Result<()> {
        let class = self.class();
        let user_name = account.to_string();
        match self.clone() {
            Self::Pin {
                cid,
                network_name,
                hold_months,
                size,
            }
            | Self::ClusterPin {
                cid,
                network_name,
                hold_months,
                size,
            } => {
                let job = PinJob {
                    cid,
                    network_name,
                    user_name,
                    hold_time_in_months: hold_months,
                    size,
                    credit_cost: cost,
                };
                queues.publish(class, &job).await
            }
            Self::FileUpload {
                object_name,
                network_name,
                hold_months,
                size,
            } => {
                let job = FileJob {
                    object_name,
                    network_name,
                    user_name,
                    hold_time_in_months: hold_months,
                    size,
                    credit_cost: cost,
                };
                queues.publish(class, &job).await
            }
            Self::KeyCreation {
                name,
                key_type,
                bits,
                network_name,
            } => {
                let job = KeyCreationJob {
                    user_name,
                    name,
                    key_type: key_type.as_str().to_string(),
                    size: bits,
                    network_name,
                    credit_cost: cost,
                };
                queues.publish(class, &job).await
            }
            Self::NamePublish {
                cid,
                key,
                life_time_secs,
                ttl_secs,
                resolve,
                network_name,
            } => {
                let job = IpnsEntryJob {
                    cid,
                    life_time: life_time_secs,
                    ttl: ttl_secs,
                    resolve,
                    key,
                    user_name,
                    network_name,
                    credit_cost: cost,
                };
                queues.publish(class, &job).await
            }
            Self::PubsubPublish {
                topic,
                message,
                network_name,
            } => {
                let job = PubsubPublishJob {
                    topic,
                    message,
                    user_name,
                    network_name,
                    credit_cost: cost,
                };
                queues.publish(class, &job).await
            }
        }
    }
}

fn check_cid(cid: &str) -> Result<()> {
    cid::Cid::try_from(cid)
        .map(|_| ())
        .map_err(|e| TollgateError::BadRequest(format!("invalid content identifier '{}': {}", cid, e)))
}

fn non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(TollgateError::BadRequest(format!("{} must not be empty", field)));
    }
    Ok(())
}

/// A priced operation for one account. Lives only for the request.
#[derive(Debug, Clone, PartialEq)]
pub struct PaidOperationRequest {
    pub account: String,
    pub operation: PaidOperation,
    pub cost: Decimal,
}

/// Outcome of an accepted operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchReceipt {
    pub class: JobClass,
    pub cost: Decimal,
    /// Balance after the debit
    pub remaining: Decimal,
}

#[derive(Clone)]
pub struct Dispatcher {
    ledger: CreditLedger,
    queues: Arc<QueueManager>,
    pricing: PricingPolicy,
}

impl Dispatcher {
    pub fn new(ledger: CreditLedger, queues: Arc<QueueManager>, pricing: PricingPolicy) -> Self {
        Self {
            ledger,
            queues,
            pricing,
        }
    }

    pub fn pricing(&self) -> &PricingPolicy {
        &self.pricing
    }

    /// Validate and price an operation for `account`
    pub async fn quote(&self, account: &str, operation: PaidOperation) -> Result<PaidOperationRequest> {
        operation.validate(&self.pricing)?;
        let cost = if self.ledger.is_admin(account).await? {
            Decimal::ZERO
        } else {
            operation.price(&self.pricing)?
        };
        Ok(PaidOperationRequest {
            account: account.to_string(),
            operation,
            cost,
        })
    }

    /// Reserve, publish, and refund on publish failure
    pub async fn execute(&self, request: PaidOperationRequest) -> Result<DispatchReceipt> {
        let class = request.operation.class();
        let reservation = self.ledger.reserve(&request.account, request.cost).await?;

        match request
            .operation
            .publish(&self.queues, &request.account, reservation.cost)
            .await
        {
            Ok(()) => {
                info!(
                    account = %request.account,
                    class = %class,
                    cost = %reservation.cost,
                    "paid operation accepted"
                );
                Ok(DispatchReceipt {
                    class,
                    cost: reservation.cost,
                    remaining: reservation.remaining,
                })
            }
            Err(e) => {
                warn!(
                    account = %request.account,
                    class = %class,
                    cost = %reservation.cost,
                    error = %e,
                    "job publish failed, refunding"
                );
                self.ledger
                    .refund(&reservation.account, reservation.cost, class.as_str())
                    .await;
                Err(e)
            }
        }
    }

    pub async fn dispatch(&self, account: &str, operation: PaidOperation) -> Result<DispatchReceipt> {
        let request = self.quote(account, operation).await?;
        self.execute(request).await
    }
}
