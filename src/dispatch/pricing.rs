//! Cost policy for metered operations
//!
//! Storage is priced per GB-month (GB = 1024^3 bytes). Keys, name records
//! and pubsub messages have flat prices. Costs are rounded up to the ledger's
//! precision so a non-zero cost never rounds to zero.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::config::PricingArgs;
use crate::ledger::CREDIT_SCALE;
use crate::types::{Result, TollgateError};

const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

/// Network the content lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkTier {
    Public,
    Private,
}

impl NetworkTier {
    pub fn of(network_name: &str) -> Self {
        if network_name == "public" {
            Self::Public
        } else {
            Self::Private
        }
    }
}

/// Supported key algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Ed25519,
    Rsa,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ed25519 => "ed25519",
            Self::Rsa => "rsa",
        }
    }

    /// Reject key sizes the key workers cannot generate
    pub fn check_size(&self, bits: u32) -> Result<()> {
        let ok = match self {
            Self::Ed25519 => bits == 256,
            Self::Rsa => (2048..=4096).contains(&bits),
        };
        if ok {
            Ok(())
        } else {
            Err(TollgateError::BadRequest(format!(
                "unsupported {} key size {}",
                self.as_str(),
                bits
            )))
        }
    }
}

impl FromStr for KeyType {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ed25519" => Ok(Self::Ed25519),
            "rsa" => Ok(Self::Rsa),
            other => Err(TollgateError::BadRequest(format!("unsupported key type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PricingPolicy {
    pub public_gb_month: Decimal,
    pub private_gb_month: Decimal,
    pub ipns_publish: Decimal,
    pub pubsub_publish: Decimal,
    pub ed25519_key: Decimal,
    pub rsa_key: Decimal,
    pub max_hold_months: u32,
}

impl PricingPolicy {
    pub fn from_args(args: &PricingArgs) -> Self {
        Self {
            public_gb_month: args.public_gb_month,
            private_gb_month: args.private_gb_month,
            ipns_publish: args.ipns_publish,
            pubsub_publish: args.pubsub_publish,
            ed25519_key: args.ed25519_key,
            rsa_key: args.rsa_key,
            max_hold_months: args.max_hold_months,
        }
    }

    pub fn check_hold_time(&self, months: u32) -> Result<u32> {
        if months == 0 || months > self.max_hold_months {
            return Err(TollgateError::BadRequest(format!(
                "hold time must be between 1 and {} months, got {}",
                self.max_hold_months, months
            )));
        }
        Ok(months)
    }

    /// Cost of holding `size_bytes` for `months`
    pub fn storage_cost(&self, size_bytes: u64, months: u32, tier: NetworkTier) -> Result<Decimal> {
        self.check_hold_time(months)?;
        let rate = match tier {
            NetworkTier::Public => self.public_gb_month,
            NetworkTier::Private => self.private_gb_month,
        };
        let gigabytes = Decimal::from(size_bytes) / Decimal::from(BYTES_PER_GB);
        Ok(round_up(gigabytes * Decimal::from(months) * rate))
    }

    pub fn key_cost(&self, key_type: KeyType) -> Decimal {
        match key_type {
            KeyType::Ed25519 => self.ed25519_key,
            KeyType::Rsa => self.rsa_key,
        }
    }

    pub fn ipns_cost(&self) -> Decimal {
        self.ipns_publish
    }

    pub fn pubsub_cost(&self) -> Decimal {
        self.pubsub_publish
    }
}

impl Default for PricingPolicy {
    fn default() -> Self {
        Self {
            public_gb_month: Decimal::new(5, 2),
            private_gb_month: Decimal::new(7, 2),
            ipns_publish: Decimal::new(1, 1),
            pubsub_publish: Decimal::new(1, 2),
            ed25519_key: Decimal::new(1, 1),
            rsa_key: Decimal::new(2, 1),
            max_hold_months: 24,
        }
    }
}

fn round_up(cost: Decimal) -> Decimal {
    cost.round_dp_with_strategy(CREDIT_SCALE, RoundingStrategy::AwayFromZero)
        .normalize()
}
