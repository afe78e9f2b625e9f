//! Configuration for Tollgate
//!
//! CLI arguments and environment variable handling using clap.

use clap::{Parser, ValueEnum};
use rust_decimal::Decimal;
use std::net::SocketAddr;
use std::time::Duration;
use uuid::Uuid;

/// Tollgate - credit-metered job gateway
#[derive(Parser, Debug, Clone)]
#[command(name = "tollgate")]
#[command(about = "Credit-metered job gateway with multi-rail payment top-ups")]
pub struct Args {
    /// Unique node identifier for this gateway instance
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Enable development mode (in-memory stores and broker when backends are unreachable)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Seconds to wait for in-flight requests on shutdown
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value = "10")]
    pub shutdown_grace_secs: u64,

    /// JWT secret for bearer token validation (required in production)
    #[arg(long, env = "JWT_SECRET")]
    pub jwt_secret: Option<String>,

    /// JWT token expiry in seconds (used for tokens minted in dev mode)
    #[arg(long, env = "JWT_EXPIRY_SECONDS", default_value = "3600")]
    pub jwt_expiry_seconds: u64,

    /// NATS configuration
    #[command(flatten)]
    pub nats: NatsArgs,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "tollgate")]
    pub mongodb_db: String,

    /// IPFS HTTP API used to size objects before pricing a pin
    #[arg(long, env = "IPFS_API_URL", default_value = "http://localhost:5001")]
    pub ipfs_api_url: String,

    /// Payment configuration
    #[command(flatten)]
    pub payments: PaymentArgs,

    /// Pricing configuration
    #[command(flatten)]
    pub pricing: PricingArgs,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Pretty,
    /// One JSON object per line
    Json,
}

/// NATS connection arguments
#[derive(Parser, Debug, Clone)]
pub struct NatsArgs {
    /// NATS server URL
    #[arg(long, env = "NATS_URL", default_value = "nats://localhost:4222")]
    pub nats_url: String,

    /// NATS username (optional)
    #[arg(long, env = "NATS_USER")]
    pub nats_user: Option<String>,

    /// NATS password (optional)
    #[arg(long, env = "NATS_PASSWORD")]
    pub nats_password: Option<String>,

    /// How long a publish waits for the JetStream ack
    #[arg(long, env = "NATS_PUBLISH_TIMEOUT_MS", default_value = "5000")]
    pub nats_publish_timeout_ms: u64,

    /// Prefix applied to every job stream and subject
    #[arg(long, env = "NATS_SUBJECT_PREFIX", default_value = "tollgate")]
    pub nats_subject_prefix: String,
}

impl NatsArgs {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.nats_publish_timeout_ms)
    }
}

/// Settlement rail and signer arguments
#[derive(Parser, Debug, Clone)]
pub struct PaymentArgs {
    /// Hex-encoded secp256k1 key used to sign token-contract payment messages
    #[arg(long, env = "SIGNER_KEY", hide_env_values = true)]
    pub signer_key: Option<String>,

    /// Fixed USD price of the platform token
    #[arg(long, env = "TOKEN_USD_PRICE", default_value = "0.125")]
    pub token_usd_price: Decimal,

    /// Quote API base URL (CoinMarketCap-compatible)
    #[arg(long, env = "RATE_API_URL", default_value = "https://pro-api.coinmarketcap.com")]
    pub rate_api_url: String,

    /// Quote API key
    #[arg(long, env = "RATE_API_KEY", hide_env_values = true)]
    pub rate_api_key: Option<String>,

    /// Cached rates younger than this are served without a lookup
    #[arg(long, env = "RATE_REFRESH_SECS", default_value = "600")]
    pub rate_refresh_secs: u64,

    /// Oldest cached rate still usable when the quote API fails
    #[arg(long, env = "RATE_MAX_STALENESS_SECS", default_value = "3600")]
    pub rate_max_staleness_secs: u64,

    /// Quote slug of the native chain coin (ether payments on the token-contract rail)
    #[arg(long, env = "ETHER_SLUG", default_value = "ethereum")]
    pub ether_slug: String,

    /// Wallet service base URL (coin-wallet rail)
    #[arg(long, env = "WALLET_URL")]
    pub wallet_url: Option<String>,

    /// Coin settled by the wallet rail
    #[arg(long, env = "WALLET_COIN", default_value = "bitcoin-cash")]
    pub wallet_coin: String,

    /// Forwarding service base URL (forwarding rail)
    #[arg(long, env = "FORWARDER_URL")]
    pub forwarder_url: Option<String>,

    /// Forwarding service API token
    #[arg(long, env = "FORWARDER_TOKEN", hide_env_values = true)]
    pub forwarder_token: Option<String>,

    /// Address the forwarding service sends received funds to
    #[arg(long, env = "FORWARD_DESTINATION")]
    pub forward_destination: Option<String>,

    /// Coin settled by the forwarding rail
    #[arg(long, env = "FORWARD_COIN", default_value = "dash")]
    pub forward_coin: String,

    /// Card processor base URL
    #[arg(long, env = "CARD_API_URL", default_value = "https://api.stripe.com")]
    pub card_api_url: String,

    /// Card processor secret key
    #[arg(long, env = "CARD_SECRET_KEY", hide_env_values = true)]
    pub card_secret_key: Option<String>,

    /// Payment contract address shown for the token-contract rail
    #[arg(long, env = "TOKEN_DEPOSIT_ADDRESS")]
    pub token_deposit_address: Option<String>,

    /// Static deposit address shown for the coin-wallet rail
    #[arg(long, env = "WALLET_DEPOSIT_ADDRESS")]
    pub wallet_deposit_address: Option<String>,
}

impl PaymentArgs {
    pub fn rate_refresh(&self) -> Duration {
        Duration::from_secs(self.rate_refresh_secs)
    }

    pub fn rate_max_staleness(&self) -> Duration {
        Duration::from_secs(self.rate_max_staleness_secs)
    }
}

/// Credit prices for metered operations
#[derive(Parser, Debug, Clone)]
pub struct PricingArgs {
    /// Credits per GB-month for content on the public network
    #[arg(long, env = "PRICE_PUBLIC_GB_MONTH", default_value = "0.05")]
    pub public_gb_month: Decimal,

    /// Credits per GB-month for content on a private network
    #[arg(long, env = "PRICE_PRIVATE_GB_MONTH", default_value = "0.07")]
    pub private_gb_month: Decimal,

    /// Credits per name-record publication
    #[arg(long, env = "PRICE_IPNS_PUBLISH", default_value = "0.1")]
    pub ipns_publish: Decimal,

    /// Credits per pubsub message
    #[arg(long, env = "PRICE_PUBSUB_PUBLISH", default_value = "0.01")]
    pub pubsub_publish: Decimal,

    /// Credits per ed25519 key
    #[arg(long, env = "PRICE_ED25519_KEY", default_value = "0.1")]
    pub ed25519_key: Decimal,

    /// Credits per RSA key
    #[arg(long, env = "PRICE_RSA_KEY", default_value = "0.2")]
    pub rsa_key: Decimal,

    /// Longest hold time accepted for pins and uploads, in months
    #[arg(long, env = "MAX_HOLD_MONTHS", default_value = "24")]
    pub max_hold_months: u32,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.dev_mode {
            if self.jwt_secret.is_none() {
                return Err("JWT_SECRET is required in production mode".to_string());
            }
            if self.payments.signer_key.is_none() {
                return Err("SIGNER_KEY is required in production mode".to_string());
            }
        }

        if self.payments.rate_max_staleness_secs < self.payments.rate_refresh_secs {
            return Err(
                "RATE_MAX_STALENESS_SECS must be greater than or equal to RATE_REFRESH_SECS"
                    .to_string(),
            );
        }

        if self.payments.token_usd_price <= Decimal::ZERO {
            return Err("TOKEN_USD_PRICE must be positive".to_string());
        }

        if self.payments.forwarder_url.is_some() && self.payments.forward_destination.is_none() {
            return Err("FORWARD_DESTINATION is required when FORWARDER_URL is set".to_string());
        }

        let p = &self.pricing;
        let prices = [
            p.public_gb_month,
            p.private_gb_month,
            p.ipns_publish,
            p.pubsub_publish,
            p.ed25519_key,
            p.rsa_key,
        ];
        if prices.iter().any(|price| price.is_sign_negative()) {
            return Err("prices must not be negative".to_string());
        }
        if p.max_hold_months == 0 {
            return Err("MAX_HOLD_MONTHS must be at least 1".to_string());
        }

        Ok(())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
