//! Tollgate - credit-metered job gateway
//!
//! Accepts paid IPFS/IPNS/pubsub operations over HTTP, debits the caller's
//! credit balance, and hands the work to background processors through a
//! NATS job broker. Credits are topped up through four payment rails.

pub mod auth;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod ledger;
pub mod logging;
pub mod payments;
pub mod queue;
pub mod routes;
pub mod server;
pub mod types;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{Result, TollgateError};
