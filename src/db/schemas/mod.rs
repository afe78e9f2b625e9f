//! Database schemas for Tollgate

mod account;
mod metadata;
mod payment;

pub use account::{AccountDoc, ACCOUNT_COLLECTION};
pub use metadata::Metadata;
pub use payment::{
    PaymentCounterDoc, PaymentDoc, PAYMENT_COLLECTION, PAYMENT_COUNTER_COLLECTION,
};
