//! Credit top-ups across settlement rails

pub mod lifecycle;
pub mod rails;
pub mod rates;
pub mod signer;
pub mod store;

pub use lifecycle::{
    CardReceipt, DepositOffer, LifecycleConfig, PaymentLifecycle, Rails, TokenPaymentOffer,
};
pub use rails::{
    CardProcessor, DevCardProcessor, DevForwarder, DevWallet, HttpCardProcessor, HttpPaymentForwarder,
    HttpWalletService, PaymentForwarder, WalletService,
};
pub use rates::{QuoteApiSource, RateOracle, RateSource, StaticRates};
pub use signer::{Address, PaymentMethod, PaymentSigner, SignedPaymentMessage};
pub use store::{InMemoryPaymentStore, MongoPaymentStore, Payment, PaymentRail, PaymentState, PaymentStore};
