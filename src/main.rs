//! Tollgate - credit-metered job gateway

use clap::Parser;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use tollgate::{
    auth::JwtValidator,
    config::Args,
    db::MongoClient,
    dispatch::{Dispatcher, IpfsObjectSizer, PricingPolicy},
    ledger::{CreditLedger, CreditStore, InMemoryCreditStore, MongoCreditStore},
    logging,
    payments::{
        CardProcessor, DevCardProcessor, DevForwarder, DevWallet, HttpCardProcessor, HttpPaymentForwarder,
        HttpWalletService, InMemoryPaymentStore, LifecycleConfig, MongoPaymentStore, PaymentForwarder,
        PaymentLifecycle, PaymentSigner, PaymentStore, QuoteApiSource, Rails, RateOracle, WalletService,
    },
    queue::{BrokerConnector, HandleSpec, MemoryBroker, NatsConnector, QueueManager},
    server,
};

/// Account seeded into the in-memory ledger in dev mode
const DEV_ACCOUNT: &str = "dev";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    logging::init(&args.log_level, args.log_format);

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Tollgate - credit-metered job gateway");
    info!("======================================");
    info!("Node ID: {}", args.node_id);
    info!("Listen: {}", args.listen);
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("NATS: {}", args.nats.nats_url);
    info!("MongoDB: {}", args.mongodb_uri);
    info!("IPFS API: {}", args.ipfs_api_url);
    info!("======================================");

    // Connect to MongoDB (optional in dev mode)
    let mongo = match MongoClient::new(&args.mongodb_uri, &args.mongodb_db).await {
        Ok(client) => {
            info!("MongoDB connected successfully");
            Some(client)
        }
        Err(e) => {
            if args.dev_mode {
                warn!("MongoDB connection failed (dev mode, continuing without): {}", e);
                None
            } else {
                error!("MongoDB connection failed: {}", e);
                std::process::exit(1);
            }
        }
    };

    let (credits, payment_store): (Arc<dyn CreditStore>, Arc<dyn PaymentStore>) = match &mongo {
        Some(client) => (
            Arc::new(MongoCreditStore::new(client).await?),
            Arc::new(MongoPaymentStore::new(client).await?),
        ),
        None => {
            let store = InMemoryCreditStore::new();
            store.open_account(DEV_ACCOUNT, Decimal::from(100), false)?;
            warn!(account = DEV_ACCOUNT, "using in-memory ledger, balances are lost on exit");
            (Arc::new(store), Arc::new(InMemoryPaymentStore::new()))
        }
    };
    let ledger = CreditLedger::new(credits);

    // Open one job handle per class; startup fails if any cannot be opened
    let nats: Arc<dyn BrokerConnector> = Arc::new(NatsConnector::new(
        args.nats.clone(),
        format!("tollgate-{}", args.node_id),
    ));
    let (queues, faults) = match QueueManager::start(nats, HandleSpec::all()).await {
        Ok(started) => {
            info!("NATS job handles opened");
            started
        }
        Err(e) => {
            if args.dev_mode {
                warn!("NATS connection failed (dev mode, jobs stay in memory): {}", e);
                QueueManager::start(Arc::new(MemoryBroker::new()), HandleSpec::all()).await?
            } else {
                error!("NATS connection failed: {}", e);
                std::process::exit(1);
            }
        }
    };

    let signer = match &args.payments.signer_key {
        Some(key) => PaymentSigner::from_hex(key)?,
        None => {
            warn!("SIGNER_KEY not set, using an ephemeral signing key");
            PaymentSigner::random()
        }
    };
    info!("Payment signer: {}", signer.address());

    let oracle = RateOracle::new(
        Arc::new(QuoteApiSource::new(
            args.payments.rate_api_url.clone(),
            args.payments.rate_api_key.clone(),
        )?),
        args.payments.rate_refresh(),
        args.payments.rate_max_staleness(),
        args.payments.token_usd_price,
    );

    let rails = build_rails(&args)?;
    let lifecycle = PaymentLifecycle::new(
        ledger.clone(),
        queues.clone(),
        payment_store,
        Arc::new(oracle),
        Arc::new(signer),
        rails,
        LifecycleConfig::from_args(&args.payments),
    );

    let auth = match &args.jwt_secret {
        Some(secret) => JwtValidator::new(secret.clone(), args.jwt_expiry_seconds)?,
        None => JwtValidator::new_dev(),
    };
    if mongo.is_none() {
        if let Ok(token) = auth.generate_token(DEV_ACCOUNT) {
            info!(account = DEV_ACCOUNT, "dev token: {}", token);
        }
    }

    let dispatcher = Dispatcher::new(ledger.clone(), queues.clone(), PricingPolicy::from_args(&args.pricing));
    let sizer = Arc::new(IpfsObjectSizer::new(args.ipfs_api_url.clone())?);

    let state = Arc::new(server::AppState {
        args,
        auth,
        ledger,
        dispatcher,
        payments: Arc::new(lifecycle),
        queues: queues.clone(),
        sizer,
        mongo,
        ready: Default::default(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let http = server::run(state, shutdown_rx.clone());
    let resilience = Arc::clone(&queues).run(faults, shutdown_rx);
    tokio::pin!(http, resilience);

    tokio::select! {
        result = &mut resilience => {
            if let Err(e) = result {
                error!("Job broker failure, stopping: {}", e);
                std::process::exit(1);
            }
            if let Err(e) = http.await {
                error!("Server error: {:?}", e);
                std::process::exit(1);
            }
        }
        result = &mut http => {
            if let Err(e) = result {
                error!("Server error: {:?}", e);
                std::process::exit(1);
            }
            if let Err(e) = resilience.await {
                error!("Job broker failure during shutdown: {}", e);
                std::process::exit(1);
            }
        }
    }

    // connections have drained; flush whatever they published
    queues.close_all().await;
    info!("Tollgate stopped");
    Ok(())
}

/// Real rails when configured, dev stubs in dev mode, otherwise disabled
fn build_rails(args: &Args) -> anyhow::Result<Rails> {
    let payments = &args.payments;

    let wallet: Option<Arc<dyn WalletService>> = match &payments.wallet_url {
        Some(url) => Some(Arc::new(HttpWalletService::new(url.clone())?)),
        None if args.dev_mode => Some(Arc::new(DevWallet)),
        None => None,
    };

    let forwarder: Option<Arc<dyn PaymentForwarder>> =
        match (&payments.forwarder_url, &payments.forwarder_token, &payments.forward_destination) {
            (Some(url), Some(token), Some(destination)) => Some(Arc::new(HttpPaymentForwarder::new(
                url.clone(),
                token.clone(),
                destination.clone(),
            )?)),
            _ if args.dev_mode => Some(Arc::new(DevForwarder::with_fee(0))),
            _ => None,
        };

    let card: Option<Arc<dyn CardProcessor>> = match &payments.card_secret_key {
        Some(secret) => Some(Arc::new(HttpCardProcessor::new(
            payments.card_api_url.clone(),
            secret.clone(),
        )?)),
        None if args.dev_mode => Some(Arc::new(DevCardProcessor::default())),
        None => None,
    };

    for (rail, enabled) in [
        ("coin-wallet", wallet.is_some()),
        ("forwarding", forwarder.is_some()),
        ("card", card.is_some()),
    ] {
        if !enabled {
            warn!(rail, "payment rail not configured, requests will be rejected");
        }
    }

    Ok(Rails { wallet, forwarder, card })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("could not install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
