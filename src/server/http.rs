//! HTTP server implementation
//!
//! hyper http1 over TokioIo, one task per connection. The accept loop and
//! every open connection watch the same shutdown signal as the queue
//! resilience loop: on shutdown the listener closes, keep-alive connections
//! finish their current request, and stragglers are aborted after the grace
//! period.

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, AUTHORIZATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::auth::JwtValidator;
use crate::config::Args;
use crate::db::MongoClient;
use crate::dispatch::{Dispatcher, ObjectSizer};
use crate::ledger::CreditLedger;
use crate::payments::PaymentLifecycle;
use crate::queue::QueueManager;
use crate::routes::{self, ApiRequest, JsonResponse, MAX_BODY_BYTES};
use crate::types::{Result, TollgateError};

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub auth: JwtValidator,
    pub ledger: CreditLedger,
    pub dispatcher: Dispatcher,
    pub payments: Arc<PaymentLifecycle>,
    pub queues: Arc<QueueManager>,
    /// Sizes pinned objects for pricing
    pub sizer: Arc<dyn ObjectSizer>,
    /// `None` when running on in-memory stores (dev mode)
    pub mongo: Option<MongoClient>,
    pub ready: AtomicBool,
}

impl AppState {
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn mark_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

/// Serve until `shutdown` flips to true, then drain
pub async fn run(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = TcpListener::bind(state.args.listen).await?;

    info!("Tollgate listening on {} as node {}", state.args.listen, state.args.node_id);

    if state.args.dev_mode {
        warn!("Development mode enabled - in-memory backends may be in use");
    }

    state.mark_ready(true);
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let state = Arc::clone(&state);
                    let shutdown = shutdown.clone();
                    connections.spawn(serve_connection(state, stream, addr, shutdown));
                }
                Err(e) => {
                    error!("Error accepting connection: {:?}", e);
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    state.mark_ready(false);
    drop(listener);
    info!(in_flight = connections.len(), "HTTP listener closed, draining connections");

    let grace = state.args.shutdown_grace();
    let drained = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(remaining = connections.len(), "shutdown grace period elapsed, aborting connections");
        connections.abort_all();
    }

    Ok(())
}

async fn serve_connection(
    state: Arc<AppState>,
    stream: tokio::net::TcpStream,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_request(state, addr, req).await }
    });

    let conn = http1::Builder::new().serve_connection(io, service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    if let Err(err) = result {
        debug!("Error serving connection from {}: {:?}", addr, err);
    }
}

/// Collect the request and hand it to the router
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<JsonResponse, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if method == Method::OPTIONS {
        return Ok(preflight_response());
    }

    let authorization = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            let err = TollgateError::BadRequest(format!("could not read request body: {}", e));
            return Ok(routes::error_response(&err));
        }
    };

    let response = routes::route(
        &state,
        ApiRequest {
            method: method.clone(),
            path: path.clone(),
            authorization,
            body,
        },
    )
    .await;

    info!("[{}] {} {} -> {}", addr, method, path, response.status().as_u16());
    Ok(response)
}

/// CORS preflight response
fn preflight_response() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert("Access-Control-Allow-Origin", HeaderValue::from_static("*"));
    headers.insert("Access-Control-Allow-Headers", HeaderValue::from_static("*"));
    headers.insert("Access-Control-Allow-Methods", HeaderValue::from_static("GET, POST, OPTIONS"));
    response
}
