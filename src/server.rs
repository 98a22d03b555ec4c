use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    Method, Request, Response, StatusCode,
    body::Incoming,
    header::{self, HeaderName, HeaderValue},
    service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo, TokioTimer},
    server::{conn::auto::Builder as ConnectionBuilder, graceful::GracefulShutdown},
};
use tokio::{net::TcpListener, sync::oneshot};
use tracing::Instrument as _;

use crate::{
    config::ServerConfig,
    normalize::RequestNormalizer,
    rate_limit::ClientRateLimiter,
    storage::{Store, StoredPage},
};

type CaptureResponse = Response<Full<Bytes>>;

pub const ACKNOWLEDGEMENT: &str = "Eat a cookie bro...";
pub const COLLECTOR_SCRIPT_PATH: &str = "/_";
pub const COLLECTOR_SCRIPT: &[u8] = include_bytes!("../assets/collector.js");

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

const CORS_HEADERS: [(HeaderName, &str); 5] = [
    (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
    (header::ACCESS_CONTROL_ALLOW_METHODS, "*"),
    (header::ACCESS_CONTROL_ALLOW_HEADERS, "*"),
    (header::ACCESS_CONTROL_MAX_AGE, "86400"),
    (header::VARY, "Origin"),
];

#[derive(Debug)]
pub struct ServerHandle {
    pub listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stops accepting, then waits for in-flight connections up to the grace period.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

struct CaptureState {
    limiter: Arc<ClientRateLimiter>,
    normalizer: RequestNormalizer,
    store: Store,
}

pub async fn serve(
    config: &ServerConfig,
    limiter: Arc<ClientRateLimiter>,
    store: Store,
) -> anyhow::Result<ServerHandle> {
    let listen_target = config.listen_target();
    let listener = TcpListener::bind(&listen_target)
        .await
        .map_err(|err| anyhow::anyhow!("bind {listen_target}: {err}"))?;
    let listen_addr = listener
        .local_addr()
        .map_err(|err| anyhow::anyhow!("get local_addr: {err}"))?;

    let state = Arc::new(CaptureState {
        limiter,
        normalizer: RequestNormalizer::new(config.body_read_timeout()),
        store,
    });
    let mut builder = ConnectionBuilder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(config.header_read_timeout());
    let shutdown_grace = config.shutdown_grace();

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        let graceful = GracefulShutdown::new();
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let (stream, peer) = match accept {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            // EMFILE and friends persist until a connection closes.
                            tracing::warn!("accept error: {err}");
                            if pause_after_accept_error(&mut shutdown_rx).await {
                                continue;
                            }
                            break;
                        }
                    };
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&state);
                    let service =
                        service_fn(move |req| handle_request(req, peer, Arc::clone(&state)));
                    let connection = graceful.watch(builder.serve_connection(io, service).into_owned());
                    tokio::spawn(async move {
                        if let Err(err) = connection.await {
                            tracing::debug!(client = %peer, "connection error: {err}");
                        }
                    });
                }
            }
        }
        drop(listener);

        tokio::select! {
            _ = graceful.shutdown() => tracing::info!("in-flight connections drained"),
            _ = tokio::time::sleep(shutdown_grace) => tracing::warn!(
                grace_ms = shutdown_grace.as_millis() as u64,
                "shutdown grace period elapsed with connections still open"
            ),
        }
    });

    tracing::info!(%listen_addr, "capture server listening");
    Ok(ServerHandle {
        listen_addr,
        shutdown_tx,
        join,
    })
}

/// Returns `false` when shutdown was requested during the pause.
async fn pause_after_accept_error(shutdown_rx: &mut oneshot::Receiver<()>) -> bool {
    tokio::select! {
        _ = shutdown_rx => false,
        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => true,
    }
}

async fn handle_request(
    req: Request<Incoming>,
    peer: SocketAddr,
    state: Arc<CaptureState>,
) -> Result<CaptureResponse, Infallible> {
    let span = tracing::info_span!(
        "capture.request",
        method = %req.method(),
        path = %req.uri().path(),
        client = %peer.ip(),
    );
    let response = route(req, peer, &state).instrument(span).await;
    Ok(with_cors(response))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Capture,
    Script,
    Page(String),
}

fn classify(path: &str) -> Route {
    if path == COLLECTOR_SCRIPT_PATH {
        return Route::Script;
    }
    match path.strip_prefix('/') {
        Some(segment) if !segment.is_empty() && !segment.contains('/') => {
            Route::Page(segment.to_owned())
        }
        _ => Route::Capture,
    }
}

async fn route(req: Request<Incoming>, peer: SocketAddr, state: &CaptureState) -> CaptureResponse {
    let client_key = peer.ip().to_string();
    if !state.limiter.allow(&client_key) {
        tracing::warn!(client = %client_key, "rate limit exceeded");
        return simple_response(StatusCode::TOO_MANY_REQUESTS, "Too many requests");
    }

    if req.method() == Method::OPTIONS {
        return empty_response(StatusCode::NO_CONTENT);
    }

    match classify(req.uri().path()) {
        Route::Script => script_response(),
        Route::Page(endpoint) if matches!(*req.method(), Method::GET | Method::HEAD) => {
            replay_page(&endpoint, state).await
        }
        Route::Page(_) | Route::Capture => capture(req, peer, state).await,
    }
}

async fn capture(req: Request<Incoming>, peer: SocketAddr, state: &CaptureState) -> CaptureResponse {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    let record = match state.normalizer.normalize(req, &peer.to_string()).await {
        Ok(record) => record,
        Err(err) => {
            tracing::error!(client = %peer, error = %err, "request normalization failed");
            return simple_response(StatusCode::INTERNAL_SERVER_ERROR, "Error processing request");
        }
    };

    let key = state.store.next_key(record.timestamp);
    if let Err(err) = state.store.write(&key, &record).await {
        tracing::error!(
            client = %record.address,
            key = %key,
            operation = "write record",
            error = %err,
            "failed to store captured request"
        );
        return simple_response(StatusCode::INTERNAL_SERVER_ERROR, "Error storing request");
    }

    tracing::info!(
        method = %method,
        path = %path,
        client = %record.address,
        status = StatusCode::OK.as_u16(),
        key = %key,
        report = record.report.is_some(),
        body_bytes = record.body.len(),
        "capture request completed"
    );
    simple_response(StatusCode::OK, ACKNOWLEDGEMENT)
}

async fn replay_page(endpoint: &str, state: &CaptureState) -> CaptureResponse {
    match state.store.page(endpoint).await {
        Ok(Some(page)) => page_response(endpoint, page),
        Ok(None) => {
            tracing::debug!(endpoint, "no stored page");
            simple_response(StatusCode::NOT_FOUND, "Page not found")
        }
        Err(err) => {
            tracing::error!(endpoint, error = %err, "failed to load stored page");
            simple_response(StatusCode::INTERNAL_SERVER_ERROR, "Error loading page")
        }
    }
}

fn page_response(endpoint: &str, page: StoredPage) -> CaptureResponse {
    let Ok(status) = StatusCode::from_u16(page.status_code) else {
        tracing::error!(endpoint, status = page.status_code, "stored page has invalid status");
        return simple_response(StatusCode::INTERNAL_SERVER_ERROR, "Error loading page");
    };

    let mut response = Response::new(Full::new(Bytes::from(page.body)));
    *response.status_mut() = status;
    for (name, value) in &page.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().append(name, value);
            }
            _ => tracing::debug!(endpoint, header = %name, "skipping invalid stored header"),
        }
    }
    response
}

fn script_response() -> CaptureResponse {
    let mut response = Response::new(Full::new(Bytes::from_static(COLLECTOR_SCRIPT)));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/javascript"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}

fn simple_response(status: StatusCode, message: &'static str) -> CaptureResponse {
    let mut response = Response::new(Full::new(Bytes::from_static(message.as_bytes())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn empty_response(status: StatusCode) -> CaptureResponse {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn with_cors(mut response: CaptureResponse) -> CaptureResponse {
    let headers = response.headers_mut();
    for (name, value) in CORS_HEADERS {
        headers.insert(name, HeaderValue::from_static(value));
    }
    response
}
