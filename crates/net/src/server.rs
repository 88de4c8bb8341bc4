//! HTTP/1 server for batch requests.
//!
//! | Route | Description |
//! |-------|-------------|
//! | `POST /cellstorage` | JSON `BatchRequest` in, JSON `BatchResponse` out |
//! | `GET /health` | `ok` |
//! | `GET /stats` | JSON `ServiceStats` |
//!
//! Malformed bodies are transport faults (HTTP 400) and never reach the
//! processor. Bodies over the configured limit get HTTP 413.

use crate::service::CellService;
use bytes::Bytes;
use cellstore_cell::BatchRequest;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;

pub const BATCH_PATH: &str = "/cellstorage";

/// Body limit used unless `with_body_limit` says otherwise.
pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub struct CellServer<S> {
    service: Arc<S>,
    start_time: Instant,
    max_body_bytes: usize,
}

impl<S> Clone for CellServer<S> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            start_time: self.start_time,
            max_body_bytes: self.max_body_bytes,
        }
    }
}

impl<S> std::fmt::Debug for CellServer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellServer")
            .field("max_body_bytes", &self.max_body_bytes)
            .finish_non_exhaustive()
    }
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    resp
}

fn json<T: Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut resp = Response::new(Full::new(Bytes::from(body)));
            resp.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            resp
        }
        Err(e) => {
            tracing::warn!("failed to encode response: {}", e);
            text(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode response")
        }
    }
}

impl<S: CellService> CellServer<S> {
    pub fn new(service: Arc<S>) -> Self {
        Self {
            service,
            start_time: Instant::now(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_body_limit(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    /// Route one request.
    pub async fn handle<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, Infallible>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        let resp = match (req.method(), req.uri().path()) {
            (&Method::POST, BATCH_PATH) => self.batch(req).await,
            (&Method::GET, "/health") => text(StatusCode::OK, "ok"),
            (&Method::GET, "/stats") => {
                let mut stats = self.service.stats().await;
                stats.uptime_secs = self.start_time.elapsed().as_secs();
                json(&stats)
            }
            (_, BATCH_PATH | "/health" | "/stats") => {
                text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
            }
            _ => text(StatusCode::NOT_FOUND, "not found"),
        };
        Ok(resp)
    }

    async fn batch<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        let body = match Limited::new(req.into_body(), self.max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                tracing::debug!(limit = self.max_body_bytes, "request body too large");
                return text(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
            }
            Err(e) => {
                tracing::debug!("failed to read request body: {}", e);
                return text(StatusCode::BAD_REQUEST, "unreadable body");
            }
        };
        let batch: BatchRequest = match serde_json::from_slice(&body) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::debug!("malformed batch: {}", e);
                return text(StatusCode::BAD_REQUEST, format!("malformed batch: {e}"));
            }
        };
        tracing::debug!(url = %batch.url, sub_requests = batch.sub_requests.len(), "batch received");
        json(&self.service.process(batch).await)
    }

    /// Accept connections on `listener` until it fails.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        tracing::info!("serving cellstorage on http://{}{}", listener.local_addr()?, BATCH_PATH);
        loop {
            let (stream, peer) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle(req).await }
                });
                if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                    tracing::debug!(%peer, "connection error: {}", e);
                }
            });
        }
    }
}
