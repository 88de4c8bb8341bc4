//! HTTP/1 client for a cellstore server.
//!
//! Opens one connection per call; callers needing pipelining should keep
//! their own hyper connection.

use crate::server::BATCH_PATH;
use crate::service::ServiceStats;
use bytes::Bytes;
use cellstore_cell::{BatchRequest, BatchResponse};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Body;
use hyper::client::conn::http1;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use tokio::net::TcpStream;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(#[from] std::io::Error),
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),
    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),
    #[error("server returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct CellClient {
    addr: SocketAddr,
}

impl CellClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Post a batch and decode the response.
    pub async fn send(&self, batch: &BatchRequest) -> Result<BatchResponse, ClientError> {
        let body = Full::new(Bytes::from(serde_json::to_vec(batch)?));
        let req = Request::builder()
            .method(Method::POST)
            .uri(BATCH_PATH)
            .header(HOST, self.addr.to_string())
            .header(CONTENT_TYPE, "application/json")
            .body(body)?;
        self.json(req).await
    }

    pub async fn health(&self) -> Result<String, ClientError> {
        let bytes = self.call(self.get("/health")?).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn stats(&self) -> Result<ServiceStats, ClientError> {
        self.json(self.get("/stats")?).await
    }

    fn get(&self, path: &str) -> Result<Request<Empty<Bytes>>, ClientError> {
        Ok(Request::builder()
            .method(Method::GET)
            .uri(path)
            .header(HOST, self.addr.to_string())
            .body(Empty::new())?)
    }

    async fn json<B, T>(&self, req: Request<B>) -> Result<T, ClientError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
        T: DeserializeOwned,
    {
        let bytes = self.call(req).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn call<B>(&self, req: Request<B>) -> Result<Bytes, ClientError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let stream = TcpStream::connect(self.addr).await?;
        let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!("client connection error: {}", e);
            }
        });

        let resp = sender.send_request(req).await?;
        let status = resp.status();
        let bytes = resp.into_body().collect().await?.to_bytes();
        if !status.is_success() {
            return Err(ClientError::Status {
                status,
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        Ok(bytes)
    }
}
