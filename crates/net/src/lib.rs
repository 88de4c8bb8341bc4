//! HTTP networking layer for cellstore.
//!
//! Provides:
//! - `CellService`: the seam between the transport and batch processing,
//!   implemented by `CellRequestProcessor`
//! - `CellServer`: hyper HTTP/1 server routing `/cellstorage`, `/health`
//!   and `/stats` to a `CellService`
//! - `CellClient`: minimal HTTP/1 client that posts batches to a server

pub mod client;
pub mod server;
pub mod service;

pub use client::{CellClient, ClientError};
pub use server::CellServer;
pub use service::{CellService, ServiceStats};
