//! Cell request processing for cellstore.
//!
//! A batch of sub-requests against one file URL is validated, ordered by
//! priority and declared dependencies, and dispatched one sub-request at a
//! time to the lock manager or the coherency controller. Each sub-request
//! runs under the file's mutex, so batches from different clients may
//! interleave between sub-requests but never inside one.

pub mod coherency;
pub mod content;
pub mod dependency;
pub mod file;
pub mod partial;
pub mod processor;
pub mod reaper;
pub mod request;

pub use dependency::{BatchError, Decision, DependencyKind, Outcome};
pub use processor::{CellRequestProcessor, CellSettings};
pub use request::{BatchRequest, BatchResponse, SubRequest, SubResponse};
