#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

//! # backend
//!
//! Everything one upstream backend needs: configuration, the HTTP client
//! with its health probe, and the batching aggregator that buffers writes,
//! offloads flushes to a bounded pool and replays spilled batches.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

pub mod aggregator;
pub mod client;
pub mod config;

pub use aggregator::{Backend, BackendError};
pub use client::{
    compress, decompress, ClientError, HttpBackend, QueryRequest, QueryResult, WriteError, VERSION,
};
pub use config::{BackendConfig, ConfigError, NodeConfig, ProxyConfig};

/// The capability set the cluster and executor need from a backend. A
/// single implementation exists in production; tests substitute doubles.
#[async_trait]
pub trait BackendApi: std::fmt::Debug + Send + Sync {
    /// Configured backend name.
    fn name(&self) -> &str;

    /// Base URL, for log messages.
    fn url(&self) -> &str;

    /// The backend's own target database.
    fn target_db(&self) -> &str;

    /// Result of the most recent health probe.
    fn is_active(&self) -> bool;

    /// Excluded from reads when true.
    fn is_write_only(&self) -> bool;

    /// Enqueues one line-protocol point for batching.
    async fn write(&self, line: Bytes) -> Result<(), WriteError>;

    /// Forwards a query, returning the response verbatim.
    async fn query(&self, req: &QueryRequest) -> Result<QueryResult, ClientError>;

    /// Forwards a query and buffers the (decompressed) response for merging.
    async fn query_sink(&self, req: &QueryRequest) -> Result<QueryResult, ClientError>;

    /// Drains buffers and stops every task owned by the backend.
    async fn close(&self);
}

/// Shorthand for a shared dynamic backend handle.
pub type SharedBackend = Arc<dyn BackendApi>;
