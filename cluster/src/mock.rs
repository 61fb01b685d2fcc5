//! A scriptable backend double for routing and executor tests.

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use backend::{BackendApi, ClientError, QueryRequest, QueryResult, WriteError};

#[derive(Debug)]
pub(crate) struct MockBackend {
    name: String,
    db: String,
    active: AtomicBool,
    write_only: AtomicBool,
    fail_writes: AtomicBool,
    closed: AtomicBool,
    response_status: Mutex<u16>,
    response_body: Mutex<String>,
    written: Mutex<Vec<Bytes>>,
    queries: Mutex<Vec<QueryRequest>>,
}

impl MockBackend {
    pub(crate) fn healthy(name: &str) -> Arc<Self> {
        Self::healthy_with_db(name, "test")
    }

    pub(crate) fn healthy_with_db(name: &str, db: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            db: db.to_owned(),
            active: AtomicBool::new(true),
            write_only: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            response_status: Mutex::new(200),
            response_body: Mutex::new(r#"{"results":[{"statement_id":0}]}"#.to_owned()),
            written: Mutex::new(Vec::new()),
            queries: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    pub(crate) fn set_write_only(&self, write_only: bool) {
        self.write_only.store(write_only, Ordering::Relaxed);
    }

    pub(crate) fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::Relaxed);
    }

    pub(crate) fn respond_with(&self, body: String) {
        self.respond_with_status(200, body);
    }

    pub(crate) fn respond_with_status(&self, status: u16, body: String) {
        *self.response_status.lock() = status;
        *self.response_body.lock() = body;
    }

    pub(crate) fn written(&self) -> Vec<Bytes> {
        self.written.lock().clone()
    }

    pub(crate) fn queries(&self) -> Vec<QueryRequest> {
        self.queries.lock().clone()
    }

    pub(crate) fn closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn respond(&self, req: &QueryRequest) -> QueryResult {
        self.queries.lock().push(req.clone());
        QueryResult {
            status: StatusCode::from_u16(*self.response_status.lock())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            headers: HeaderMap::new(),
            body: Bytes::from(self.response_body.lock().clone()),
        }
    }
}

#[async_trait]
impl BackendApi for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn url(&self) -> &str {
        "http://mock:8086"
    }

    fn target_db(&self) -> &str {
        &self.db
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    fn is_write_only(&self) -> bool {
        self.write_only.load(Ordering::Relaxed)
    }

    async fn write(&self, line: Bytes) -> Result<(), WriteError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(WriteError::Closed);
        }
        self.written.lock().push(line);
        Ok(())
    }

    async fn query(&self, req: &QueryRequest) -> Result<QueryResult, ClientError> {
        Ok(self.respond(req))
    }

    async fn query_sink(&self, req: &QueryRequest) -> Result<QueryResult, ClientError> {
        Ok(self.respond(req))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}
