//! HTTP client for one upstream backend.
//!
//! Each backend gets its own [`HttpBackend`] with a health-probe task that
//! flips the `active` flag, gzip-framed writes, and two query modes: a
//! verbatim passthrough used when routing by measurement, and a buffered
//! sink used by the fan-out executor.

use bytes::Bytes;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use http::{
    header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH},
    HeaderMap, Method, StatusCode,
};
use serde::Deserialize;
use std::{
    collections::HashMap,
    io::{Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::BackendConfig;

/// Protocol version advertised on `/ping` and every proxy response.
pub const VERSION: &str = "1.4.4";

/// Write failures, keyed by the backend's HTTP status.
///
/// `BadRequest` and `NotFound` mark a poison batch: retrying it can never
/// succeed, so callers drop it instead of spilling.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("bad request")]
    BadRequest,

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found")]
    NotFound,

    #[error("internal error")]
    Internal,

    #[error("unknown error")]
    Unknown,

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("backend is shutting down")]
    Closed,
}

impl WriteError {
    /// True when retrying the batch can never succeed.
    pub fn is_poison(&self) -> bool {
        matches!(self, Self::BadRequest | Self::NotFound)
    }
}

/// Errors from the query path and client construction.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("error decoding gzip body: {0}")]
    InvalidGzip(std::io::Error),
}

/// The parts of a client query the proxy forwards upstream.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub method: Method,
    /// Merged URL and urlencoded-body parameters.
    pub form: HashMap<String, String>,
    /// The client's `Accept-Encoding`, forwarded only on passthrough so the
    /// backend negotiates compression with the real client.
    pub accept_encoding: Option<String>,
}

impl QueryRequest {
    pub fn new(method: Method, form: HashMap<String, String>) -> Self {
        Self {
            method,
            form,
            accept_encoding: None,
        }
    }

    pub fn with_accept_encoding(mut self, accept_encoding: Option<String>) -> Self {
        self.accept_encoding = accept_encoding;
        self
    }

    /// The statement being executed, if any.
    pub fn statement(&self) -> &str {
        self.form.get("q").map(String::as_str).unwrap_or_default()
    }
}

/// A buffered backend response.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl QueryResult {
    /// The `error` field of an InfluxDB error response body, when present.
    pub fn error_message(&self) -> Option<String> {
        #[derive(Deserialize)]
        struct ErrorBody {
            error: String,
        }
        serde_json::from_slice::<ErrorBody>(&self.body)
            .ok()
            .map(|b| b.error)
    }
}

/// gzip-compresses a write payload.
pub fn compress(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload)?;
    encoder.finish()
}

/// Inverse of [`compress`].
pub fn decompress(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(payload);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// One upstream backend addressed by URL, target database and credentials.
#[derive(Debug)]
pub struct HttpBackend {
    name: String,
    url: String,
    db: String,
    username: String,
    password: String,
    write_only: bool,
    check_interval: Duration,
    client: reqwest::Client,
    active: AtomicBool,
    shutdown: CancellationToken,
    probe: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl HttpBackend {
    /// Builds the client and starts its health-probe task.
    pub fn new(name: &str, cfg: &BackendConfig) -> Result<Arc<Self>, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout))
            .connect_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(100)
            .danger_accept_invalid_certs(cfg.url.starts_with("https"))
            .build()?;

        let backend = Arc::new(Self {
            name: name.to_owned(),
            url: cfg.url.trim_end_matches('/').to_owned(),
            db: cfg.db.clone(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            write_only: cfg.write_only,
            check_interval: Duration::from_millis(cfg.check_interval),
            client,
            active: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
            probe: parking_lot::Mutex::new(None),
        });

        let probe = tokio::spawn(Arc::clone(&backend).check_active());
        *backend.probe.lock() = Some(probe);
        Ok(backend)
    }

    /// Health-probe loop: the backend is active iff the last `/ping` round
    /// trip completed within one interval. Probe failures never abort the
    /// loop, they only flip the flag.
    async fn check_active(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = interval.tick() => {
                    let alive = self.ping().await.is_ok();
                    let was = self.active.swap(alive, Ordering::Relaxed);
                    if was != alive {
                        warn!(backend = %self.name, url = %self.url, alive, "backend health changed");
                    }
                }
            }
        }
    }

    /// Issues `GET /ping`, returning the advertised backend version. Any
    /// HTTP response counts as alive; only transport failures are errors.
    pub async fn ping(&self) -> Result<String, ClientError> {
        let resp = self.client.get(format!("{}/ping", self.url)).send().await?;
        let version = resp
            .headers()
            .get("X-Influxdb-Version")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        let status = resp.status();
        if status != StatusCode::NO_CONTENT {
            let body = resp.bytes().await.unwrap_or_default();
            debug!(
                backend = %self.name,
                status = status.as_u16(),
                body = %String::from_utf8_lossy(&body),
                "unexpected ping response"
            );
        }
        Ok(version)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The backend's own target database.
    pub fn target_db(&self) -> &str {
        &self.db
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn is_write_only(&self) -> bool {
        self.write_only
    }

    fn write_params(&self) -> Vec<(&str, &str)> {
        let mut params = vec![("db", self.db.as_str())];
        if !self.username.is_empty() || !self.password.is_empty() {
            params.push(("u", self.username.as_str()));
            params.push(("p", self.password.as_str()));
        }
        params
    }

    /// Compresses and writes a line-protocol payload.
    pub async fn write(&self, payload: &[u8]) -> Result<(), WriteError> {
        let compressed = compress(payload).map_err(|_| WriteError::Unknown)?;
        self.write_compressed(Bytes::from(compressed)).await
    }

    /// Writes an already gzip-compressed payload to `/write`.
    pub async fn write_compressed(&self, payload: Bytes) -> Result<(), WriteError> {
        let resp = self
            .client
            .post(format!("{}/write", self.url))
            .query(&self.write_params())
            .header(CONTENT_ENCODING, "gzip")
            .body(payload)
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(());
        }
        let body = resp.bytes().await.unwrap_or_default();
        warn!(
            backend = %self.name,
            status = status.as_u16(),
            body = %String::from_utf8_lossy(&body),
            "write rejected"
        );
        Err(match status.as_u16() {
            400 => WriteError::BadRequest,
            401 => WriteError::Unauthorized,
            404 => WriteError::NotFound,
            500 => WriteError::Internal,
            _ => WriteError::Unknown,
        })
    }

    fn query_form(&self, req: &QueryRequest) -> HashMap<String, String> {
        let mut form = req.form.clone();
        form.insert("db".to_owned(), self.db.clone());
        form.remove("u");
        form.remove("p");
        if !self.username.is_empty() || !self.password.is_empty() {
            form.insert("u".to_owned(), self.username.clone());
            form.insert("p".to_owned(), self.password.clone());
        }
        form
    }

    /// Forwards a query and returns the backend response verbatim, for
    /// mirroring straight back to the client. Compression stays whatever
    /// the real client negotiated.
    pub async fn query(&self, req: &QueryRequest) -> Result<QueryResult, ClientError> {
        let mut builder = self
            .client
            .request(req.method.clone(), format!("{}/query", self.url))
            .query(&self.query_form(req));
        if let Some(accept_encoding) = &req.accept_encoding {
            builder = builder.header(ACCEPT_ENCODING, accept_encoding);
        }
        let resp = builder.send().await?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await?;
        Ok(QueryResult {
            status,
            headers,
            body,
        })
    }

    /// Forwards a query and buffers the response for merging, transparently
    /// decompressing a gzip body.
    pub async fn query_sink(&self, req: &QueryRequest) -> Result<QueryResult, ClientError> {
        let resp = self
            .client
            .request(req.method.clone(), format!("{}/query", self.url))
            .query(&self.query_form(req))
            .send()
            .await?;
        let status = resp.status();
        let mut headers = resp.headers().clone();
        let mut body = resp.bytes().await?;

        let gzipped = headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("gzip"));
        if gzipped {
            body = Bytes::from(decompress(&body).map_err(ClientError::InvalidGzip)?);
            headers.remove(CONTENT_ENCODING);
            headers.remove(CONTENT_LENGTH);
        }

        if status.as_u16() >= 400 {
            debug!(
                backend = %self.name,
                status = status.as_u16(),
                query = req.statement(),
                "backend rejected query"
            );
        }
        Ok(QueryResult {
            status,
            headers,
            body,
        })
    }

    /// Stops the health probe. Idempotent.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let probe = self.probe.lock().take();
        if let Some(probe) = probe {
            let _ = probe.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn test_config(url: &str) -> BackendConfig {
        BackendConfig {
            url: url.to_owned(),
            db: "metrics".to_owned(),
            username: String::new(),
            password: String::new(),
            flush_size: 1,
            flush_time: 100,
            timeout: 2_000,
            check_interval: 10_000,
            rewrite_interval: 10_000,
            conn_pool_size: 2,
            write_only: false,
        }
    }

    #[tokio::test]
    async fn ping_reports_version() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/ping")
            .with_status(204)
            .with_header("X-Influxdb-Version", "1.8.10")
            .create_async()
            .await;

        let backend = HttpBackend::new("b1", &test_config(&server.url())).unwrap();
        assert_eq!(backend.ping().await.unwrap(), "1.8.10");
        backend.close().await;
    }

    #[tokio::test]
    async fn write_compressed_sends_gzip_frame() {
        let mut server = mockito::Server::new_async().await;
        let payload = b"cpu value=1 1434055562000000000\n";
        let compressed = compress(payload).unwrap();
        let mock = server
            .mock("POST", "/write")
            .match_query(mockito::Matcher::UrlEncoded("db".into(), "metrics".into()))
            .match_header("Content-Encoding", "gzip")
            .match_body(compressed.clone())
            .with_status(204)
            .create_async()
            .await;

        let backend = HttpBackend::new("b1", &test_config(&server.url())).unwrap();
        backend
            .write_compressed(Bytes::from(compressed))
            .await
            .unwrap();
        mock.assert_async().await;
        backend.close().await;
    }

    #[tokio::test]
    async fn write_maps_statuses_to_error_kinds() {
        for (status, poison) in [(400, true), (401, false), (404, true), (500, false), (503, false)]
        {
            let mut server = mockito::Server::new_async().await;
            let _mock = server
                .mock("POST", "/write")
                .with_status(status)
                .create_async()
                .await;
            let backend = HttpBackend::new("b1", &test_config(&server.url())).unwrap();
            let err = backend.write(b"cpu value=1").await.unwrap_err();
            assert_eq!(err.is_poison(), poison, "status {status}");
            match status {
                400 => assert_matches!(err, WriteError::BadRequest),
                401 => assert_matches!(err, WriteError::Unauthorized),
                404 => assert_matches!(err, WriteError::NotFound),
                500 => assert_matches!(err, WriteError::Internal),
                _ => assert_matches!(err, WriteError::Unknown),
            }
            backend.close().await;
        }
    }

    #[tokio::test]
    async fn query_sink_overrides_credentials_and_db() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/query")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("db".into(), "metrics".into()),
                mockito::Matcher::UrlEncoded("u".into(), "admin".into()),
                mockito::Matcher::UrlEncoded("p".into(), "secret".into()),
                mockito::Matcher::UrlEncoded("q".into(), "show measurements".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"results":[]}"#)
            .create_async()
            .await;

        let mut cfg = test_config(&server.url());
        cfg.username = "admin".to_owned();
        cfg.password = "secret".to_owned();
        let backend = HttpBackend::new("b1", &cfg).unwrap();

        let mut form = HashMap::new();
        form.insert("q".to_owned(), "show measurements".to_owned());
        form.insert("db".to_owned(), "client_db".to_owned());
        form.insert("u".to_owned(), "client_user".to_owned());
        form.insert("p".to_owned(), "client_pass".to_owned());
        let result = backend
            .query_sink(&QueryRequest::new(Method::GET, form))
            .await
            .unwrap();
        assert_eq!(result.status, StatusCode::OK);
        assert_eq!(&result.body[..], br#"{"results":[]}"#);
        mock.assert_async().await;
        backend.close().await;
    }

    #[tokio::test]
    async fn query_sink_decompresses_gzip_responses() {
        let mut server = mockito::Server::new_async().await;
        let body = r#"{"results":[{"statement_id":0}]}"#;
        let _mock = server
            .mock("GET", "/query")
            .with_status(200)
            .with_header("Content-Encoding", "gzip")
            .with_body(compress(body.as_bytes()).unwrap())
            .create_async()
            .await;

        let backend = HttpBackend::new("b1", &test_config(&server.url())).unwrap();
        let result = backend
            .query_sink(&QueryRequest::new(Method::GET, HashMap::new()))
            .await
            .unwrap();
        assert_eq!(&result.body[..], body.as_bytes());
        assert!(result.headers.get(CONTENT_ENCODING).is_none());
        backend.close().await;
    }

    #[tokio::test]
    async fn error_bodies_surface_messages() {
        let result = QueryResult {
            status: StatusCode::BAD_REQUEST,
            headers: HeaderMap::new(),
            body: Bytes::from(r#"{"error":"database not found: nope"}"#),
        };
        assert_eq!(
            result.error_message().as_deref(),
            Some("database not found: nope")
        );
    }
}
