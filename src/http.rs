//! The HTTP front door.
//!
//! Routes `/ping`, `/write`, `/query` and `/reload`, handling the concerns
//! the cluster should not see: request framing, gzip bodies, form parsing
//! and authentication. Every response carries the `X-Influxdb-Version`
//! header so clients treat the proxy as a database.

use bytes::Bytes;
use cluster::{InfluxCluster, QueryError};
use hyper::{
    header::{HeaderValue, ACCEPT_ENCODING, AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE},
    Body, Method, Request, Response, StatusCode,
};
use std::{collections::HashMap, path::PathBuf};
use thiserror::Error;
use tracing::{debug, error, info};

use backend::{NodeConfig, ProxyConfig, QueryRequest};

/// Errors returned by the HTTP request handlers.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested path has no registered handler.
    #[error("not found")]
    NoHandler,

    /// The method is not acceptable for this endpoint.
    #[error("method not allow")]
    MethodNotAllowed,

    /// Credentials are missing or do not match the node configuration.
    #[error("unable to parse authentication credentials")]
    Unauthorized,

    /// The node is locked to one database and the client named another.
    #[error("database not exist")]
    DatabaseNotExist,

    /// The client disconnected mid-body.
    #[error("client disconnected")]
    ClientHangup(hyper::Error),

    /// Decoding a gzip-compressed request body failed.
    #[error("unable to decode gzip body")]
    InvalidGzip(std::io::Error),

    /// The query string or urlencoded body could not be parsed.
    #[error("invalid form body")]
    InvalidForm(#[from] serde_urlencoded::de::Error),

    /// The cluster rejected the query.
    #[error(transparent)]
    Query(#[from] QueryError),

    /// Reloading the configuration file failed.
    #[error("reload failed: {0}")]
    ReloadConfig(#[from] backend::ConfigError),

    /// Rebuilding the routing table failed.
    #[error("reload failed: {0}")]
    ReloadCluster(#[from] cluster::ClusterError),
}

impl Error {
    /// The status code this error is reported with.
    pub fn as_status_code(&self) -> StatusCode {
        match self {
            Self::NoHandler => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::DatabaseNotExist => StatusCode::NOT_FOUND,
            Self::ClientHangup(_) => StatusCode::BAD_REQUEST,
            Self::InvalidGzip(_) => StatusCode::BAD_REQUEST,
            Self::InvalidForm(_) => StatusCode::BAD_REQUEST,
            Self::Query(QueryError::IllegalMethod) => StatusCode::METHOD_NOT_ALLOWED,
            Self::Query(_) => StatusCode::BAD_REQUEST,
            Self::ReloadConfig(_) | Self::ReloadCluster(_) => StatusCode::BAD_REQUEST,
        }
    }
}

/// A specialized `Result` for handler errors.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Request router and handlers, one per proxy process.
#[derive(Debug)]
pub struct HttpDelegate {
    cluster: InfluxCluster,
    node: NodeConfig,
    config_path: PathBuf,
}

impl HttpDelegate {
    pub fn new(cluster: InfluxCluster, node: NodeConfig, config_path: PathBuf) -> Self {
        Self {
            cluster,
            node,
            config_path,
        }
    }

    pub fn cluster(&self) -> &InfluxCluster {
        &self.cluster
    }

    /// Top-level entry: dispatch, then stamp the version header onto
    /// whatever comes back.
    pub async fn route(&self, req: Request<Body>) -> Response<Body> {
        let result = match (req.method(), req.uri().path()) {
            (&Method::GET, "/ping") | (&Method::HEAD, "/ping") => self.ping(),
            (_, "/write") => self.write(req).await,
            (_, "/query") => self.query(req).await,
            (&Method::POST, "/reload") => self.reload().await,
            _ => Err(Error::NoHandler),
        };

        let mut response = result.unwrap_or_else(|e| {
            debug!(error = %e, status = e.as_status_code().as_u16(), "request failed");
            Response::builder()
                .status(e.as_status_code())
                .body(Body::from(format!("{e}\n")))
                .unwrap_or_default()
        });
        response.headers_mut().insert(
            "X-Influxdb-Version",
            HeaderValue::from_static(backend::VERSION),
        );
        response
    }

    fn ping(&self) -> Result<Response<Body>> {
        self.cluster.ping();
        Ok(Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Body::empty())
            .unwrap_or_default())
    }

    async fn write(&self, req: Request<Body>) -> Result<Response<Body>> {
        if req.method() != Method::POST {
            return Err(Error::MethodNotAllowed);
        }
        let params = query_params(&req)?;
        self.authenticate(&req, &params)?;

        if !self.node.db.is_empty()
            && params.get("db").map(String::as_str) != Some(self.node.db.as_str())
        {
            return Err(Error::DatabaseNotExist);
        }
        let precision = params
            .get("precision")
            .cloned()
            .unwrap_or_else(|| "ns".to_owned());

        let gzipped = req
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("gzip"));
        let body = hyper::body::to_bytes(req.into_body())
            .await
            .map_err(Error::ClientHangup)?;
        let body = if gzipped {
            Bytes::from(backend::decompress(&body).map_err(Error::InvalidGzip)?)
        } else {
            body
        };

        self.cluster.write(&body, &precision).await;
        Ok(Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Body::empty())
            .unwrap_or_default())
    }

    async fn query(&self, req: Request<Body>) -> Result<Response<Body>> {
        let params = query_params(&req)?;
        self.authenticate(&req, &params)?;

        let method = req.method().clone();
        let accept_encoding = req
            .headers()
            .get(ACCEPT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        // As with the upstream database, parameters may arrive in the URL,
        // in an urlencoded body, or both; the body wins.
        let mut form = params;
        if method == Method::POST && is_urlencoded(&req) {
            let body = hyper::body::to_bytes(req.into_body())
                .await
                .map_err(Error::ClientHangup)?;
            for (key, value) in serde_urlencoded::from_bytes::<Vec<(String, String)>>(&body)? {
                form.insert(key, value);
            }
        }

        let request = QueryRequest::new(method, form).with_accept_encoding(accept_encoding);
        let result = self.cluster.query(&request).await?;

        let mut builder = Response::builder().status(result.status);
        if let Some(headers) = builder.headers_mut() {
            headers.extend(result.headers.clone());
        }
        Ok(builder
            .body(Body::from(result.body))
            .unwrap_or_default())
    }

    async fn reload(&self) -> Result<Response<Body>> {
        let config = ProxyConfig::from_path(&self.config_path)?;
        self.cluster.reload(&config).await?;
        info!(path = %self.config_path.display(), "configuration reloaded");
        Ok(Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Body::empty())
            .unwrap_or_default())
    }

    /// Validates `u`/`p` query parameters or HTTP Basic credentials against
    /// the node configuration. An empty configured username means anonymous
    /// access is allowed.
    fn authenticate(&self, req: &Request<Body>, params: &HashMap<String, String>) -> Result<()> {
        if self.node.username.is_empty() && self.node.password.is_empty() {
            return Ok(());
        }
        let (username, password) = parse_credentials(req, params);
        if username == self.node.username && password == self.node.password {
            Ok(())
        } else {
            Err(Error::Unauthorized)
        }
    }
}

/// Parameters from the request URL.
fn query_params(req: &Request<Body>) -> Result<HashMap<String, String>> {
    let query = req.uri().query().unwrap_or_default();
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query)?;
    Ok(pairs.into_iter().collect())
}

fn is_urlencoded(req: &Request<Body>) -> bool {
    req.headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"))
}

/// Credentials from `u`/`p` parameters, falling back to HTTP Basic.
fn parse_credentials(req: &Request<Body>, params: &HashMap<String, String>) -> (String, String) {
    if let (Some(u), Some(p)) = (params.get("u"), params.get("p")) {
        if !u.is_empty() && !p.is_empty() {
            return (u.clone(), p.clone());
        }
    }
    if let Some(basic) = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
    {
        use base64::Engine;
        if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(basic) {
            let decoded = String::from_utf8_lossy(&decoded).into_owned();
            if let Some((user, pass)) = decoded.split_once(':') {
                return (user.to_owned(), pass.to_owned());
            }
        }
    }
    (String::new(), String::new())
}

/// Runs the hyper server until shutdown, then closes the cluster.
pub async fn serve(
    delegate: std::sync::Arc<HttpDelegate>,
    listen_addr: &str,
    idle_timeout: std::time::Duration,
) -> std::io::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use std::convert::Infallible;

    let addr = parse_listen_addr(listen_addr)?;
    let make_svc = make_service_fn(move |_conn| {
        let delegate = std::sync::Arc::clone(&delegate);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let delegate = std::sync::Arc::clone(&delegate);
                async move { Ok::<_, Infallible>(delegate.route(req).await) }
            }))
        }
    });

    info!(%addr, "http service start");
    hyper::Server::bind(&addr)
        .http1_keepalive(true)
        .http1_header_read_timeout(idle_timeout)
        .serve(make_svc)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| {
            error!(error = %e, "http server failed");
            std::io::Error::new(std::io::ErrorKind::Other, e)
        })
}

/// A bare `:7076` listens on all interfaces, as the original syntax allows.
fn parse_listen_addr(listen_addr: &str) -> std::io::Result<std::net::SocketAddr> {
    let full = if listen_addr.starts_with(':') {
        format!("0.0.0.0{listen_addr}")
    } else {
        listen_addr.to_owned()
    };
    full.parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        error!("unable to listen for the shutdown signal");
        // Keep serving rather than exiting half-initialized.
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
