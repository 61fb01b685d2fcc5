//! The query fan-out executor.
//!
//! Administrative statements (`SHOW`, `CREATE`, `DELETE`, `DROP`) cannot be
//! answered by a single backend: the proxy issues the statement to every
//! eligible backend in parallel and reduces the result sets with the
//! statement-specific merge rules from [`crate::response`].

use bytes::Bytes;
use futures::future::join_all;
use http::{header::CONTENT_TYPE, HeaderMap, HeaderValue, StatusCode};
use std::sync::Weak;
use thiserror::Error;
use tracing::{debug, warn};

use backend::{QueryRequest, QueryResult, SharedBackend};
use influxql::head_stmt_from_tokens;

use crate::{
    response::{
        concat_by_results, concat_by_values, reduce_by_series, reduce_by_values,
        response_from_results, response_from_series, Row, StatementResult,
    },
    ClusterShared,
};

/// Errors surfaced by the executor to the cluster query path.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The statement is not one the executor supports.
    #[error("statement not supported by the cluster executor")]
    NotSupported,

    /// The statement names a measurement outside the routing table.
    #[error("unknown measurement")]
    UnknownMeasurement,

    /// The statement has no extractable measurement.
    #[error("can't get measurement: {0}")]
    Measurement(#[from] influxql::Error),

    /// A backend probe failed at the transport level.
    #[error("backend query failed: {0}")]
    Backend(#[from] backend::ClientError),

    /// A backend returned a body the merge rules cannot parse.
    #[error("unable to merge backend responses: {0}")]
    Merge(#[from] serde_json::Error),

    /// The owning cluster was dropped mid-query.
    #[error("cluster is shutting down")]
    ClusterGone,
}

/// Executes cluster-wide statements against every eligible backend.
///
/// The executor and the cluster reference each other; the cluster holds the
/// executor and the executor keeps a weak back reference, fixed up by the
/// cluster constructor.
#[derive(Debug)]
pub struct InfluxQlExecutor {
    cluster: Weak<ClusterShared>,
}

/// Outcome of one fan-out round.
struct FanOut {
    results: Vec<QueryResult>,
    inactive: usize,
    total: usize,
}

impl FanOut {
    /// The informational tally reported when some backends were skipped.
    fn unavailable(&self) -> Option<String> {
        (self.inactive > 0).then(|| format!("{}/{} backends unavailable", self.inactive, self.total))
    }

    /// A backend-side 4xx/5xx short-circuits the merge and is mirrored
    /// verbatim to the client.
    fn error_response(&self) -> Option<&QueryResult> {
        self.results.iter().find(|r| r.status.as_u16() >= 400)
    }

    fn bodies(&self) -> Vec<Bytes> {
        self.results.iter().map(|r| r.body.clone()).collect()
    }
}

impl InfluxQlExecutor {
    pub(crate) fn new(cluster: Weak<ClusterShared>) -> Self {
        Self { cluster }
    }

    fn shared(&self) -> Result<std::sync::Arc<ClusterShared>, ExecutorError> {
        self.cluster.upgrade().ok_or(ExecutorError::ClusterGone)
    }

    /// Entry point: dispatch on the statement's head keyword.
    pub async fn query(
        &self,
        req: &QueryRequest,
        tokens: &[String],
    ) -> Result<QueryResult, ExecutorError> {
        match tokens.first().map(|t| t.to_lowercase()).as_deref() {
            Some("show") => self.query_show(req, tokens).await,
            Some("create") => self.query_create(req, tokens).await,
            Some("delete") | Some("drop") => self.query_delete_or_drop(req, tokens).await,
            _ => Err(ExecutorError::NotSupported),
        }
    }

    /// Issues the request to each backend in parallel and collects the
    /// buffered results.
    async fn fan_out(
        &self,
        req: &QueryRequest,
        backends: Vec<SharedBackend>,
        skip_write_only: bool,
        rewrite: impl Fn(&SharedBackend, &mut QueryRequest),
    ) -> Result<FanOut, ExecutorError> {
        let mut inactive = 0;
        let mut total = 0;
        let mut probes = Vec::new();
        for backend in backends {
            if skip_write_only && backend.is_write_only() {
                continue;
            }
            total += 1;
            if !backend.is_active() {
                debug!(backend = backend.name(), "skipping inactive backend");
                inactive += 1;
                continue;
            }
            let mut cloned = req.clone();
            cloned.accept_encoding = None;
            rewrite(&backend, &mut cloned);
            probes.push(async move { backend.query_sink(&cloned).await });
        }

        let mut results = Vec::new();
        for outcome in join_all(probes).await {
            results.push(outcome?);
        }
        Ok(FanOut {
            results,
            inactive,
            total,
        })
    }

    /// `SHOW …`: fan out to active, non-write-only backends and merge with
    /// the per-statement reducer.
    async fn query_show(
        &self,
        req: &QueryRequest,
        tokens: &[String],
    ) -> Result<QueryResult, ExecutorError> {
        let shared = self.shared()?;
        let backends = shared.all_backends();
        let mut req = req.clone();
        // Chunked transfers cannot be merged; always ask for whole bodies.
        req.form.remove("chunked");

        let fan_out = self.fan_out(&req, backends, true, |_, _| {}).await?;
        if let Some(error) = fan_out.error_response() {
            return Ok(error.clone());
        }

        let error = fan_out.unavailable();
        let bodies = fan_out.bodies();
        let head2 = head_stmt_from_tokens(tokens, 2);
        let head3 = head_stmt_from_tokens(tokens, 3);
        let body = match (head2.as_str(), head3.as_str()) {
            ("show measurements", _) | ("show series", _) | ("show databases", _) => {
                response_from_series(reduce_by_values(&bodies)?, error)
            }
            (_, "show field keys") | (_, "show tag keys") | (_, "show tag values") => {
                response_from_series(reduce_by_series(&bodies)?, error)
            }
            (_, "show retention policies") => {
                response_from_series(concat_by_values(&bodies)?, error)
            }
            ("show stats", _) => response_from_results(concat_by_results(&bodies)?, error),
            _ => {
                warn!(statement = req.statement(), "unhandled show statement");
                response_from_series(Vec::<Row>::new(), error)
            }
        };
        Ok(json_result(body))
    }

    /// `CREATE DATABASE`: fan out to every backend, rewriting the statement
    /// to name each backend's own target database.
    async fn query_create(
        &self,
        req: &QueryRequest,
        tokens: &[String],
    ) -> Result<QueryResult, ExecutorError> {
        if head_stmt_from_tokens(tokens, 2) != "create database" {
            return Err(ExecutorError::NotSupported);
        }
        let shared = self.shared()?;
        let backends = shared.all_backends();

        let fan_out = self
            .fan_out(req, backends, false, |backend, cloned| {
                cloned
                    .form
                    .insert("q".to_owned(), format!("create database {}", backend.target_db()));
                cloned.form.remove("db");
            })
            .await?;
        if let Some(error) = fan_out.error_response() {
            return Ok(error.clone());
        }
        Ok(json_result(response_from_results(
            vec![StatementResult::default()],
            fan_out.unavailable(),
        )))
    }

    /// `DELETE FROM` / `DROP SERIES` / `DROP MEASUREMENT`: routed like a
    /// write, then fanned out over that backend subset only.
    async fn query_delete_or_drop(
        &self,
        req: &QueryRequest,
        tokens: &[String],
    ) -> Result<QueryResult, ExecutorError> {
        let key = influxql::measurement_from_tokens(tokens)?;
        let shared = self.shared()?;
        let backends = shared
            .backends_for(&key)
            .ok_or(ExecutorError::UnknownMeasurement)?;

        let fan_out = self.fan_out(req, backends, false, |_, _| {}).await?;
        if let Some(error) = fan_out.error_response() {
            return Ok(error.clone());
        }
        Ok(json_result(response_from_results(
            vec![StatementResult::default()],
            fan_out.unavailable(),
        )))
    }
}

/// Wraps a merged body as a JSON 200 response.
fn json_result(body: Bytes) -> QueryResult {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    QueryResult {
        status: StatusCode::OK,
        headers,
        body,
    }
}
