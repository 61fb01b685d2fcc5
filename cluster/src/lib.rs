#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

//! # cluster
//!
//! The measurement→backends routing table with exact / longest-prefix /
//! default fallback, the per-request statistics counters, and the query path
//! that either routes a statement to one backend or fans it out through the
//! executor.

use bytes::Bytes;
use http::Method;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::{atomic::Ordering, Arc, Weak},
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use backend::{
    Backend, BackendApi, BackendError, NodeConfig, ProxyConfig, QueryRequest, QueryResult,
    SharedBackend,
};
use line_protocol::{line_to_nano, now_nanos, rapid_check, scan_key};

pub mod executor;
pub mod response;
pub mod stats;

pub use executor::{ExecutorError, InfluxQlExecutor};
pub use stats::{StatsRecorder, Statistics};

/// Name of the synthetic measurement carrying the proxy's own counters.
pub const STATISTICS_MEASUREMENT: &str = "influx.proxy.statistics";

/// Routing-table key selecting the fallback backend set.
pub const DEFAULT_KEY: &str = "_default_";

/// Errors creating or reloading the cluster.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("unable to create backend {name}: {source}")]
    Backend {
        name: String,
        source: BackendError,
    },

    #[error("keymap {key:?} references unknown backend {backend:?}")]
    UnknownBackend { key: String, backend: String },
}

/// Client-visible failures of the query path. The HTTP layer maps each
/// variant onto a status code and a short message body.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("illegal method")]
    IllegalMethod,

    #[error("empty query")]
    EmptyQuery,

    #[error("query forbidden")]
    Forbidden,

    #[error("database not found")]
    DatabaseNotFound,

    #[error("database forbidden")]
    DatabaseForbidden,

    #[error("can't get measurement")]
    NoMeasurement,

    #[error("unknown measurement")]
    UnknownMeasurement,

    #[error("backends not active")]
    BackendsUnavailable,

    #[error("query error: {0}")]
    Backend(#[from] backend::ClientError),

    #[error("query executor error: {0}")]
    Executor(#[from] ExecutorError),
}

/// The measurement→backends mapping, replaced wholesale on reload.
#[derive(Debug)]
pub(crate) struct RoutingTable {
    backends: BTreeMap<String, SharedBackend>,
    key_map: HashMap<String, Vec<SharedBackend>>,
    /// Non-default keys ordered by descending length so the longest prefix
    /// wins deterministically.
    prefix_keys: Vec<String>,
}

impl RoutingTable {
    fn build(
        backends: BTreeMap<String, SharedBackend>,
        keymaps: &HashMap<String, Vec<String>>,
    ) -> Result<Self, ClusterError> {
        let mut key_map = HashMap::new();
        for (key, names) in keymaps {
            let mut set = Vec::with_capacity(names.len());
            for name in names {
                let handle = backends
                    .get(name)
                    .ok_or_else(|| ClusterError::UnknownBackend {
                        key: key.clone(),
                        backend: name.clone(),
                    })?;
                set.push(Arc::clone(handle));
            }
            key_map.insert(key.clone(), set);
        }

        let mut prefix_keys: Vec<String> = key_map
            .keys()
            .filter(|k| *k != DEFAULT_KEY)
            .cloned()
            .collect();
        prefix_keys.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        Ok(Self {
            backends,
            key_map,
            prefix_keys,
        })
    }

    /// Exact match, then longest prefix, then the `_default_` entry.
    fn get_backends(&self, key: &str) -> Option<&Vec<SharedBackend>> {
        if let Some(set) = self.key_map.get(key) {
            return Some(set);
        }
        for prefix in &self.prefix_keys {
            if key.starts_with(prefix.as_str()) {
                return self.key_map.get(prefix);
            }
        }
        self.key_map.get(DEFAULT_KEY)
    }
}

/// State shared between the cluster facade, its executor and the statistics
/// reporter.
#[derive(Debug)]
pub(crate) struct ClusterShared {
    node: NodeConfig,
    data_dir: PathBuf,
    table: RwLock<Arc<RoutingTable>>,
    pub(crate) stats: StatsRecorder,
    executor: OnceCell<InfluxQlExecutor>,
    shutdown: CancellationToken,
    stat_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterShared {
    fn snapshot(&self) -> Arc<RoutingTable> {
        Arc::clone(&self.table.read())
    }

    /// Every configured backend handle, for executor fan-out.
    pub(crate) fn all_backends(&self) -> Vec<SharedBackend> {
        self.snapshot().backends.values().cloned().collect()
    }

    /// The backend set a measurement routes to.
    pub(crate) fn backends_for(&self, key: &str) -> Option<Vec<SharedBackend>> {
        self.snapshot().get_backends(key).cloned()
    }

    /// Dispatches one normalized line to every backend mapped to its
    /// measurement. Per-line failures are counted, never propagated.
    async fn write_row(&self, line: Bytes) {
        let stats = self.stats.current();
        stats.points_written.fetch_add(1, Ordering::Relaxed);

        let (key, rest_at) = match scan_key(&line) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(error = %e, "scan key error, dropping point");
                stats.points_written_fail.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if !rapid_check(&line[rest_at..]) {
            warn!(
                line = %String::from_utf8_lossy(&line),
                "invalid format, dropping point"
            );
            stats.points_written_fail.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let Some(backends) = self.backends_for(&key) else {
            warn!(measurement = %key, "unmapped measurement, dropping point");
            stats.points_written_fail.fetch_add(1, Ordering::Relaxed);
            return;
        };
        for backend in &backends {
            if let Err(e) = backend.write(line.clone()).await {
                error!(backend = backend.name(), measurement = %key, error = %e, "enqueue failed");
                stats.points_written_fail.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }

    /// Splits a request body into lines, normalizes timestamps and routes
    /// each line.
    async fn write(&self, payload: &[u8], precision: &str) {
        let stats = self.stats.current();
        stats.write_requests.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();

        for line in payload.split(|&b| b == b'\n') {
            if line.is_empty() {
                continue;
            }
            let line = line_to_nano(line, precision);
            if line.is_empty() {
                continue;
            }
            if self.node.write_tracing {
                debug!(line = %String::from_utf8_lossy(&line), "write row");
            }
            self.write_row(Bytes::from(line)).await;
        }

        self.stats
            .current()
            .write_request_duration
            .fetch_add(start.elapsed().as_nanos() as i64, Ordering::Relaxed);
    }
}

/// The cluster facade: one instance per proxy process.
#[derive(Debug, Clone)]
pub struct InfluxCluster {
    shared: Arc<ClusterShared>,
}

impl InfluxCluster {
    /// Builds real backends from the configuration and starts the
    /// statistics reporter.
    pub fn new(cfg: &ProxyConfig, data_dir: impl Into<PathBuf>) -> Result<Self, ClusterError> {
        let data_dir = data_dir.into();
        let backends = build_backends(&cfg.backends, &data_dir)?;
        Self::with_backends(backends, &cfg.keymaps, cfg.node.clone(), data_dir)
    }

    /// Assembles a cluster around prebuilt backend handles. Production code
    /// goes through [`new`](Self::new); tests substitute doubles here.
    pub fn with_backends(
        backends: BTreeMap<String, SharedBackend>,
        keymaps: &HashMap<String, Vec<String>>,
        node: NodeConfig,
        data_dir: impl Into<PathBuf>,
    ) -> Result<Self, ClusterError> {
        let table = RoutingTable::build(backends, keymaps)?;
        let stat_interval = Duration::from_millis(node.stat_interval.max(1));

        let shared = Arc::new(ClusterShared {
            node,
            data_dir: data_dir.into(),
            table: RwLock::new(Arc::new(table)),
            stats: StatsRecorder::default(),
            executor: OnceCell::new(),
            shutdown: CancellationToken::new(),
            stat_task: Mutex::new(None),
        });
        // Fix up the executor's weak back reference; see the executor docs.
        let _ = shared
            .executor
            .set(InfluxQlExecutor::new(Arc::downgrade(&shared)));

        let reporter = tokio::spawn(statistics_loop(
            Arc::downgrade(&shared),
            stat_interval,
            shared.shutdown.clone(),
        ));
        *shared.stat_task.lock() = Some(reporter);

        Ok(Self { shared })
    }

    /// Counters for the current interval.
    pub fn stats(&self) -> Arc<Statistics> {
        self.shared.stats.current()
    }

    /// Handles `/ping`: counts the request and reports the proxy version.
    pub fn ping(&self) -> &'static str {
        self.shared
            .stats
            .current()
            .ping_requests
            .fetch_add(1, Ordering::Relaxed);
        backend::VERSION
    }

    /// The backend set a measurement routes to, if any.
    pub fn get_backends(&self, key: &str) -> Option<Vec<SharedBackend>> {
        self.shared.backends_for(key)
    }

    /// Routes a whole `/write` body. Per-line failures never fail the
    /// request; they are visible in the statistics instead.
    pub async fn write(&self, payload: &[u8], precision: &str) {
        self.shared.write(payload, precision).await;
    }

    /// Handles `/query`: classify, enforce policy, then route by
    /// measurement or fan out through the executor.
    pub async fn query(&self, req: &QueryRequest) -> Result<QueryResult, QueryError> {
        let stats = self.shared.stats.current();
        stats.query_requests.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();

        let result = self.query_inner(req).await;

        self.shared
            .stats
            .current()
            .query_request_duration
            .fetch_add(start.elapsed().as_nanos() as i64, Ordering::Relaxed);
        if result.is_err() {
            self.shared
                .stats
                .current()
                .query_requests_fail
                .fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn query_inner(&self, req: &QueryRequest) -> Result<QueryResult, QueryError> {
        if req.method != Method::GET && req.method != Method::POST {
            return Err(QueryError::IllegalMethod);
        }
        let q = req.statement().trim().to_owned();
        if q.is_empty() {
            return Err(QueryError::EmptyQuery);
        }

        let checked = influxql::check_query(&q);
        if !checked.allowed {
            return Err(QueryError::Forbidden);
        }

        let (has_on_clause, show_databases, db_from_on) =
            influxql::database_from_on_clause(&checked.tokens);
        let db = if has_on_clause {
            db_from_on
        } else {
            req.form
                .get("db")
                .filter(|db| !db.is_empty())
                .cloned()
                .or_else(|| influxql::database_from_tokens(&checked.tokens))
        };
        if !show_databases {
            let Some(db) = db else {
                return Err(QueryError::DatabaseNotFound);
            };
            if !self.shared.node.db.is_empty() && db != self.shared.node.db {
                return Err(QueryError::DatabaseForbidden);
            }
        }

        if self.shared.node.query_tracing {
            debug!(query = %q, "query");
        }

        // Without a FROM clause, or for administrative statements, one
        // backend cannot answer; hand the statement to the executor.
        if !checked.has_from || influxql::is_cluster_statement(&q) {
            let executor = self
                .shared
                .executor
                .get()
                .expect("executor is initialized at construction");
            return Ok(executor.query(req, &checked.tokens).await?);
        }

        let key =
            influxql::measurement_from_tokens(&checked.tokens).map_err(|_| {
                warn!(query = %q, "can't get measurement");
                QueryError::NoMeasurement
            })?;
        let Some(backends) = self.shared.backends_for(&key) else {
            warn!(measurement = %key, query = %q, "unknown measurement");
            return Err(QueryError::UnknownMeasurement);
        };

        // Prefer backends that serve reads; fall back to write-only ones
        // rather than failing outright.
        let mut last_error = None;
        for write_only_pass in [false, true] {
            for backend in &backends {
                if !backend.is_active() || backend.is_write_only() != write_only_pass {
                    continue;
                }
                match backend.query(req).await {
                    Ok(result) => return Ok(result),
                    Err(e) => {
                        warn!(backend = backend.name(), error = %e, query = %q, "backend query failed");
                        last_error = Some(e);
                    }
                }
            }
        }
        match last_error {
            Some(e) => Err(QueryError::Backend(e)),
            None => {
                warn!(measurement = %key, query = %q, "no active backend");
                Err(QueryError::BackendsUnavailable)
            }
        }
    }

    /// Rebuilds the routing table from a fresh configuration, swaps it in
    /// atomically and closes the replaced backend handles.
    pub async fn reload(&self, cfg: &ProxyConfig) -> Result<(), ClusterError> {
        let backends = build_backends(&cfg.backends, &self.shared.data_dir)?;
        let table = RoutingTable::build(backends, &cfg.keymaps)?;

        let old = {
            let mut guard = self.shared.table.write();
            std::mem::replace(&mut *guard, Arc::new(table))
        };
        for backend in old.backends.values() {
            backend.close().await;
        }
        info!("routing table reloaded");
        Ok(())
    }

    /// Stops the statistics reporter and closes every backend.
    pub async fn close(&self) {
        self.shared.shutdown.cancel();
        let reporter = self.shared.stat_task.lock().take();
        if let Some(reporter) = reporter {
            let _ = reporter.await;
        }
        let table = self.shared.snapshot();
        for backend in table.backends.values() {
            backend.close().await;
        }
        info!("cluster closed");
    }
}

fn build_backends(
    configs: &HashMap<String, backend::BackendConfig>,
    data_dir: &std::path::Path,
) -> Result<BTreeMap<String, SharedBackend>, ClusterError> {
    let mut backends: BTreeMap<String, SharedBackend> = BTreeMap::new();
    for (name, cfg) in configs {
        let handle = Backend::new(name, cfg, data_dir).map_err(|source| ClusterError::Backend {
            name: name.clone(),
            source,
        })?;
        backends.insert(name.clone(), handle);
    }
    Ok(backends)
}

/// Periodically swaps the counters for a zeroed set and republishes the
/// snapshot as a line-protocol point through the regular write path.
async fn statistics_loop(
    shared: Weak<ClusterShared>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let host = hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_owned());

    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tick.tick() => {}
        }
        let Some(shared) = shared.upgrade() else { return };
        let snapshot = shared.stats.snapshot_and_reset();
        let line = stats::statistics_line(&snapshot, &host, &shared.node.listen_addr, now_nanos());
        shared.write(line.as_bytes(), "ns").await;
    }
}

#[cfg(test)]
mod mock;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn node() -> NodeConfig {
        NodeConfig {
            listen_addr: ":7076".to_owned(),
            stat_interval: 3_600_000,
            ..NodeConfig::default()
        }
    }

    fn cluster_of(
        backends: Vec<Arc<MockBackend>>,
        keymaps: &[(&str, &[&str])],
    ) -> InfluxCluster {
        let map: BTreeMap<String, SharedBackend> = backends
            .into_iter()
            .map(|b| (b.name().to_owned(), b as SharedBackend))
            .collect();
        let keymaps: HashMap<String, Vec<String>> = keymaps
            .iter()
            .map(|(k, names)| {
                (
                    (*k).to_owned(),
                    names.iter().map(|n| (*n).to_owned()).collect(),
                )
            })
            .collect();
        InfluxCluster::with_backends(map, &keymaps, node(), "data").unwrap()
    }

    fn query_req(q: &str) -> QueryRequest {
        let mut form = HashMap::new();
        form.insert("q".to_owned(), q.to_owned());
        form.insert("db".to_owned(), "test".to_owned());
        QueryRequest::new(Method::GET, form)
    }

    #[tokio::test]
    async fn routing_prefers_exact_then_prefix_then_default() {
        let a = MockBackend::healthy("a");
        let b = MockBackend::healthy("b");
        let c = MockBackend::healthy("c");
        let cluster = cluster_of(
            vec![Arc::clone(&a), Arc::clone(&b), Arc::clone(&c)],
            &[
                ("cpu.load", &["a"]),
                ("cpu", &["b"]),
                (DEFAULT_KEY, &["c"]),
            ],
        );

        let names = |key: &str| -> Vec<String> {
            cluster
                .get_backends(key)
                .unwrap()
                .iter()
                .map(|b| b.name().to_owned())
                .collect()
        };
        assert_eq!(names("cpu.load"), vec!["a"]);
        assert_eq!(names("cpu.idle"), vec!["b"]);
        assert_eq!(names("mem"), vec!["c"]);
        cluster.close().await;
    }

    #[tokio::test]
    async fn routing_without_default_misses() {
        let a = MockBackend::healthy("a");
        let cluster = cluster_of(vec![a], &[("cpu", &["a"])]);
        assert!(cluster.get_backends("mem").is_none());
        cluster.close().await;
    }

    #[tokio::test]
    async fn longest_prefix_wins_regardless_of_map_order() {
        let a = MockBackend::healthy("a");
        let b = MockBackend::healthy("b");
        let cluster = cluster_of(
            vec![Arc::clone(&a), Arc::clone(&b)],
            &[("cpu", &["a"]), ("cpu.lo", &["b"])],
        );
        let set = cluster.get_backends("cpu.load").unwrap();
        assert_eq!(set[0].name(), "b");
        cluster.close().await;
    }

    #[tokio::test]
    async fn write_dispatches_to_all_mapped_backends() {
        let a = MockBackend::healthy("a");
        let b = MockBackend::healthy("b");
        let cluster = cluster_of(
            vec![Arc::clone(&a), Arc::clone(&b)],
            &[("cpu", &["a", "b"])],
        );

        cluster
            .write(b"cpu,host=h1 value=1 1434055562000000000\n", "ns")
            .await;

        assert_eq!(a.written().len(), 1);
        assert_eq!(b.written().len(), 1);
        assert_eq!(
            a.written()[0],
            Bytes::from_static(b"cpu,host=h1 value=1 1434055562000000000")
        );
        assert_eq!(cluster.stats().points_written.load(Ordering::Relaxed), 1);
        assert_eq!(
            cluster.stats().points_written_fail.load(Ordering::Relaxed),
            0
        );
        cluster.close().await;
    }

    #[tokio::test]
    async fn write_normalizes_precision() {
        let a = MockBackend::healthy("a");
        let cluster = cluster_of(vec![Arc::clone(&a)], &[("cpu", &["a"])]);
        cluster.write(b"cpu value=1 1434055562", "s").await;
        assert_eq!(
            a.written()[0],
            Bytes::from_static(b"cpu value=1 1434055562000000000")
        );
        cluster.close().await;
    }

    #[tokio::test]
    async fn malformed_and_unmapped_lines_are_counted_not_fatal() {
        let a = MockBackend::healthy("a");
        let cluster = cluster_of(vec![Arc::clone(&a)], &[("cpu", &["a"])]);

        let body = b"cpu value=1 1\nbroken\nmem value=2 2\ncpu value=3 3\n";
        cluster.write(body, "ns").await;

        // "broken" has no field section, "mem" has no mapping; both counted.
        assert_eq!(a.written().len(), 2);
        let stats = cluster.stats();
        assert_eq!(stats.points_written.load(Ordering::Relaxed), 4);
        assert_eq!(stats.points_written_fail.load(Ordering::Relaxed), 2);
        cluster.close().await;
    }

    #[tokio::test]
    async fn enqueue_failure_aborts_remaining_backends_for_that_row() {
        let a = MockBackend::healthy("a");
        a.fail_writes();
        let b = MockBackend::healthy("b");
        let cluster = cluster_of(
            vec![Arc::clone(&a), Arc::clone(&b)],
            &[("cpu", &["a", "b"])],
        );

        cluster.write(b"cpu value=1 1\n", "ns").await;
        assert!(b.written().is_empty());
        assert_eq!(
            cluster.stats().points_written_fail.load(Ordering::Relaxed),
            1
        );
        cluster.close().await;
    }

    #[tokio::test]
    async fn query_routes_to_first_active_read_backend() {
        let a = MockBackend::healthy("a");
        a.set_active(false);
        let b = MockBackend::healthy("b");
        b.respond_with(json!({"results": [{"statement_id": 0}]}).to_string());
        let cluster = cluster_of(
            vec![Arc::clone(&a), Arc::clone(&b)],
            &[("cpu", &["a", "b"])],
        );

        let result = cluster
            .query(&query_req("select * from cpu where time > now() - 1h"))
            .await
            .unwrap();
        assert_eq!(result.status.as_u16(), 200);
        assert_eq!(a.queries().len(), 0);
        assert_eq!(b.queries().len(), 1);
        cluster.close().await;
    }

    #[tokio::test]
    async fn query_prefers_readable_over_write_only_backends() {
        let wo = MockBackend::healthy("wo");
        wo.set_write_only(true);
        let rd = MockBackend::healthy("rd");
        let cluster = cluster_of(
            vec![Arc::clone(&wo), Arc::clone(&rd)],
            &[("cpu", &["wo", "rd"])],
        );

        cluster
            .query(&query_req("select * from cpu where time > now() - 1h"))
            .await
            .unwrap();
        assert_eq!(wo.queries().len(), 0);
        assert_eq!(rd.queries().len(), 1);

        // With the readable backend down, the write-only one is the fallback.
        rd.set_active(false);
        cluster
            .query(&query_req("select * from cpu where time > now() - 1h"))
            .await
            .unwrap();
        assert_eq!(wo.queries().len(), 1);
        cluster.close().await;
    }

    #[tokio::test]
    async fn query_validation_failures() {
        let a = MockBackend::healthy("a");
        let cluster = cluster_of(vec![a], &[("cpu", &["a"])]);

        let mut req = query_req("select * from cpu where time > 1");
        req.method = Method::PUT;
        assert_matches!(
            cluster.query(&req).await,
            Err(QueryError::IllegalMethod)
        );

        assert_matches!(
            cluster.query(&query_req("   ")).await,
            Err(QueryError::EmptyQuery)
        );
        assert_matches!(
            cluster.query(&query_req("grant all to bob")).await,
            Err(QueryError::Forbidden)
        );
        assert_matches!(
            cluster
                .query(&query_req("select * from mem where time > 1"))
                .await,
            Err(QueryError::UnknownMeasurement)
        );

        let mut req = query_req("select * from cpu where time > 1");
        req.form.remove("db");
        assert_matches!(
            cluster.query(&req).await,
            Err(QueryError::DatabaseNotFound)
        );

        assert_eq!(
            cluster
                .stats()
                .query_requests_fail
                .load(Ordering::Relaxed),
            5
        );
        cluster.close().await;
    }

    #[tokio::test]
    async fn query_enforces_node_database() {
        let a = MockBackend::healthy("a");
        let mut node = node();
        node.db = "only".to_owned();
        let map: BTreeMap<String, SharedBackend> =
            [("a".to_owned(), Arc::clone(&a) as SharedBackend)]
                .into_iter()
                .collect();
        let keymaps: HashMap<String, Vec<String>> =
            [("cpu".to_owned(), vec!["a".to_owned()])].into_iter().collect();
        let cluster = InfluxCluster::with_backends(map, &keymaps, node, "data").unwrap();

        assert_matches!(
            cluster
                .query(&query_req("select * from cpu where time > 1"))
                .await,
            Err(QueryError::DatabaseForbidden)
        );

        let mut req = query_req("select * from cpu where time > 1");
        req.form.insert("db".to_owned(), "only".to_owned());
        assert!(cluster.query(&req).await.is_ok());
        cluster.close().await;
    }

    #[tokio::test]
    async fn show_statements_fan_out_and_merge() {
        let a = MockBackend::healthy("a");
        a.respond_with(
            json!({"results": [{"statement_id": 0, "series": [
                {"name": "measurements", "columns": ["name"], "values": [["cpu"], ["mem"]]}
            ]}]})
            .to_string(),
        );
        let b = MockBackend::healthy("b");
        b.respond_with(
            json!({"results": [{"statement_id": 0, "series": [
                {"name": "measurements", "columns": ["name"], "values": [["cpu"], ["disk"]]}
            ]}]})
            .to_string(),
        );
        let wo = MockBackend::healthy("wo");
        wo.set_write_only(true);
        let cluster = cluster_of(
            vec![Arc::clone(&a), Arc::clone(&b), Arc::clone(&wo)],
            &[("cpu", &["a", "b"]), (DEFAULT_KEY, &["a"])],
        );

        let result = cluster.query(&query_req("show measurements")).await.unwrap();
        let response: response::Response = serde_json::from_slice(&result.body).unwrap();
        let values = &response.results[0].series[0].values;
        let mut names: Vec<&str> = values.iter().map(|v| v[0].as_str().unwrap()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["cpu", "disk", "mem"]);
        assert_eq!(response.error, None);
        // Write-only backends are excluded from SHOW fan-out.
        assert_eq!(wo.queries().len(), 0);
        cluster.close().await;
    }

    #[tokio::test]
    async fn show_reports_inactive_tally() {
        let a = MockBackend::healthy("a");
        a.respond_with(
            json!({"results": [{"statement_id": 0, "series": [
                {"name": "measurements", "columns": ["name"], "values": [["cpu"]]}
            ]}]})
            .to_string(),
        );
        let b = MockBackend::healthy("b");
        b.set_active(false);
        let cluster = cluster_of(
            vec![Arc::clone(&a), Arc::clone(&b)],
            &[(DEFAULT_KEY, &["a", "b"])],
        );

        let result = cluster.query(&query_req("show measurements")).await.unwrap();
        assert_eq!(result.status.as_u16(), 200);
        let response: response::Response = serde_json::from_slice(&result.body).unwrap();
        assert_eq!(
            response.error.as_deref(),
            Some("1/2 backends unavailable")
        );
        cluster.close().await;
    }

    #[tokio::test]
    async fn backend_4xx_short_circuits_show_fan_out() {
        let good = MockBackend::healthy("good");
        good.respond_with(json!({"results": [{"statement_id": 0}]}).to_string());
        let bad = MockBackend::healthy("bad");
        bad.respond_with_status(401, json!({"error": "authorization failed"}).to_string());
        let cluster = cluster_of(
            vec![Arc::clone(&good), Arc::clone(&bad)],
            &[(DEFAULT_KEY, &["good", "bad"])],
        );

        let result = cluster.query(&query_req("show measurements")).await.unwrap();
        assert_eq!(result.status.as_u16(), 401);
        assert_eq!(
            result.error_message().as_deref(),
            Some("authorization failed")
        );
        cluster.close().await;
    }

    #[tokio::test]
    async fn create_database_rewrites_per_backend_target() {
        let x = MockBackend::healthy_with_db("x_backend", "x");
        let y = MockBackend::healthy_with_db("y_backend", "y");
        let cluster = cluster_of(
            vec![Arc::clone(&x), Arc::clone(&y)],
            &[(DEFAULT_KEY, &["x_backend", "y_backend"])],
        );

        let result = cluster.query(&query_req("create database foo")).await.unwrap();
        assert_eq!(result.status.as_u16(), 200);

        let seen_x = x.queries();
        assert_eq!(seen_x.len(), 1);
        assert_eq!(
            seen_x[0].form.get("q").map(String::as_str),
            Some("create database x")
        );
        assert!(!seen_x[0].form.contains_key("db"));
        let seen_y = y.queries();
        assert_eq!(
            seen_y[0].form.get("q").map(String::as_str),
            Some("create database y")
        );
        cluster.close().await;
    }

    #[tokio::test]
    async fn drop_measurement_routes_by_key() {
        let a = MockBackend::healthy("a");
        let other = MockBackend::healthy("other");
        let cluster = cluster_of(
            vec![Arc::clone(&a), Arc::clone(&other)],
            &[("cpu", &["a"]), (DEFAULT_KEY, &["other"])],
        );

        let result = cluster.query(&query_req("drop measurement cpu")).await.unwrap();
        assert_eq!(result.status.as_u16(), 200);
        assert_eq!(a.queries().len(), 1);
        assert_eq!(other.queries().len(), 0);
        cluster.close().await;
    }

    #[tokio::test]
    async fn statistics_point_routes_through_write_path() {
        let a = MockBackend::healthy("a");
        let mut node = node();
        node.stat_interval = 20;
        let map: BTreeMap<String, SharedBackend> =
            [("a".to_owned(), Arc::clone(&a) as SharedBackend)]
                .into_iter()
                .collect();
        let keymaps: HashMap<String, Vec<String>> =
            [(DEFAULT_KEY.to_owned(), vec!["a".to_owned()])]
                .into_iter()
                .collect();
        let cluster = InfluxCluster::with_backends(map, &keymaps, node, "data").unwrap();

        let mut seen = false;
        for _ in 0..100 {
            if a.written()
                .iter()
                .any(|line| line.starts_with(STATISTICS_MEASUREMENT.as_bytes()))
            {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen, "statistics point never arrived");
        cluster.close().await;
    }

    #[tokio::test]
    async fn reload_swaps_table_and_closes_old_handles() {
        let a = MockBackend::healthy("a");
        let cluster = cluster_of(vec![Arc::clone(&a)], &[("cpu", &["a"])]);
        assert!(cluster.get_backends("cpu").is_some());

        // A reload pointing at a nonexistent backend leaves the table alone.
        let bad_keymaps: HashMap<String, Vec<String>> =
            [("cpu".to_owned(), vec!["ghost".to_owned()])]
                .into_iter()
                .collect();
        let map: BTreeMap<String, SharedBackend> = BTreeMap::new();
        assert_matches!(
            RoutingTable::build(map, &bad_keymaps),
            Err(ClusterError::UnknownBackend { .. })
        );
        assert!(cluster.get_backends("cpu").is_some());
        cluster.close().await;
        assert!(a.closed());
    }
}
