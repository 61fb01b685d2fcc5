//! Process-wide request statistics.
//!
//! Counters are updated with atomic adds on the hot paths and flushed by
//! swapping the whole struct for a zeroed one, so the reporter never sees a
//! torn snapshot. The snapshot is republished as a synthetic line-protocol
//! point through the regular cluster write path.

use arc_swap::ArcSwap;
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use crate::STATISTICS_MEASUREMENT;

/// One flush interval's worth of counters.
#[derive(Debug, Default)]
pub struct Statistics {
    pub query_requests: AtomicI64,
    pub query_requests_fail: AtomicI64,
    pub write_requests: AtomicI64,
    pub write_requests_fail: AtomicI64,
    pub ping_requests: AtomicI64,
    pub ping_requests_fail: AtomicI64,
    pub points_written: AtomicI64,
    pub points_written_fail: AtomicI64,
    pub write_request_duration: AtomicI64,
    pub query_request_duration: AtomicI64,
}

/// Holds the counters currently being written to.
#[derive(Debug)]
pub struct StatsRecorder {
    current: ArcSwap<Statistics>,
}

impl Default for StatsRecorder {
    fn default() -> Self {
        Self {
            current: ArcSwap::from_pointee(Statistics::default()),
        }
    }
}

impl StatsRecorder {
    /// The live counter set. Callers use atomic adds on the fields.
    pub fn current(&self) -> Arc<Statistics> {
        self.current.load_full()
    }

    /// Replaces the live counters with a zeroed set and returns the
    /// previous interval for reporting.
    pub fn snapshot_and_reset(&self) -> Arc<Statistics> {
        self.current.swap(Arc::new(Statistics::default()))
    }
}

/// Renders a snapshot as the proxy's statistics measurement, tagged with
/// this host and the proxy listen address.
pub fn statistics_line(stats: &Statistics, host: &str, addr: &str, timestamp_nanos: i64) -> String {
    let fields = [
        ("statQueryRequest", stats.query_requests.load(Ordering::Relaxed)),
        (
            "statQueryRequestFail",
            stats.query_requests_fail.load(Ordering::Relaxed),
        ),
        ("statWriteRequest", stats.write_requests.load(Ordering::Relaxed)),
        (
            "statWriteRequestFail",
            stats.write_requests_fail.load(Ordering::Relaxed),
        ),
        ("statPingRequest", stats.ping_requests.load(Ordering::Relaxed)),
        (
            "statPingRequestFail",
            stats.ping_requests_fail.load(Ordering::Relaxed),
        ),
        ("statPointsWritten", stats.points_written.load(Ordering::Relaxed)),
        (
            "statPointsWrittenFail",
            stats.points_written_fail.load(Ordering::Relaxed),
        ),
        (
            "statQueryRequestDuration",
            stats.query_request_duration.load(Ordering::Relaxed),
        ),
        (
            "statWriteRequestDuration",
            stats.write_request_duration.load(Ordering::Relaxed),
        ),
    ];
    let fields = fields
        .iter()
        .map(|(name, value)| format!("{name}={value}i"))
        .collect::<Vec<_>>()
        .join(",");
    format!("{STATISTICS_MEASUREMENT},host={host},addr={addr} {fields} {timestamp_nanos}")
}
