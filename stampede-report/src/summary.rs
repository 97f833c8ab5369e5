//! Run summary artifact

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stampede_core::{
    merge_interval_streams, Address, IntervalHistogram, LatencyHistogram, PhaseOutcome, RunStatus,
    TestPhase,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::ReportResult;
use crate::exceptions::StoredException;

/// Cluster-wide statistics for one probe over the whole RUN phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSummary {
    pub operations: u64,
    pub throughput_per_sec: f64,
    pub mean_micros: Option<f64>,
    pub p50_micros: Option<u64>,
    pub p99_micros: Option<u64>,
    pub max_micros: Option<u64>,
    /// The merged interval stream the statistics were computed from
    pub intervals: Vec<IntervalHistogram>,
}

impl ProbeSummary {
    /// Fold a merged interval stream into overall statistics. Throughput is
    /// measured against the active wall-clock time the intervals cover.
    pub fn from_intervals(intervals: Vec<IntervalHistogram>) -> Self {
        let mut total = LatencyHistogram::new();
        let mut active_ms = 0u64;
        for interval in &intervals {
            total.merge(&interval.histogram);
            active_ms += interval.duration_ms;
        }
        let throughput_per_sec = if active_ms == 0 {
            0.0
        } else {
            total.count() as f64 * 1000.0 / active_ms as f64
        };
        Self {
            operations: total.count(),
            throughput_per_sec,
            mean_micros: total.mean_micros(),
            p50_micros: total.percentile(50.0),
            p99_micros: total.percentile(99.0),
            max_micros: total.max_micros(),
            intervals,
        }
    }

    /// Merge per-worker streams and summarize them in one step
    pub fn from_worker_streams(streams: &[Vec<IntervalHistogram>]) -> Self {
        Self::from_intervals(merge_interval_streams(streams))
    }
}

/// Everything the coordinator knows about one finished run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub test_id: u32,
    pub suite: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Outcome of every executed phase on every participating worker
    pub phases: BTreeMap<TestPhase, BTreeMap<Address, PhaseOutcome>>,
    pub probes: BTreeMap<String, ProbeSummary>,
    pub exceptions: Vec<StoredException>,
    /// Exceptions past the cap, counted but not stored
    pub exceptions_overflow: u64,
}

impl RunSummary {
    /// Whether the run finished cleanly with every phase succeeding everywhere
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Done
            && self
                .phases
                .values()
                .flat_map(|workers| workers.values())
                .all(PhaseOutcome::is_success)
    }

    /// Write the summary as a pretty-printed JSON artifact, returning its path
    pub async fn write_to(&self, dir: impl AsRef<Path>) -> ReportResult<PathBuf> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("summary-{}.json", self.test_id));
        let body = serde_json::to_string_pretty(self)?;
        tokio::fs::write(&path, body).await?;
        Ok(path)
    }
}
