//! Live result aggregation during a run

use chrono::{DateTime, Utc};
use stampede_core::{Address, IntervalHistogram, PhaseOutcome, RunStatus, TestPhase};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::ReportResult;
use crate::exceptions::{ExceptionStore, StoredException};
use crate::summary::{ProbeSummary, RunSummary};

#[derive(Default)]
struct AggregatorInner {
    /// test id -> probe name -> worker -> interval stream in arrival order
    probes: HashMap<u32, BTreeMap<String, BTreeMap<Address, Vec<IntervalHistogram>>>>,
    /// test id -> phase -> worker -> outcome
    phases: HashMap<u32, BTreeMap<TestPhase, BTreeMap<Address, PhaseOutcome>>>,
}

/// Collects per-worker results as they stream in and folds them into a
/// [`RunSummary`] when a test finishes
pub struct ResultAggregator {
    artifacts_dir: PathBuf,
    exceptions: ExceptionStore,
    inner: Mutex<AggregatorInner>,
}

impl ResultAggregator {
    pub fn new(
        artifacts_dir: impl Into<PathBuf>,
        exception_cap: usize,
        exception_counter: Arc<AtomicU64>,
    ) -> Self {
        let artifacts_dir = artifacts_dir.into();
        let exceptions =
            ExceptionStore::new(artifacts_dir.join("exceptions"), exception_cap, exception_counter);
        Self {
            artifacts_dir,
            exceptions,
            inner: Mutex::new(AggregatorInner::default()),
        }
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    /// Append one flushed probe interval to its worker's stream
    pub async fn record_probe(
        &self,
        worker: Address,
        test_id: u32,
        probe: &str,
        interval: IntervalHistogram,
    ) {
        debug!(%worker, test_id, probe, interval = interval.index, "probe interval");
        let mut inner = self.inner.lock().await;
        inner
            .probes
            .entry(test_id)
            .or_default()
            .entry(probe.to_string())
            .or_default()
            .entry(worker)
            .or_default()
            .push(interval);
    }

    /// Record the outcome of one phase on one worker. A later report for the
    /// same phase and worker replaces the earlier one, which is how a
    /// process death overrides an in-flight phase.
    pub async fn record_phase_outcome(
        &self,
        worker: Address,
        test_id: u32,
        phase: TestPhase,
        outcome: PhaseOutcome,
    ) {
        let mut inner = self.inner.lock().await;
        inner
            .phases
            .entry(test_id)
            .or_default()
            .entry(phase)
            .or_default()
            .insert(worker, outcome);
    }

    /// Capture one exception report, subject to the store's cap
    pub async fn record_exception(
        &self,
        worker: Address,
        test_id: u32,
        phase: Option<TestPhase>,
        message: &str,
        trace: Option<&str>,
    ) -> ReportResult<Option<u64>> {
        self.exceptions
            .record(worker, test_id, phase, message, trace)
            .await
    }

    pub async fn stored_exceptions(&self) -> Vec<StoredException> {
        self.exceptions.stored().await
    }

    pub fn exceptions_overflow(&self) -> u64 {
        self.exceptions.overflow_count()
    }

    /// Drain everything recorded for a test into its summary and write the
    /// summary artifact
    pub async fn finalize(
        &self,
        test_id: u32,
        suite: &str,
        status: RunStatus,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> ReportResult<RunSummary> {
        let (probe_streams, phases) = {
            let mut inner = self.inner.lock().await;
            (
                inner.probes.remove(&test_id).unwrap_or_default(),
                inner.phases.remove(&test_id).unwrap_or_default(),
            )
        };

        let mut probes = BTreeMap::new();
        for (name, workers) in probe_streams {
            let streams: Vec<Vec<IntervalHistogram>> = workers.into_values().collect();
            probes.insert(name, ProbeSummary::from_worker_streams(&streams));
        }

        let exceptions: Vec<StoredException> = self
            .exceptions
            .stored()
            .await
            .into_iter()
            .filter(|e| e.test_id == test_id)
            .collect();

        let summary = RunSummary {
            test_id,
            suite: suite.to_string(),
            status,
            started_at,
            finished_at,
            phases,
            probes,
            exceptions,
            exceptions_overflow: self.exceptions.overflow_count(),
        };

        let path = summary.write_to(&self.artifacts_dir).await?;
        info!(test_id, status = %summary.status, artifact = %path.display(), "run summary written");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stampede_core::LatencyHistogram;

    fn aggregator(dir: &tempfile::TempDir) -> ResultAggregator {
        ResultAggregator::new(dir.path(), 100, Arc::new(AtomicU64::new(0)))
    }

    fn interval(index: u64, samples: &[u64]) -> IntervalHistogram {
        let mut histogram = LatencyHistogram::new();
        for s in samples {
            histogram.record_micros(*s);
        }
        IntervalHistogram {
            index,
            duration_ms: 1000,
            histogram,
        }
    }

    #[tokio::test]
    async fn test_probe_streams_merge_across_workers() {
        let dir = tempfile::tempdir().unwrap();
        let agg = aggregator(&dir);

        let w1 = Address::worker(1, 1);
        let w2 = Address::worker(1, 2);
        agg.record_probe(w1, 1, "put", interval(0, &[100, 100])).await;
        agg.record_probe(w2, 1, "put", interval(0, &[200])).await;
        agg.record_probe(w1, 1, "put", interval(1, &[100])).await;

        let summary = agg
            .finalize(1, "map_stress", RunStatus::Done, Utc::now(), Utc::now())
            .await
            .unwrap();

        let put = &summary.probes["put"];
        assert_eq!(put.operations, 4);
        assert_eq!(put.intervals.len(), 2);
        assert_eq!(put.intervals[0].histogram.count(), 3);
        assert_eq!(put.intervals[1].histogram.count(), 1);
    }

    #[tokio::test]
    async fn test_phase_outcomes_group_by_phase_and_worker() {
        let dir = tempfile::tempdir().unwrap();
        let agg = aggregator(&dir);

        let w1 = Address::worker(1, 1);
        let w2 = Address::worker(2, 1);
        agg.record_phase_outcome(w1, 1, TestPhase::Setup, PhaseOutcome::Success)
            .await;
        agg.record_phase_outcome(w2, 1, TestPhase::Setup, PhaseOutcome::Success)
            .await;
        agg.record_phase_outcome(
            w2,
            1,
            TestPhase::Run,
            PhaseOutcome::Failed {
                error: "boom".to_string(),
            },
        )
        .await;
        // A process death overrides the earlier report
        agg.record_phase_outcome(
            w2,
            1,
            TestPhase::Run,
            PhaseOutcome::ProcessExited {
                error: "exit code 9".to_string(),
            },
        )
        .await;

        let summary = agg
            .finalize(1, "map_stress", RunStatus::Aborted, Utc::now(), Utc::now())
            .await
            .unwrap();

        assert_eq!(summary.phases[&TestPhase::Setup].len(), 2);
        assert_eq!(
            summary.phases[&TestPhase::Run][&w2],
            PhaseOutcome::ProcessExited {
                error: "exit code 9".to_string()
            }
        );
        assert!(!summary.succeeded());
    }

    #[tokio::test]
    async fn test_finalize_writes_artifact_and_drains_state() {
        let dir = tempfile::tempdir().unwrap();
        let agg = aggregator(&dir);

        agg.record_probe(Address::worker(1, 1), 2, "get", interval(0, &[50]))
            .await;
        let summary = agg
            .finalize(2, "cache_bench", RunStatus::Done, Utc::now(), Utc::now())
            .await
            .unwrap();
        assert_eq!(summary.probes["get"].operations, 1);
        assert!(dir.path().join("summary-2.json").exists());

        // A second finalize sees nothing left for the test
        let empty = agg
            .finalize(2, "cache_bench", RunStatus::Done, Utc::now(), Utc::now())
            .await
            .unwrap();
        assert!(empty.probes.is_empty());
    }

    #[tokio::test]
    async fn test_exceptions_attach_to_their_test() {
        let dir = tempfile::tempdir().unwrap();
        let agg = aggregator(&dir);

        agg.record_exception(Address::worker(1, 1), 1, Some(TestPhase::Run), "a", None)
            .await
            .unwrap();
        agg.record_exception(Address::worker(1, 1), 2, None, "b", None)
            .await
            .unwrap();

        let summary = agg
            .finalize(1, "s", RunStatus::Done, Utc::now(), Utc::now())
            .await
            .unwrap();
        assert_eq!(summary.exceptions.len(), 1);
        assert_eq!(summary.exceptions[0].message, "a");
        assert_eq!(summary.exceptions_overflow, 0);
    }
}
