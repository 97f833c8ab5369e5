//! Latency probes
//!
//! Hooks record latencies against named probes. During RUN the container
//! rotates the whole probe set on the flush interval; each rotation closes
//! one [`IntervalHistogram`] per probe and ships it upward, empty intervals
//! included so the per-worker streams stay position-aligned for the merge
//! on the coordinator.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use stampede_core::{IntervalHistogram, LatencyHistogram};

/// Probes sit on hook hot paths; a poisoning panic elsewhere in the task
/// must not take recording down with it.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Recording handle for one named probe.
#[derive(Clone)]
pub struct Probe {
    inner: Arc<ProbeInner>,
}

struct ProbeInner {
    name: String,
    histogram: Mutex<LatencyHistogram>,
}

impl Probe {
    fn new(name: &str) -> Probe {
        Probe {
            inner: Arc::new(ProbeInner {
                name: name.to_string(),
                histogram: Mutex::new(LatencyHistogram::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn record(&self, latency: Duration) {
        lock_unpoisoned(&self.inner.histogram).record(latency);
    }

    pub fn record_micros(&self, micros: u64) {
        lock_unpoisoned(&self.inner.histogram).record_micros(micros);
    }

    /// Start timing one operation; dropping the timer without `stop` discards
    /// the sample.
    pub fn start(&self) -> ProbeTimer {
        ProbeTimer {
            probe: self.clone(),
            started: Instant::now(),
        }
    }

    /// Close the current interval, leaving a fresh histogram behind.
    fn take(&self) -> LatencyHistogram {
        std::mem::take(&mut *lock_unpoisoned(&self.inner.histogram))
    }
}

/// Measures one operation against its probe.
pub struct ProbeTimer {
    probe: Probe,
    started: Instant,
}

impl ProbeTimer {
    pub fn stop(self) {
        self.probe.record(self.started.elapsed());
    }
}

/// All probes of one test instance, rotated together.
#[derive(Default)]
pub struct ProbeSet {
    probes: Mutex<BTreeMap<String, Probe>>,
    next_interval: AtomicU64,
}

impl ProbeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get-or-create the named probe.
    pub fn probe(&self, name: &str) -> Probe {
        lock_unpoisoned(&self.probes)
            .entry(name.to_string())
            .or_insert_with(|| Probe::new(name))
            .clone()
    }

    pub fn is_empty(&self) -> bool {
        lock_unpoisoned(&self.probes).is_empty()
    }

    /// Close the current interval of every probe. All probes share one
    /// interval index per rotation.
    pub fn rotate(&self, elapsed: Duration) -> Vec<(String, IntervalHistogram)> {
        let probes: Vec<Probe> = lock_unpoisoned(&self.probes).values().cloned().collect();
        if probes.is_empty() {
            return Vec::new();
        }
        let index = self.next_interval.fetch_add(1, Ordering::SeqCst);
        let duration_ms = elapsed.as_millis().min(u64::MAX as u128) as u64;
        probes
            .into_iter()
            .map(|probe| {
                let interval = IntervalHistogram {
                    index,
                    duration_ms,
                    histogram: probe.take(),
                };
                (probe.inner.name.clone(), interval)
            })
            .collect()
    }
}
