//! Latency histograms
//!
//! A compact latency distribution over power-of-two microsecond buckets.
//! Bucket `b` covers values whose highest set bit is `b - 1`, i.e. the range
//! `[2^(b-1), 2^b - 1]` microseconds, with bucket 0 holding zero-latency
//! samples. Percentiles are estimated from the cumulative bucket walk and
//! clamped to the observed maximum. The sparse map keeps empty and
//! low-traffic intervals cheap on the wire.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyHistogram {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    buckets: BTreeMap<u32, u64>,
    count: u64,
    total_micros: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    min_micros: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_micros: Option<u64>,
}

fn bucket_index(micros: u64) -> u32 {
    u64::BITS - micros.leading_zeros()
}

/// Inclusive upper bound of a bucket in microseconds.
fn bucket_upper_bound(bucket: u32) -> u64 {
    if bucket >= u64::BITS {
        u64::MAX
    } else {
        (1u64 << bucket) - 1
    }
}

impl LatencyHistogram {
    pub fn new() -> LatencyHistogram {
        LatencyHistogram::default()
    }

    pub fn record(&mut self, latency: Duration) {
        self.record_micros(latency.as_micros().min(u64::MAX as u128) as u64);
    }

    pub fn record_micros(&mut self, micros: u64) {
        *self.buckets.entry(bucket_index(micros)).or_insert(0) += 1;
        self.count += 1;
        self.total_micros = self.total_micros.saturating_add(micros);
        self.min_micros = Some(self.min_micros.map_or(micros, |m| m.min(micros)));
        self.max_micros = Some(self.max_micros.map_or(micros, |m| m.max(micros)));
    }

    /// Fold another histogram into this one.
    pub fn merge(&mut self, other: &LatencyHistogram) {
        for (bucket, count) in &other.buckets {
            *self.buckets.entry(*bucket).or_insert(0) += count;
        }
        self.count += other.count;
        self.total_micros = self.total_micros.saturating_add(other.total_micros);
        self.min_micros = match (self.min_micros, other.min_micros) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max_micros = match (self.max_micros, other.max_micros) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn total_micros(&self) -> u64 {
        self.total_micros
    }

    pub fn min_micros(&self) -> Option<u64> {
        self.min_micros
    }

    pub fn max_micros(&self) -> Option<u64> {
        self.max_micros
    }

    pub fn mean_micros(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.total_micros as f64 / self.count as f64)
        }
    }

    /// Estimated latency at the given percentile (0 < p <= 100).
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if self.count == 0 || p <= 0.0 || p > 100.0 {
            return None;
        }
        let rank = ((self.count as f64) * p / 100.0).ceil().max(1.0) as u64;
        let mut seen = 0u64;
        for (bucket, count) in &self.buckets {
            seen += count;
            if seen >= rank {
                let estimate = bucket_upper_bound(*bucket);
                return Some(match self.max_micros {
                    Some(max) => estimate.min(max),
                    None => estimate,
                });
            }
        }
        self.max_micros
    }
}

/// One flush interval of a probe's recordings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalHistogram {
    /// Zero-based position of the interval within the RUN phase.
    pub index: u64,
    /// Wall-clock length of the interval.
    pub duration_ms: u64,
    pub histogram: LatencyHistogram,
}

/// Merge per-worker interval streams index by index.
///
/// Streams of unequal length merge without error: a shorter stream simply
/// stops contributing once exhausted. The merged interval keeps the longest
/// contributing duration, since contributors ran in parallel. Empty input
/// streams produce an empty result.
pub fn merge_interval_streams(streams: &[Vec<IntervalHistogram>]) -> Vec<IntervalHistogram> {
    let longest = streams.iter().map(Vec::len).max().unwrap_or(0);
    let mut merged = Vec::with_capacity(longest);
    for position in 0..longest {
        let mut interval = IntervalHistogram {
            index: position as u64,
            duration_ms: 0,
            histogram: LatencyHistogram::new(),
        };
        for stream in streams {
            if let Some(contribution) = stream.get(position) {
                interval.duration_ms = interval.duration_ms.max(contribution.duration_ms);
                interval.histogram.merge(&contribution.histogram);
            }
        }
        merged.push(interval);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn histogram_of(samples: &[u64]) -> LatencyHistogram {
        let mut h = LatencyHistogram::new();
        for s in samples {
            h.record_micros(*s);
        }
        h
    }

    #[test]
    fn test_record_tracks_extremes_and_mean() {
        let h = histogram_of(&[100, 200, 300, 400]);
        assert_eq!(h.count(), 4);
        assert_eq!(h.min_micros(), Some(100));
        assert_eq!(h.max_micros(), Some(400));
        assert_eq!(h.mean_micros(), Some(250.0));
    }

    #[test]
    fn test_percentile_estimates_within_bucket_bounds() {
        let h = histogram_of(&[10, 20, 30, 1000, 5000]);
        let p50 = h.percentile(50.0).unwrap();
        assert!(p50 >= 20 && p50 < 1000, "p50 estimate {p50}");
        // The tail estimate is clamped to the observed maximum.
        assert_eq!(h.percentile(100.0), Some(5000));
        assert!(h.percentile(0.0).is_none());
    }

    #[test]
    fn test_empty_histogram_yields_no_statistics() {
        let h = LatencyHistogram::new();
        assert!(h.is_empty());
        assert_eq!(h.percentile(99.0), None);
        assert_eq!(h.mean_micros(), None);
        assert_eq!(h.min_micros(), None);
    }

    #[test]
    fn test_merge_accumulates_both_sides() {
        let mut a = histogram_of(&[10, 20]);
        let b = histogram_of(&[5, 40]);
        a.merge(&b);
        assert_eq!(a.count(), 4);
        assert_eq!(a.min_micros(), Some(5));
        assert_eq!(a.max_micros(), Some(40));
    }

    #[test]
    fn test_merge_with_empty_is_identity() {
        let mut a = histogram_of(&[10]);
        a.merge(&LatencyHistogram::new());
        assert_eq!(a, histogram_of(&[10]));

        let mut empty = LatencyHistogram::new();
        empty.merge(&LatencyHistogram::new());
        assert!(empty.is_empty());
    }

    #[test]
    fn test_stream_merge_tolerates_unequal_lengths() {
        let long = vec![
            IntervalHistogram {
                index: 0,
                duration_ms: 1000,
                histogram: histogram_of(&[10]),
            },
            IntervalHistogram {
                index: 1,
                duration_ms: 1000,
                histogram: histogram_of(&[20]),
            },
            IntervalHistogram {
                index: 2,
                duration_ms: 500,
                histogram: histogram_of(&[30]),
            },
        ];
        let short = vec![IntervalHistogram {
            index: 0,
            duration_ms: 900,
            histogram: histogram_of(&[40, 50]),
        }];

        let merged = merge_interval_streams(&[long, short]);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].histogram.count(), 3);
        assert_eq!(merged[0].duration_ms, 1000);
        assert_eq!(merged[1].histogram.count(), 1);
        assert_eq!(merged[2].histogram.count(), 1);
    }

    #[test]
    fn test_stream_merge_of_empty_streams_is_empty() {
        let merged = merge_interval_streams(&[Vec::new(), Vec::new()]);
        assert!(merged.is_empty());
        assert!(merge_interval_streams(&[]).is_empty());
    }

    #[test]
    fn test_serde_round_trip_is_lossless() {
        let h = histogram_of(&[1, 1000, 100000]);
        let json = serde_json::to_string(&h).unwrap();
        let decoded: LatencyHistogram = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, h);
    }
}
