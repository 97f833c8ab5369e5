//! Exception capture with a per-run cap
//!
//! Every reported exception gets a run-wide sequential id from an injected
//! counter and its own plain-text file under `exceptions/`. Past the cap,
//! exceptions are only counted; a run that throws in a tight loop would
//! otherwise bury the artifacts directory.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use stampede_core::{Address, TestPhase};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::ReportResult;

/// One captured exception, as referenced from the run summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredException {
    pub id: u64,
    pub address: Address,
    pub test_id: u32,
    pub message: String,
    /// Path of the detail file under the exceptions directory
    pub file: PathBuf,
}

/// Capped store of exception reports
pub struct ExceptionStore {
    dir: PathBuf,
    cap: usize,
    next_id: Arc<AtomicU64>,
    stored: Mutex<Vec<StoredException>>,
    overflow: AtomicU64,
}

impl ExceptionStore {
    /// `next_id` is shared with the owner so ids stay unique across however
    /// many stores a process ends up with.
    pub fn new(dir: PathBuf, cap: usize, next_id: Arc<AtomicU64>) -> Self {
        Self {
            dir,
            cap,
            next_id,
            stored: Mutex::new(Vec::new()),
            overflow: AtomicU64::new(0),
        }
    }

    /// Persist one exception report. Returns the assigned id, or `None` once
    /// the cap is reached and the report was only counted.
    pub async fn record(
        &self,
        address: Address,
        test_id: u32,
        phase: Option<TestPhase>,
        message: &str,
        trace: Option<&str>,
    ) -> ReportResult<Option<u64>> {
        let mut stored = self.stored.lock().await;
        if stored.len() >= self.cap {
            let overflow = self.overflow.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(%address, test_id, overflow, "exception cap reached, counting only");
            return Ok(None);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let file = self.dir.join(format!("{id}-{address}.log"));

        let mut body = format!(
            "id: {id}\naddress: {address}\ntest: {test_id}\nphase: {}\nreported_at: {}\n\n{message}\n",
            phase.map_or("-".to_string(), |p| p.to_string()),
            Utc::now().to_rfc3339(),
        );
        if let Some(trace) = trace {
            body.push('\n');
            body.push_str(trace);
            body.push('\n');
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&file, body).await?;

        stored.push(StoredException {
            id,
            address,
            test_id,
            message: message.to_string(),
            file,
        });
        Ok(Some(id))
    }

    /// Every stored exception so far, in capture order
    pub async fn stored(&self) -> Vec<StoredException> {
        self.stored.lock().await.clone()
    }

    pub async fn stored_count(&self) -> usize {
        self.stored.lock().await.len()
    }

    /// How many reports arrived after the cap was reached
    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir, cap: usize) -> ExceptionStore {
        ExceptionStore::new(
            dir.path().join("exceptions"),
            cap,
            Arc::new(AtomicU64::new(0)),
        )
    }

    #[tokio::test]
    async fn test_ids_are_sequential_from_the_injected_counter() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, 10);

        for expected in 1..=3u64 {
            let id = store
                .record(Address::worker(1, 1), 1, None, "boom", None)
                .await
                .unwrap();
            assert_eq!(id, Some(expected));
        }
    }

    #[tokio::test]
    async fn test_cap_counts_overflow_without_storing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, 50);

        for n in 0..60 {
            let id = store
                .record(
                    Address::worker(1, 1),
                    1,
                    Some(TestPhase::Run),
                    &format!("error {n}"),
                    None,
                )
                .await
                .unwrap();
            if n < 50 {
                assert!(id.is_some());
            } else {
                assert!(id.is_none());
            }
        }

        assert_eq!(store.stored_count().await, 50);
        assert_eq!(store.overflow_count(), 10);
    }

    #[tokio::test]
    async fn test_detail_file_contains_message_and_trace() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, 10);

        store
            .record(
                Address::worker(2, 3),
                7,
                Some(TestPhase::Run),
                "payload mismatch",
                Some("at stress::verify\nat stress::run"),
            )
            .await
            .unwrap();

        let entries = store.stored().await;
        assert_eq!(entries.len(), 1);
        assert!(entries[0].file.ends_with("1-C_A2_W3.log"));

        let body = std::fs::read_to_string(&entries[0].file).unwrap();
        assert!(body.contains("address: C_A2_W3"));
        assert!(body.contains("phase: run"));
        assert!(body.contains("payload mismatch"));
        assert!(body.contains("at stress::verify"));
    }
}
