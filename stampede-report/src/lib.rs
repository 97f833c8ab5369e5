//! Result aggregation and run artifacts
//!
//! The coordinator feeds every probe interval, phase outcome and exception
//! report into one [`ResultAggregator`]. When a run finishes, the aggregator
//! folds the per-worker interval streams into cluster-wide distributions and
//! produces a [`RunSummary`] that is written out as a flat JSON artifact,
//! with exception detail in one plain-text file per captured exception.

pub mod aggregator;
pub mod error;
pub mod exceptions;
pub mod summary;

pub use aggregator::ResultAggregator;
pub use error::{ReportError, ReportResult};
pub use exceptions::{ExceptionStore, StoredException};
pub use summary::{ProbeSummary, RunSummary};
