//! Retry, backoff and shutdown coordination for Stampede
//!
//! Delivery over the component tree retries with configurable backoff, and
//! node runtimes shut down through an escalating signal broadcast. The
//! policies here are plain serde types so they embed directly in the
//! configuration layer.

pub mod backoff;
pub mod retry;
pub mod shutdown;

pub use backoff::{BackoffCalculator, BackoffStrategy};
pub use retry::{RetryError, RetryExecutor, RetryPolicy, Retryable};
pub use shutdown::{ShutdownCoordinator, ShutdownError, ShutdownSignal};
