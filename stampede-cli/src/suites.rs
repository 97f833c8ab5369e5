//! Built-in suites for the stock binary
//!
//! Suites are ordinarily registered by embedding the worker crate in your
//! own binary. The stock binary ships one demonstration suite so the local
//! and distributed paths can be exercised end to end without writing code.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use stampede_worker::{HookError, SuiteCatalog, TestContext, TestSuite};

pub fn built_in_catalog() -> SuiteCatalog {
    let mut catalog = SuiteCatalog::new();
    catalog.register(demo_suite());
    catalog
}

/// In-memory key/value churn. `key_count` bounds the keyspace and
/// `spin_micros` adds CPU work per operation, so one binary can emulate
/// anything from contention-heavy to compute-heavy load.
fn demo_suite() -> TestSuite {
    let store: Arc<Mutex<HashMap<u64, u64>>> = Arc::new(Mutex::new(HashMap::new()));
    let sequence = Arc::new(AtomicU64::new(0));

    let run_store = Arc::clone(&store);
    let verify_store = Arc::clone(&store);
    let teardown_store = Arc::clone(&store);

    TestSuite::builder("demo")
        .run(move |ctx| {
            let store = Arc::clone(&run_store);
            let sequence = Arc::clone(&sequence);
            async move {
                let spin = param_u64(&ctx, "spin_micros", 0)?;
                let key_count = param_u64(&ctx, "key_count", 1024)?.max(1);
                let probe = ctx.probe("operation");
                while ctx.keep_running() {
                    let timer = probe.start();
                    let key = sequence.fetch_add(1, Ordering::Relaxed) % key_count;
                    if spin > 0 {
                        spin_for(Duration::from_micros(spin));
                    }
                    *lock_unpoisoned(&store).entry(key).or_insert(0) += 1;
                    timer.stop();
                    tokio::task::yield_now().await;
                }
                Ok(())
            }
        })
        .local_verify(move |_ctx| {
            let store = Arc::clone(&verify_store);
            async move {
                if lock_unpoisoned(&store).is_empty() {
                    return Err(HookError::new("run recorded no operations"));
                }
                Ok(())
            }
        })
        .local_teardown(move |_ctx| {
            let store = Arc::clone(&teardown_store);
            async move {
                lock_unpoisoned(&store).clear();
                Ok(())
            }
        })
        .build()
}

fn param_u64(ctx: &TestContext, key: &str, default: u64) -> Result<u64, HookError> {
    match ctx.param(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| HookError::new(format!("parameter '{key}' is not a number: '{raw}'"))),
    }
}

fn spin_for(duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        std::hint::spin_loop();
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
