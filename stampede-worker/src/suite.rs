//! Test suite registration
//!
//! A suite binds hook functions to lifecycle phases at construction time
//! through [`TestSuiteBuilder`]; phases without a bound hook complete
//! immediately with success. Hooks are plain async closures over a
//! [`TestContext`], invoked once per task in the phase's task group, so a
//! RUN hook drives its own loop against [`TestContext::keep_running`].

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use stampede_core::TestPhase;
use thiserror::Error;

use crate::context::TestContext;

/// A hook failure, reported upward verbatim.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct HookError(String);

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for HookError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HookError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

pub type HookResult = Result<(), HookError>;

type HookFuture = Pin<Box<dyn Future<Output = HookResult> + Send>>;

/// A registered phase hook.
pub type HookFn = Arc<dyn Fn(TestContext) -> HookFuture + Send + Sync>;

/// A named set of phase hooks.
pub struct TestSuite {
    name: String,
    hooks: HashMap<TestPhase, HookFn>,
}

impl TestSuite {
    pub fn builder(name: impl Into<String>) -> TestSuiteBuilder {
        TestSuiteBuilder {
            name: name.into(),
            hooks: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hook(&self, phase: TestPhase) -> Option<HookFn> {
        self.hooks.get(&phase).cloned()
    }

    pub fn has_hook(&self, phase: TestPhase) -> bool {
        self.hooks.contains_key(&phase)
    }
}

impl fmt::Debug for TestSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bound: Vec<&str> = TestPhase::all()
            .iter()
            .filter(|phase| self.hooks.contains_key(*phase))
            .map(TestPhase::as_str)
            .collect();
        bound.sort_unstable();
        f.debug_struct("TestSuite")
            .field("name", &self.name)
            .field("hooks", &bound)
            .finish()
    }
}

/// Builds a [`TestSuite`] by binding hooks phase by phase.
pub struct TestSuiteBuilder {
    name: String,
    hooks: HashMap<TestPhase, HookFn>,
}

impl TestSuiteBuilder {
    /// Bind a hook to an arbitrary phase. The convenience methods below
    /// cover the canonical chain.
    pub fn hook<F, Fut>(mut self, phase: TestPhase, hook: F) -> Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.hooks
            .insert(phase, Arc::new(move |ctx| Box::pin(hook(ctx))));
        self
    }

    pub fn setup<F, Fut>(self, hook: F) -> Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.hook(TestPhase::Setup, hook)
    }

    pub fn local_warmup<F, Fut>(self, hook: F) -> Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.hook(TestPhase::LocalWarmup, hook)
    }

    pub fn global_warmup<F, Fut>(self, hook: F) -> Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.hook(TestPhase::GlobalWarmup, hook)
    }

    pub fn run<F, Fut>(self, hook: F) -> Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.hook(TestPhase::Run, hook)
    }

    pub fn local_verify<F, Fut>(self, hook: F) -> Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.hook(TestPhase::LocalVerify, hook)
    }

    pub fn global_verify<F, Fut>(self, hook: F) -> Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.hook(TestPhase::GlobalVerify, hook)
    }

    pub fn local_teardown<F, Fut>(self, hook: F) -> Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.hook(TestPhase::LocalTeardown, hook)
    }

    pub fn global_teardown<F, Fut>(self, hook: F) -> Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.hook(TestPhase::GlobalTeardown, hook)
    }

    pub fn build(self) -> TestSuite {
        TestSuite {
            name: self.name,
            hooks: self.hooks,
        }
    }
}

/// Suites available to a worker, looked up by name at test creation.
#[derive(Debug, Default, Clone)]
pub struct SuiteCatalog {
    suites: HashMap<String, Arc<TestSuite>>,
}

impl SuiteCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a suite under its own name, replacing any previous suite
    /// with that name.
    pub fn register(&mut self, suite: TestSuite) {
        self.suites.insert(suite.name.clone(), Arc::new(suite));
    }

    pub fn get(&self, name: &str) -> Option<Arc<TestSuite>> {
        self.suites.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.suites.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.suites.is_empty()
    }
}
