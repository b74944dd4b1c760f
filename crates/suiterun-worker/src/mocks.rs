//! Mock functions and the cleanup applied before every test.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use suiterun_core::MockPolicy;

/// Cleanup operations shared by every mock.
///
/// Each level includes the previous one: `restore` resets, `reset` clears.
pub trait MockHandle: Send + Sync {
    fn name(&self) -> &str;

    /// Forget recorded calls and results.
    fn clear(&self);

    /// Clear and drop any mocked implementation.
    fn reset(&self);

    /// Reset and reinstate the original implementation.
    fn restore(&self);
}

type Implementation<A, R> = Arc<dyn Fn(&A) -> R + Send + Sync>;

struct MockState<A, R> {
    calls: Vec<A>,
    results: Vec<R>,
    implementation: Option<Implementation<A, R>>,
    original: Option<Implementation<A, R>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A recording function double taking `A` and returning `R`.
pub struct MockFn<A, R> {
    name: String,
    state: Arc<Mutex<MockState<A, R>>>,
}

impl<A, R> Clone for MockFn<A, R> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<A, R> fmt::Debug for MockFn<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockFn").field("name", &self.name).finish()
    }
}

impl<A, R> MockFn<A, R>
where
    A: Clone + Send + 'static,
    R: Clone + Default + Send + 'static,
{
    fn with_original(name: impl Into<String>, original: Option<Implementation<A, R>>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(MockState {
                calls: Vec::new(),
                results: Vec::new(),
                implementation: original.clone(),
                original,
            })),
        }
    }

    /// Invoke the mock, recording the call and its result.
    pub fn call(&self, args: A) -> R {
        let implementation = lock(&self.state).implementation.clone();
        let result = implementation.map(|f| f(&args)).unwrap_or_default();
        let mut state = lock(&self.state);
        state.calls.push(args);
        state.results.push(result.clone());
        result
    }

    /// Replace the current implementation.
    pub fn mock_implementation(&self, f: impl Fn(&A) -> R + Send + Sync + 'static) {
        lock(&self.state).implementation = Some(Arc::new(f));
    }

    pub fn calls(&self) -> Vec<A> {
        lock(&self.state).calls.clone()
    }

    pub fn results(&self) -> Vec<R> {
        lock(&self.state).results.clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.state).calls.len()
    }
}

impl<A, R> MockHandle for MockFn<A, R>
where
    A: Send + 'static,
    R: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn clear(&self) {
        let mut state = lock(&self.state);
        state.calls.clear();
        state.results.clear();
    }

    fn reset(&self) {
        self.clear();
        lock(&self.state).implementation = None;
    }

    fn restore(&self) {
        self.reset();
        let mut state = lock(&self.state);
        state.implementation = state.original.clone();
    }
}

/// Every mock created in one execution context.
#[derive(Clone, Default)]
pub struct MockRegistry {
    mocks: Arc<Mutex<Vec<Arc<dyn MockHandle>>>>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle created elsewhere.
    pub fn register(&self, mock: Arc<dyn MockHandle>) {
        trace!(mock = mock.name(), "Registering mock");
        lock(&self.mocks).push(mock);
    }

    /// Create a mock without implementation; it returns `R::default()`.
    pub fn fn_mock<A, R>(&self, name: impl Into<String>) -> MockFn<A, R>
    where
        A: Clone + Send + 'static,
        R: Clone + Default + Send + 'static,
    {
        let mock = MockFn::with_original(name, None);
        self.register(Arc::new(mock.clone()));
        mock
    }

    /// Create a mock that calls through to `original` until mocked.
    pub fn spy<A, R>(
        &self,
        name: impl Into<String>,
        original: impl Fn(&A) -> R + Send + Sync + 'static,
    ) -> MockFn<A, R>
    where
        A: Clone + Send + 'static,
        R: Clone + Default + Send + 'static,
    {
        let mock = MockFn::with_original(name, Some(Arc::new(original)));
        self.register(Arc::new(mock.clone()));
        mock
    }

    pub fn len(&self) -> usize {
        lock(&self.mocks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn each(&self, f: impl Fn(&dyn MockHandle)) {
        let mocks = lock(&self.mocks).clone();
        for mock in &mocks {
            f(mock.as_ref());
        }
    }

    pub fn clear_all(&self) {
        self.each(|m| m.clear());
    }

    pub fn reset_all(&self) {
        self.each(|m| m.reset());
    }

    pub fn restore_all(&self) {
        self.each(|m| m.restore());
    }
}

/// Apply the configured cleanup before a test. Only the strongest
/// configured policy runs since it subsumes the weaker ones.
pub fn clear_module_mocks(policy: Option<MockPolicy>, mocks: &MockRegistry) {
    match policy {
        Some(MockPolicy::Restore) => mocks.restore_all(),
        Some(MockPolicy::Reset) => mocks.reset_all(),
        Some(MockPolicy::Clear) => mocks.clear_all(),
        None => {}
    }
}
