//! A value guarded by a fair asynchronous lock.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

struct State<C, V> {
    context: Option<C>,
    value: V,
}

/// Serializes decisions about a single resource.
///
/// Executors run one at a time in the order they called [`AsyncLock::with`].
/// Each receives a copy of the value and returns the new one; the new value
/// only replaces the old one if the executor succeeds. A failed or cancelled
/// executor leaves the value untouched and the lock usable.
pub struct AsyncLock<C, V> {
    queue: tokio::sync::Mutex<()>,
    state: Mutex<State<C, V>>,
}

/// Clears the holder context once the executor finishes or is dropped.
struct Holder<'a, C, V> {
    lock: &'a AsyncLock<C, V>,
}

impl<C, V> Drop for Holder<'_, C, V> {
    fn drop(&mut self) {
        self.lock.state().context = None;
    }
}

impl<C, V> AsyncLock<C, V> {
    fn state(&self) -> MutexGuard<'_, State<C, V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C: Clone, V: Clone> AsyncLock<C, V> {
    pub fn new(value: V) -> Self {
        Self {
            queue: tokio::sync::Mutex::new(()),
            state: Mutex::new(State {
                context: None,
                value,
            }),
        }
    }

    /// Run `executor` once all earlier executors finished. `context`
    /// describes the executor to others while it holds the lock.
    pub async fn with<R, E, F, Fut>(&self, context: Option<C>, executor: F) -> Result<R, E>
    where
        F: FnOnce(V) -> Fut,
        Fut: Future<Output = Result<(V, R), E>>,
    {
        let _turn = self.queue.lock().await;
        let current = {
            let mut state = self.state();
            state.context = context;
            state.value.clone()
        };
        let _holder = Holder { lock: self };

        let (value, result) = executor(current).await?;
        self.state().value = value;
        Ok(result)
    }

    /// Copy of the last committed value.
    pub fn snapshot(&self) -> V {
        self.state().value.clone()
    }

    /// Context of the executor currently holding the lock.
    pub fn context(&self) -> Option<C> {
        self.state().context.clone()
    }
}
