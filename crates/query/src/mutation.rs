use crate::error::{Error, Result};
use crate::machine::Machine;
use common::{Key, LoadingState};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, TryFutureExt};
use std::fmt::Display;
use std::sync::Arc;
use storage::{CacheStore, Coordinator, MemoryCache};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info};

type WriteFn<I, O> = Box<dyn Fn(I) -> BoxFuture<'static, common::error::Result<O>> + Send + Sync>;

struct MutationInner<I, O, C> {
    invalidates: Vec<Key>,
    coordinator: Coordinator<C>,
    write:       WriteFn<I, O>,
    machine:     Machine<O>,
}

impl<I, O, C> MutationInner<I, O, C>
where
    I: Send + 'static,
    O: Clone + Send + Sync + 'static,
    C: CacheStore,
{
    async fn run(self: Arc<Self>, generation: u64, input: I) -> LoadingState<O> {
        let outcome = match (self.write)(input).await {
            Ok(value) => LoadingState::Success(value),
            Err(e) => {
                debug!(error = %e, "mutation failed");
                LoadingState::Error(e)
            }
        };

        let Some(outcome) = self.publish(generation, outcome) else {
            // cancelled or superseded after the write resolved
            return LoadingState::Error(common::Error::OperationCancelled);
        };
        if outcome.is_success() {
            for pattern in &self.invalidates {
                self.coordinator.invalidate(pattern);
            }
            info!(invalidated = self.invalidates.len(), "mutation succeeded");
        }
        outcome
    }

    /// Settles `generation`, or returns `None` if it is no longer current.
    fn publish(&self, generation: u64, outcome: LoadingState<O>) -> Option<LoadingState<O>> {
        match self.machine.settle(generation, outcome.clone(), |_| true) {
            Some(_) => Some(outcome),
            None => {
                debug!(generation, "mutation outcome superseded");
                None
            }
        }
    }
}

/// Write coordinator.
///
/// Each [`execute`](Mutation::execute) runs the write function and, on
/// success, invalidates every declared key prefix before returning. Starting
/// a new execution cancels one still in flight. Dropping the mutation cancels
/// its in-flight write.
pub struct Mutation<I, O, C = MemoryCache>
where
    I: Send + 'static,
    O: Clone + Send + Sync + 'static,
    C: CacheStore,
{
    inner:   Arc<MutationInner<I, O, C>>,
    runtime: Handle,
}

impl<I, O, C> Mutation<I, O, C>
where
    I: Send + 'static,
    O: Clone + Send + Sync + 'static,
    C: CacheStore,
{
    /// Must be called from within a tokio runtime.
    pub fn new<K, F, Fut, E>(coordinator: &Coordinator<C>, invalidates: K, write: F) -> Result<Self>
    where
        K: IntoIterator<Item = Key>,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<O, E>> + Send + 'static,
        E: Display,
    {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let write: WriteFn<I, O> =
            Box::new(move |input| write(input).map_err(|e| common::Error::failed(e)).boxed());

        Ok(Self {
            inner: Arc::new(MutationInner {
                invalidates: invalidates.into_iter().collect(),
                coordinator: coordinator.clone(),
                write,
                machine: Machine::new(),
            }),
            runtime,
        })
    }

    pub fn invalidates(&self) -> &[Key] {
        &self.inner.invalidates
    }

    pub fn state(&self) -> LoadingState<O> {
        self.inner.machine.state()
    }

    pub fn is_running(&self) -> bool {
        self.inner.machine.is_running()
    }

    pub fn watch(&self) -> watch::Receiver<LoadingState<O>> {
        self.inner.machine.watch()
    }

    /// Runs the write with `input` and returns this execution's outcome.
    ///
    /// If a later call supersedes this one, or [`cancel`](Self::cancel) is
    /// called, the result is `Error(OperationCancelled)`. Dropping the
    /// returned future does not stop the write.
    pub async fn execute(&self, input: I) -> LoadingState<O> {
        // mutations never commit to the cache, so the epoch is irrelevant
        let generation = self.inner.machine.supersede(0);
        let task = self
            .runtime
            .spawn(self.inner.clone().run(generation, input));
        self.inner.machine.attach(generation, task.abort_handle());

        match task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => LoadingState::Error(common::Error::OperationCancelled),
            Err(e) => LoadingState::Error(common::Error::failed(e)),
        }
    }

    /// Cancels the in-flight write, settling into `OperationCancelled`.
    pub fn cancel(&self) -> bool {
        self.inner.machine.cancel()
    }

    /// Returns a settled mutation to `Idle`. No-op while running.
    pub fn reset(&self) -> bool {
        self.inner.machine.reset()
    }

    pub fn on_success(&self, callback: impl Fn(&O) + Send + Sync + 'static) -> &Self {
        self.inner.machine.on_success(Arc::new(callback));
        self
    }

    pub fn on_error(&self, callback: impl Fn(&common::Error) + Send + Sync + 'static) -> &Self {
        self.inner.machine.on_error(Arc::new(callback));
        self
    }
}

impl<I, O, C> Drop for Mutation<I, O, C>
where
    I: Send + 'static,
    O: Clone + Send + Sync + 'static,
    C: CacheStore,
{
    fn drop(&mut self) {
        if self.inner.machine.cancel() {
            debug!("cancelled mutation on drop");
        }
    }
}
