//! State cell shared by [`Query`](crate::Query) and [`Mutation`](crate::Mutation).
//!
//! Every transition happens under `control`, which also tracks the one
//! execution allowed to settle the state (the current *flight*). A flight is
//! identified by a generation number; a task that finds its generation is no
//! longer current has been cancelled or superseded and must not touch the
//! state or the cache.
//!
//! Each launch also records the invalidation epoch it started at. An
//! invalidation notice carrying an epoch no newer than that is already
//! covered and ignored.

use common::{Error, LoadingState};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::AbortHandle;

pub(crate) type SuccessFn<T> = Arc<dyn Fn(&T) + Send + Sync>;
pub(crate) type ErrorFn = Arc<dyn Fn(&Error) + Send + Sync>;

struct Flight {
    generation: u64,
    task:       Option<AbortHandle>,
    /// An invalidation arrived while this flight was running.
    stale:      bool,
}

impl Flight {
    fn abort(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

struct Control<T> {
    flight:          Option<Flight>,
    next_generation: u64,
    /// Highest epoch a flight was launched at.
    fresh_since:     u64,
    on_success:      Vec<SuccessFn<T>>,
    on_error:        Vec<ErrorFn>,
}

impl<T> Control<T> {
    fn launch(&mut self, since: u64) -> u64 {
        self.fresh_since = self.fresh_since.max(since);
        self.next_generation += 1;
        let generation = self.next_generation;
        self.flight = Some(Flight {
            generation,
            task: None,
            stale: false,
        });
        generation
    }

    fn is_current(&self, generation: u64) -> bool {
        self.flight
            .as_ref()
            .is_some_and(|flight| flight.generation == generation)
    }
}

/// Callbacks captured for one settled state, run after the lock is released.
enum Dispatch<T> {
    Nothing,
    Success(Vec<SuccessFn<T>>, T),
    Error(Vec<ErrorFn>, Error),
}

impl<T> Dispatch<T> {
    fn prepare(control: &Control<T>, state: &LoadingState<T>) -> Self
    where
        T: Clone,
    {
        match state {
            LoadingState::Success(value) => {
                Dispatch::Success(control.on_success.clone(), value.clone())
            }
            LoadingState::Error(error) => Dispatch::Error(control.on_error.clone(), error.clone()),
            LoadingState::Idle | LoadingState::Loading => Dispatch::Nothing,
        }
    }

    fn run(self) {
        match self {
            Dispatch::Success(callbacks, value) => callbacks.iter().for_each(|f| f(&value)),
            Dispatch::Error(callbacks, error) => callbacks.iter().for_each(|f| f(&error)),
            Dispatch::Nothing => {}
        }
    }
}

pub(crate) struct Machine<T> {
    state:   watch::Sender<LoadingState<T>>,
    control: Mutex<Control<T>>,
}

impl<T: Clone + Send + Sync + 'static> Machine<T> {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(LoadingState::Idle);
        Self {
            state,
            control: Mutex::new(Control {
                flight:          None,
                next_generation: 0,
                fresh_since:     0,
                on_success:      Vec::new(),
                on_error:        Vec::new(),
            }),
        }
    }

    pub(crate) fn state(&self) -> LoadingState<T> {
        self.state.borrow().clone()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<LoadingState<T>> {
        self.state.subscribe()
    }

    /// Starts a flight unless one is already running.
    pub(crate) fn begin(&self, since: u64) -> Option<u64> {
        let mut control = self.control.lock();
        if control.flight.is_some() {
            return None;
        }
        let generation = control.launch(since);
        self.state.send_replace(LoadingState::Loading);
        Some(generation)
    }

    /// Reacts to an invalidation pass at `epoch`: ignored if a flight was
    /// launched at or after it, flags a running flight as stale, otherwise
    /// starts a flight at `since`.
    pub(crate) fn begin_or_mark_stale(&self, epoch: u64, since: u64) -> Option<u64> {
        let mut control = self.control.lock();
        if epoch <= control.fresh_since {
            return None;
        }
        if let Some(flight) = control.flight.as_mut() {
            flight.stale = true;
            return None;
        }
        let generation = control.launch(since);
        self.state.send_replace(LoadingState::Loading);
        Some(generation)
    }

    /// Aborts any running flight without settling it and starts a new one.
    pub(crate) fn supersede(&self, since: u64) -> u64 {
        let mut control = self.control.lock();
        if let Some(previous) = control.flight.take() {
            previous.abort();
        }
        let generation = control.launch(since);
        self.state.send_replace(LoadingState::Loading);
        generation
    }

    /// Records the task driving `generation` so it can be aborted.
    pub(crate) fn attach(&self, generation: u64, task: AbortHandle) {
        let mut control = self.control.lock();
        match control.flight.as_mut() {
            Some(flight) if flight.generation == generation => flight.task = Some(task),
            // settled or superseded before we got here
            _ => {}
        }
    }

    /// Settles `generation` with `outcome`.
    ///
    /// `commit` runs under the lock, only for a current, non-stale success,
    /// so nothing it does can land after a cancellation. It reports whether
    /// the value was accepted, and a rejected value counts as stale. Returns
    /// `None` if the flight was no longer current, otherwise whether it had
    /// gone stale.
    pub(crate) fn settle(
        &self,
        generation: u64,
        outcome: LoadingState<T>,
        commit: impl FnOnce(&T) -> bool,
    ) -> Option<bool> {
        let (dispatch, stale) = {
            let mut control = self.control.lock();
            if !control.is_current(generation) {
                return None;
            }
            let flagged = control.flight.take().is_some_and(|flight| flight.stale);
            let stale = match (&outcome, flagged) {
                (LoadingState::Success(value), false) => !commit(value),
                _ => flagged,
            };
            let dispatch = Dispatch::prepare(&control, &outcome);
            self.state.send_replace(outcome);
            (dispatch, stale)
        };
        dispatch.run();
        Some(stale)
    }

    /// Aborts the running flight and settles it as cancelled.
    pub(crate) fn cancel(&self) -> bool {
        let dispatch = {
            let mut control = self.control.lock();
            let Some(flight) = control.flight.take() else {
                return false;
            };
            flight.abort();
            let outcome = LoadingState::Error(Error::OperationCancelled);
            let dispatch = Dispatch::prepare(&control, &outcome);
            self.state.send_replace(outcome);
            dispatch
        };
        dispatch.run();
        true
    }

    /// Returns to `Idle` unless a flight is running.
    pub(crate) fn reset(&self) -> bool {
        let control = self.control.lock();
        if control.flight.is_some() {
            return false;
        }
        self.state.send_replace(LoadingState::Idle);
        true
    }

    pub(crate) fn is_running(&self) -> bool {
        self.control.lock().flight.is_some()
    }

    /// Registers a success callback, replaying the current value if settled.
    pub(crate) fn on_success(&self, callback: SuccessFn<T>) {
        let replay = {
            let mut control = self.control.lock();
            control.on_success.push(callback.clone());
            self.state.borrow().value().cloned()
        };
        if let Some(value) = replay {
            callback(&value);
        }
    }

    /// Registers an error callback, replaying the current error if settled.
    pub(crate) fn on_error(&self, callback: ErrorFn) {
        let replay = {
            let mut control = self.control.lock();
            control.on_error.push(callback.clone());
            self.state.borrow().error().cloned()
        };
        if let Some(error) = replay {
            callback(&error);
        }
    }
}

/// Waits until the state leaves `Loading`.
pub(crate) async fn settled<T: Clone>(
    mut receiver: watch::Receiver<LoadingState<T>>,
) -> LoadingState<T> {
    match receiver.wait_for(|state| !state.is_loading()).await {
        Ok(state) => state.clone(),
        // the sender lives as long as the owning query or mutation
        Err(_) => LoadingState::Error(Error::OperationCancelled),
    }
}
