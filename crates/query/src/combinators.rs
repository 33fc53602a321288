//! Folds over the states of several queries and mutations.
//!
//! Precedence is the same everywhere: any `Error` wins (the first one met),
//! then any `Loading`, then `Success` only when every input succeeded,
//! otherwise `Idle`. An empty input set counts as all-success.

use crate::{Mutation, Query};
use common::{Error, LoadingState};
use futures_util::FutureExt;
use futures_util::future::select_all;
use storage::CacheStore;
use tokio::sync::watch;

/// Anything exposing a current [`LoadingState`].
pub trait HasLoadingState {
    type Output;

    fn loading_state(&self) -> LoadingState<Self::Output>;
}

impl<T: Clone> HasLoadingState for LoadingState<T> {
    type Output = T;

    fn loading_state(&self) -> LoadingState<T> {
        self.clone()
    }
}

impl<T: Clone> HasLoadingState for watch::Receiver<LoadingState<T>> {
    type Output = T;

    fn loading_state(&self) -> LoadingState<T> {
        self.borrow().clone()
    }
}

impl<T, C> HasLoadingState for Query<T, C>
where
    T: Clone + Send + Sync + 'static,
    C: CacheStore,
{
    type Output = T;

    fn loading_state(&self) -> LoadingState<T> {
        self.state()
    }
}

impl<I, O, C> HasLoadingState for Mutation<I, O, C>
where
    I: Send + 'static,
    O: Clone + Send + Sync + 'static,
    C: CacheStore,
{
    type Output = O;

    fn loading_state(&self) -> LoadingState<O> {
        self.state()
    }
}

impl<S: HasLoadingState + ?Sized> HasLoadingState for &S {
    type Output = S::Output;

    fn loading_state(&self) -> LoadingState<S::Output> {
        (**self).loading_state()
    }
}

/// Folds homogeneous states into one.
pub fn combine<T>(states: impl IntoIterator<Item = LoadingState<T>>) -> LoadingState<Vec<T>> {
    let mut values = Vec::new();
    let mut loading = false;
    let mut idle = false;

    for state in states {
        match state {
            LoadingState::Error(e) => return LoadingState::Error(e),
            LoadingState::Loading => loading = true,
            LoadingState::Idle => idle = true,
            LoadingState::Success(value) => values.push(value),
        }
    }

    if loading {
        LoadingState::Loading
    } else if idle {
        LoadingState::Idle
    } else {
        LoadingState::Success(values)
    }
}

/// [`combine`] over anything exposing a state.
pub fn combine_all<S>(inputs: impl IntoIterator<Item = S>) -> LoadingState<Vec<S::Output>>
where
    S: HasLoadingState,
{
    combine(inputs.into_iter().map(|input| input.loading_state()))
}

pub fn first_error<'a, T: 'a>(
    states: impl IntoIterator<Item = &'a LoadingState<T>>,
) -> Option<&'a Error> {
    states.into_iter().find_map(LoadingState::error)
}

pub fn any_loading<'a, T: 'a>(states: impl IntoIterator<Item = &'a LoadingState<T>>) -> bool {
    states.into_iter().any(LoadingState::is_loading)
}

pub fn all_success<'a, T: 'a>(states: impl IntoIterator<Item = &'a LoadingState<T>>) -> bool {
    states.into_iter().all(LoadingState::is_success)
}

/// Precedence of a state with its value stripped.
fn shape<T>(state: &LoadingState<T>) -> LoadingState<()> {
    state.as_ref().map(|_| ())
}

/// Folds two differently typed states into a tuple.
pub fn zip<A, B>(a: LoadingState<A>, b: LoadingState<B>) -> LoadingState<(A, B)> {
    match combine([shape(&a), shape(&b)]) {
        LoadingState::Success(_) => match (a, b) {
            (LoadingState::Success(a), LoadingState::Success(b)) => LoadingState::Success((a, b)),
            // every input was checked to be a success above
            _ => LoadingState::Idle,
        },
        LoadingState::Error(e) => LoadingState::Error(e),
        LoadingState::Loading => LoadingState::Loading,
        LoadingState::Idle => LoadingState::Idle,
    }
}

pub fn zip3<A, B, C>(
    a: LoadingState<A>,
    b: LoadingState<B>,
    c: LoadingState<C>,
) -> LoadingState<(A, B, C)> {
    zip(zip(a, b), c).map(|((a, b), c)| (a, b, c))
}

/// Aggregate of several live states, recomputed on demand.
pub struct CombinedView<T> {
    inputs: Vec<watch::Receiver<LoadingState<T>>>,
}

impl<T: Clone> CombinedView<T> {
    pub fn new(inputs: impl IntoIterator<Item = watch::Receiver<LoadingState<T>>>) -> Self {
        Self {
            inputs: inputs.into_iter().collect(),
        }
    }

    pub fn push(&mut self, input: watch::Receiver<LoadingState<T>>) {
        self.inputs.push(input);
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn current(&self) -> LoadingState<Vec<T>> {
        combine_all(self.inputs.iter())
    }

    /// Waits until any input changes, then returns the new aggregate.
    ///
    /// Returns immediately with the current aggregate when there are no
    /// inputs or every input's owner is gone.
    pub async fn changed(&mut self) -> LoadingState<Vec<T>>
    where
        T: Send + Sync,
    {
        {
            let mut open: Vec<_> = self
                .inputs
                .iter_mut()
                .filter(|input| input.has_changed().is_ok())
                .map(|input| input.changed().boxed())
                .collect();

            while !open.is_empty() {
                let (result, _, rest) = select_all(open).await;
                if result.is_ok() {
                    break;
                }
                open = rest;
            }
        }
        self.current()
    }
}
