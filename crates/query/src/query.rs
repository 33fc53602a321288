use crate::error::{Error, Result};
use crate::machine::{Machine, settled};
use common::{Key, LoadingState};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, TryFutureExt};
use std::fmt::Display;
use std::sync::{Arc, Weak};
use std::time::Duration;
use storage::{CacheStore, Coordinator, MemoryCache, Observer, ObserverId};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, warn};

type FetchFn<T> = Box<dyn Fn() -> BoxFuture<'static, common::error::Result<T>> + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Overrides the coordinator's default TTL for values this query caches.
    pub ttl: Option<Duration>,
}

impl QueryOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

struct QueryInner<T, C> {
    id:          ObserverId,
    key:         Key,
    ttl:         Duration,
    coordinator: Coordinator<C>,
    fetch:       FetchFn<T>,
    machine:     Machine<T>,
    runtime:     Handle,
    this:        Weak<QueryInner<T, C>>,
}

impl<T, C> QueryInner<T, C>
where
    T: Clone + Send + Sync + 'static,
    C: CacheStore,
{
    fn spawn(self: &Arc<Self>, generation: u64, since: u64, use_cache: bool) {
        let task = self
            .runtime
            .spawn(self.clone().run(generation, since, use_cache));
        self.machine.attach(generation, task.abort_handle());
    }

    /// Starts a run unless one is in flight. Returns whether it started.
    fn start(self: &Arc<Self>) -> bool {
        let since = self.coordinator.epoch();
        match self.machine.begin(since) {
            Some(generation) => {
                self.spawn(generation, since, true);
                true
            }
            None => {
                debug!(key = %self.key, query = %self.id, "fetch already in flight");
                false
            }
        }
    }

    /// `since` is the invalidation epoch the run was launched at.
    async fn run(self: Arc<Self>, generation: u64, since: u64, use_cache: bool) {
        if use_cache {
            match self.coordinator.read::<T>(&self.key) {
                Ok(value) => {
                    self.finish(generation, since, LoadingState::Success(value), false);
                    return;
                }
                Err(e) if e.is_cache_miss() => {}
                Err(e) => {
                    // another reader stores a different type under this key
                    warn!(key = %self.key, error = %e, "unreadable cache entry");
                    self.finish(generation, since, LoadingState::Error(common::Error::failed(e)), false);
                    return;
                }
            }
        }

        debug!(key = %self.key, query = %self.id, "fetching");
        let outcome = match (self.fetch)().await {
            Ok(value) => LoadingState::Success(value),
            Err(e) => {
                debug!(key = %self.key, error = %e, "fetch failed");
                LoadingState::Error(e)
            }
        };
        self.finish(generation, since, outcome, true);
    }

    fn finish(
        self: &Arc<Self>,
        generation: u64,
        since: u64,
        outcome: LoadingState<T>,
        write_back: bool,
    ) {
        let settled = self.machine.settle(generation, outcome, |value| {
            !write_back
                || self.coordinator.write_unless_invalidated(
                    self.key.clone(),
                    value.clone(),
                    self.ttl,
                    since,
                )
        });

        if settled == Some(true) {
            debug!(key = %self.key, query = %self.id, "invalidated during fetch, running again");
            self.start();
        }
    }
}

impl<T, C> Observer for QueryInner<T, C>
where
    T: Clone + Send + Sync + 'static,
    C: CacheStore,
{
    fn observer_id(&self) -> ObserverId {
        self.id
    }

    fn on_invalidate(&self, key: &Key, epoch: u64) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let since = self.coordinator.epoch();
        match self.machine.begin_or_mark_stale(epoch, since) {
            Some(generation) => {
                debug!(key = %key, query = %self.id, epoch, "invalidated, refetching");
                this.spawn(generation, since, true);
            }
            None => {
                debug!(key = %key, query = %self.id, epoch, "invalidation already covered or marked stale");
            }
        }
    }
}

/// Per-consumer read of one key.
///
/// A query registers with the coordinator when created and unregisters when
/// dropped. Runs execute on the tokio runtime the query was created in, so
/// dropping an [`execute`](Query::execute) future never strands the state in
/// `Loading`. Dropping the query cancels its in-flight fetch.
pub struct Query<T, C = MemoryCache>
where
    T: Clone + Send + Sync + 'static,
    C: CacheStore,
{
    inner: Arc<QueryInner<T, C>>,
}

impl<T, C> Query<T, C>
where
    T: Clone + Send + Sync + 'static,
    C: CacheStore,
{
    /// Must be called from within a tokio runtime.
    pub fn new<F, Fut, E>(coordinator: &Coordinator<C>, key: Key, fetch: F) -> Result<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Display,
    {
        Self::with_options(coordinator, key, QueryOptions::default(), fetch)
    }

    pub fn with_options<F, Fut, E>(
        coordinator: &Coordinator<C>,
        key: Key,
        options: QueryOptions,
        fetch: F,
    ) -> Result<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Display,
    {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let fetch: FetchFn<T> =
            Box::new(move || fetch().map_err(|e| common::Error::failed(e)).boxed());

        let inner = Arc::new_cyclic(|this| QueryInner {
            id: ObserverId::next(),
            ttl: options.ttl.unwrap_or_else(|| coordinator.default_ttl()),
            key,
            coordinator: coordinator.clone(),
            fetch,
            machine: Machine::new(),
            runtime,
            this: this.clone(),
        });

        let observer: Arc<dyn Observer> = inner.clone();
        coordinator.subscribe(&observer, inner.key.clone())?;
        debug!(key = %inner.key, query = %inner.id, "query created");

        Ok(Self { inner })
    }

    pub fn key(&self) -> &Key {
        &self.inner.key
    }

    pub fn id(&self) -> ObserverId {
        self.inner.id
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    pub fn state(&self) -> LoadingState<T> {
        self.inner.machine.state()
    }

    pub fn is_fetching(&self) -> bool {
        self.inner.machine.is_running()
    }

    pub fn watch(&self) -> watch::Receiver<LoadingState<T>> {
        self.inner.machine.watch()
    }

    /// Stream of state changes, starting with the current state.
    pub fn states(&self) -> WatchStream<LoadingState<T>> {
        WatchStream::new(self.watch())
    }

    /// Serves from the cache or fetches, and waits for the outcome.
    ///
    /// A call made while a fetch is in flight joins it rather than starting
    /// another one.
    pub async fn execute(&self) -> LoadingState<T> {
        let receiver = self.watch();
        self.inner.start();
        settled(receiver).await
    }

    /// Starts an execution without waiting. Returns `false` if one was
    /// already in flight.
    pub fn start(&self) -> bool {
        self.inner.start()
    }

    /// Cancels any in-flight fetch and fetches again, bypassing the cache.
    pub async fn refetch(&self) -> LoadingState<T> {
        let receiver = self.watch();
        let since = self.inner.coordinator.epoch();
        let generation = self.inner.machine.supersede(since);
        debug!(key = %self.inner.key, query = %self.inner.id, "refetch requested");
        self.inner.spawn(generation, since, false);
        settled(receiver).await
    }

    /// Cancels the in-flight fetch, settling into `OperationCancelled`.
    pub fn cancel(&self) -> bool {
        self.inner.machine.cancel()
    }

    /// Adds a success callback. If the query already holds a value the
    /// callback is invoked with it right away.
    pub fn on_success(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> &Self {
        self.inner.machine.on_success(Arc::new(callback));
        self
    }

    /// Adds an error callback, replaying a current error immediately.
    pub fn on_error(&self, callback: impl Fn(&common::Error) + Send + Sync + 'static) -> &Self {
        self.inner.machine.on_error(Arc::new(callback));
        self
    }
}

impl<T, C> Drop for Query<T, C>
where
    T: Clone + Send + Sync + 'static,
    C: CacheStore,
{
    fn drop(&mut self) {
        if self.inner.machine.cancel() {
            debug!(key = %self.inner.key, query = %self.inner.id, "cancelled fetch on drop");
        }
        if let Err(e) = self
            .inner
            .coordinator
            .unsubscribe(self.inner.id, &self.inner.key)
        {
            warn!(key = %self.inner.key, error = %e, "query was not subscribed at teardown");
        }
    }
}

impl<T, C> std::fmt::Debug for Query<T, C>
where
    T: Clone + Send + Sync + std::fmt::Debug + 'static,
    C: CacheStore,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("id", &self.inner.id)
            .field("key", &self.inner.key)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{EngineConfig, key};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Semaphore;
    use tokio_stream::StreamExt;

    /// Fetch function returning how many times it has been called, optionally
    /// blocking on a gate until the test hands out permits.
    struct Fetcher {
        calls: Arc<AtomicUsize>,
        gate:  Option<Arc<Semaphore>>,
    }

    impl Fetcher {
        fn open() -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                gate:  None,
            }
        }

        fn gated() -> (Self, Arc<Semaphore>) {
            let gate = Arc::new(Semaphore::new(0));
            let fetcher = Self {
                calls: Arc::new(AtomicUsize::new(0)),
                gate:  Some(gate.clone()),
            };
            (fetcher, gate)
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn query(&self, coordinator: &Coordinator, key: Key) -> Query<usize> {
            let calls = self.calls.clone();
            let gate = self.gate.clone();
            Query::new(coordinator, key, move || {
                let calls = calls.clone();
                let gate = gate.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if let Some(gate) = gate {
                        gate.acquire().await.unwrap().forget();
                    }
                    Ok::<_, String>(n)
                }
            })
            .unwrap()
        }
    }

    fn coordinator() -> Coordinator {
        Coordinator::new(&EngineConfig::default())
    }

    #[tokio::test]
    async fn test_miss_fetches_and_populates_cache() {
        let coordinator = coordinator();
        let fetcher = Fetcher::open();
        let query = fetcher.query(&coordinator, key!["recipe", 1]);
        assert!(query.state().is_idle());

        assert_eq!(query.execute().await, LoadingState::Success(1));
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(coordinator.read::<usize>(&key!["recipe", 1]).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fresh_entry_is_served_without_fetch() {
        let coordinator = coordinator();
        coordinator.write(key!["recipe", 1], 41_usize, Duration::from_secs(60));

        let fetcher = Fetcher::open();
        let query = fetcher.query(&coordinator, key!["recipe", 1]);
        assert_eq!(query.execute().await, LoadingState::Success(41));
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_execute_is_single_flight() {
        let coordinator = coordinator();
        let (fetcher, gate) = Fetcher::gated();
        let query = fetcher.query(&coordinator, key!["recipe"]);

        let (first, second, ()) = tokio::join!(query.execute(), query.execute(), async {
            tokio::task::yield_now().await;
            gate.add_permits(1);
        });

        assert_eq!(first, LoadingState::Success(1));
        assert_eq!(second, LoadingState::Success(1));
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fetch_after_expiry_leaves_cache_empty() {
        let coordinator = coordinator();
        coordinator.write(key!["recipe"], 7_usize, Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(11)).await;

        let query = Query::new(&coordinator, key!["recipe"], || async {
            Err::<usize, _>("offline")
        })
        .unwrap();
        let state = query.execute().await;
        assert_eq!(state, LoadingState::Error(common::Error::failed("offline")));
        assert!(
            coordinator
                .read::<usize>(&key!["recipe"])
                .unwrap_err()
                .is_cache_miss()
        );
    }

    #[tokio::test]
    async fn test_failed_refetch_keeps_good_value() {
        let coordinator = coordinator();
        coordinator.write(key!["recipe"], 7_usize, Duration::from_secs(60));

        let query = Query::new(&coordinator, key!["recipe"], || async {
            Err::<usize, _>("offline")
        })
        .unwrap();
        assert!(query.refetch().await.is_error());
        assert_eq!(coordinator.read::<usize>(&key!["recipe"]).unwrap(), 7);
    }

    #[tokio::test]
    async fn test_refetch_bypasses_cache() {
        let coordinator = coordinator();
        coordinator.write(key!["recipe"], 100_usize, Duration::from_secs(60));

        let fetcher = Fetcher::open();
        let query = fetcher.query(&coordinator, key!["recipe"]);
        assert_eq!(query.execute().await, LoadingState::Success(100));
        assert_eq!(query.refetch().await, LoadingState::Success(1));
        assert_eq!(coordinator.read::<usize>(&key!["recipe"]).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalidation_refetches_once() {
        let coordinator = coordinator();
        let fetcher = Fetcher::open();
        let query = fetcher.query(&coordinator, key!["recipe", 3]);
        assert_eq!(query.execute().await, LoadingState::Success(1));

        let mut states = query.watch();
        let report = coordinator.invalidate(&key!["recipe"]);
        assert_eq!(report.removed, vec![key!["recipe", 3]]);
        assert_eq!(report.notified, 1);

        states.wait_for(|s| s.value() == Some(&2)).await.unwrap();
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(coordinator.read::<usize>(&key!["recipe", 3]).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_invalidations_during_fetch_coalesce() {
        let coordinator = coordinator();
        let (fetcher, gate) = Fetcher::gated();
        let query = fetcher.query(&coordinator, key!["recipe"]);
        let mut states = query.watch();

        assert!(query.start());
        tokio::task::yield_now().await;
        for _ in 0..3 {
            coordinator.invalidate(&key!["recipe"]);
        }
        gate.add_permits(2);

        states.wait_for(|s| s.value() == Some(&2)).await.unwrap();
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(fetcher.calls(), 2);
        // only the follow-up fetch was cached
        assert_eq!(coordinator.read::<usize>(&key!["recipe"]).unwrap(), 2);
    }

    /// Opens the fetch gate when notified, then waits for the query to settle
    /// before the remaining observers hear about the same pass.
    struct Gatekeeper {
        id:     ObserverId,
        gate:   Arc<Semaphore>,
        states: watch::Receiver<LoadingState<usize>>,
    }

    impl Observer for Gatekeeper {
        fn observer_id(&self) -> ObserverId {
            self.id
        }

        fn on_invalidate(&self, _key: &Key, _epoch: u64) {
            self.gate.add_permits(1);
            for _ in 0..200 {
                if !self.states.borrow().is_loading() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fetch_settling_during_invalidation_is_not_cached() {
        for _ in 0..20 {
            let coordinator = coordinator();
            let server = Arc::new(AtomicUsize::new(1));
            let calls = Arc::new(AtomicUsize::new(0));
            let gate = Arc::new(Semaphore::new(0));

            let query = {
                let (server, calls, gate) = (server.clone(), calls.clone(), gate.clone());
                Query::new(&coordinator, key!["account"], move || {
                    let (server, calls, gate) = (server.clone(), calls.clone(), gate.clone());
                    async move {
                        let value = server.load(Ordering::SeqCst);
                        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                            gate.acquire().await.unwrap().forget();
                        }
                        Ok::<_, String>(value)
                    }
                })
                .unwrap()
            };
            assert!(query.start());
            while calls.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }

            let gatekeeper = Arc::new(Gatekeeper {
                id:     ObserverId::next(),
                gate:   gate.clone(),
                states: query.watch(),
            });
            let erased: Arc<dyn Observer> = gatekeeper.clone();
            coordinator.subscribe(&erased, key!["account", "x"]).unwrap();

            server.store(2, Ordering::SeqCst);
            // the gatekeeper blocks inside its callback
            let invalidator = coordinator.clone();
            tokio::task::spawn_blocking(move || invalidator.invalidate(&key!["account"]))
                .await
                .unwrap();

            let mut states = query.watch();
            tokio::time::timeout(
                Duration::from_secs(2),
                states.wait_for(|s| s.value() == Some(&2)),
            )
            .await
            .expect("query kept the value fetched before the invalidation")
            .unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;

            assert_eq!(query.state(), LoadingState::Success(2));
            assert_eq!(coordinator.read::<usize>(&key!["account"]).unwrap(), 2);
            assert_eq!(calls.load(Ordering::SeqCst), 2);
        }
    }

    #[tokio::test]
    async fn test_type_mismatch_settles_as_error() {
        let coordinator = coordinator();
        coordinator.write(key!["recipe"], String::from("pancakes"), Duration::from_secs(60));

        let fetcher = Fetcher::open();
        let query = fetcher.query(&coordinator, key!["recipe"]);
        let state = query.execute().await;
        assert!(matches!(state.error(), Some(common::Error::OperationFailed(_))));
        assert_eq!(fetcher.calls(), 0);
        assert_eq!(coordinator.read::<String>(&key!["recipe"]).unwrap(), "pancakes");
    }

    #[tokio::test]
    async fn test_cancel_settles_cancelled() {
        let coordinator = coordinator();
        let (fetcher, _gate) = Fetcher::gated();
        let query = fetcher.query(&coordinator, key!["recipe"]);

        assert!(query.start());
        assert!(!query.start());
        assert!(query.is_fetching());
        assert!(query.cancel());
        assert!(!query.is_fetching());
        assert_eq!(query.state(), LoadingState::Error(common::Error::OperationCancelled));

        let replayed = Arc::new(AtomicBool::new(false));
        let flag = replayed.clone();
        query.on_error(move |e| flag.store(e.is_cancelled(), Ordering::SeqCst));
        assert!(replayed.load(Ordering::SeqCst));
        assert!(coordinator.is_empty());
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_drop_cancels_and_unsubscribes() {
        let coordinator = coordinator();
        let dropped = Arc::new(AtomicBool::new(false));
        let cancelled = Arc::new(AtomicBool::new(false));

        let flag = dropped.clone();
        let query = Query::new(&coordinator, key!["recipe"], move || {
            let guard = DropFlag(flag.clone());
            async move {
                let _guard = guard;
                std::future::pending::<std::result::Result<usize, String>>().await
            }
        })
        .unwrap();
        let seen = cancelled.clone();
        query.on_error(move |e| seen.store(e.is_cancelled(), Ordering::SeqCst));

        assert!(query.start());
        tokio::task::yield_now().await;
        assert_eq!(coordinator.observer_count(&key!["recipe"]), 1);

        drop(query);
        assert!(cancelled.load(Ordering::SeqCst));
        assert_eq!(coordinator.observer_count(&key!["recipe"]), 0);

        for _ in 0..10 {
            if dropped.load(Ordering::SeqCst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(dropped.load(Ordering::SeqCst));
        assert!(coordinator.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_override() {
        let coordinator = coordinator();
        let fetcher = Fetcher::open();
        let calls = fetcher.calls.clone();
        let query = Query::with_options(
            &coordinator,
            key!["recipe"],
            QueryOptions::default().with_ttl(Duration::from_secs(1)),
            move || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok::<_, String>(n) }
            },
        )
        .unwrap();
        assert_eq!(query.ttl(), Duration::from_secs(1));

        assert_eq!(query.execute().await, LoadingState::Success(1));
        assert_eq!(query.execute().await, LoadingState::Success(1));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(query.execute().await, LoadingState::Success(2));
    }

    #[tokio::test]
    async fn test_states_stream_starts_with_current() {
        let coordinator = coordinator();
        let fetcher = Fetcher::open();
        let query = fetcher.query(&coordinator, key!["recipe"]);
        query.execute().await;

        let mut states = query.states();
        assert_eq!(states.next().await, Some(LoadingState::Success(1)));
    }

    #[test]
    fn test_requires_runtime() {
        let coordinator = coordinator();
        let result = Query::new(&coordinator, key!["recipe"], || async { Ok::<u8, String>(1) });
        assert!(matches!(result, Err(Error::NoRuntime)));
    }
}
