//! Reactive reads and writes over the shared cache.
//!
//! A [`Query`] serves a key from the cache or runs its fetch function,
//! refetching whenever the key is invalidated. A [`Mutation`] runs a write
//! function and, when it succeeds, invalidates the key prefixes it declares.
//! The [`combinators`] fold several of their states into one.

pub mod combinators;
pub mod error;

mod machine;
mod mutation;
mod query;

pub use combinators::{CombinedView, HasLoadingState, combine, combine_all, zip, zip3};
pub use common::{Key, LoadingState, key};
pub use error::{Error, Result};
pub use mutation::Mutation;
pub use query::{Query, QueryOptions};

#[cfg(test)]
mod tests {
    use super::*;
    use common::EngineConfig;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use storage::Coordinator;

    #[derive(Debug, Clone, PartialEq)]
    struct Account {
        id:    u32,
        email: String,
    }

    /// Stand-in for the remote API: one account row plus a call counter.
    #[derive(Clone)]
    struct Server {
        account: Arc<Mutex<Account>>,
        reads:   Arc<AtomicUsize>,
    }

    impl Server {
        fn new(email: &str) -> Self {
            Self {
                account: Arc::new(Mutex::new(Account {
                    id:    1,
                    email: email.into(),
                })),
                reads:   Arc::new(AtomicUsize::new(0)),
            }
        }

        fn account_query(&self, coordinator: &Coordinator) -> Query<Account> {
            let server = self.clone();
            Query::new(coordinator, key!["account"], move || {
                let server = server.clone();
                async move {
                    server.reads.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(server.account.lock().clone())
                }
            })
            .unwrap()
        }
    }

    #[tokio::test]
    async fn test_account_update_scenario() {
        let coordinator =
            Coordinator::new(&EngineConfig::default().with_default_ttl(Duration::from_secs(300)));
        let server = Server::new("a@x.com");

        let query_a = server.account_query(&coordinator);
        let state = query_a.execute().await;
        assert_eq!(state.value().map(|a| a.email.as_str()), Some("a@x.com"));
        assert_eq!(server.reads.load(Ordering::SeqCst), 1);
        assert_eq!(
            coordinator.read::<Account>(&key!["account"]).unwrap().email,
            "a@x.com"
        );

        let remote = server.clone();
        let update_account = Mutation::new(&coordinator, [key!["account"]], move |email: String| {
            let remote = remote.clone();
            async move {
                let mut account = remote.account.lock();
                account.email = email;
                Ok::<_, String>(account.clone())
            }
        })
        .unwrap();

        let mut a_states = query_a.watch();
        let written = update_account.execute("b@x.com".into()).await;
        assert!(written.is_success());

        // query A was notified and refetches on its own
        a_states
            .wait_for(|s| s.value().is_some_and(|a| a.email == "b@x.com"))
            .await
            .unwrap();
        assert_eq!(server.reads.load(Ordering::SeqCst), 2);

        // a query created afterwards is served from the repopulated cache
        let b_reads = Arc::new(AtomicUsize::new(0));
        let counter = b_reads.clone();
        let query_b = Query::new(&coordinator, key!["account"], move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<Account, _>("query B must not fetch") }
        })
        .unwrap();
        let state = query_b.execute().await;
        assert_eq!(state.value().map(|a| a.email.as_str()), Some("b@x.com"));
        assert_eq!(b_reads.load(Ordering::SeqCst), 0);

        // exactly one refetch happened for A
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(server.reads.load(Ordering::SeqCst), 2);

        let both = combine_all([&query_a, &query_b]);
        assert_eq!(both.value().map(Vec::len), Some(2));
    }
}
