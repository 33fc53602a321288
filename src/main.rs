use anyhow::Result;
use common::EngineConfig;
use dotenvy::dotenv;
use query::{Mutation, Query, key, zip};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storage::Coordinator;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Account {
    id:    u32,
    email: String,
}

/// In-process stand-in for a remote account API.
#[derive(Clone)]
struct AccountApi {
    account: Arc<Mutex<Account>>,
    latency: Duration,
}

impl AccountApi {
    async fn get(&self) -> Result<Account> {
        tokio::time::sleep(self.latency).await;
        let account = self
            .account
            .lock()
            .map_err(|_| anyhow::anyhow!("account store poisoned"))?
            .clone();
        Ok(account)
    }

    async fn update_email(&self, email: String) -> Result<Account> {
        tokio::time::sleep(self.latency).await;
        if !email.contains('@') {
            anyhow::bail!("invalid email {email:?}");
        }
        let mut account = self
            .account
            .lock()
            .map_err(|_| anyhow::anyhow!("account store poisoned"))?;
        account.email = email;
        Ok(account.clone())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let config = EngineConfig::from_env()?;
    let _guard = common::logging_stdout(&config.log);

    let coordinator = Coordinator::new(&config);
    let sweeper = config
        .sweep_interval
        .map(|period| coordinator.spawn_sweeper(period));

    let api = AccountApi {
        account: Arc::new(Mutex::new(Account {
            id:    1,
            email: "a@x.com".into(),
        })),
        latency: Duration::from_millis(50),
    };

    let fetch_api = api.clone();
    let account = Query::new(&coordinator, key!["account"], move || {
        let api = fetch_api.clone();
        async move { api.get().await }
    })?;
    account.on_success(|account| info!(email = %account.email, "account loaded"));
    account.on_error(|e| info!(error = %e, "account load failed"));

    let settings = Query::new(&coordinator, key!["account", "settings"], || async {
        Ok::<_, String>(serde_json::json!({ "theme": "dark" }))
    })?;

    let update_api = api.clone();
    let update_email = Mutation::new(&coordinator, [key!["account"]], move |email: String| {
        let api = update_api.clone();
        async move { api.update_email(email).await }
    })?;

    let (loaded, prefs) = tokio::join!(account.execute(), settings.execute());
    info!(state = ?zip(loaded, prefs), "initial load");

    let mut states = account.watch();
    let updated = update_email.execute("b@x.com".into()).await;
    info!(state = ?updated, "email updated");
    states
        .wait_for(|state| state.value().is_some_and(|a| a.email == "b@x.com"))
        .await?;

    let rejected = update_email.execute("not-an-email".into()).await;
    info!(state = ?rejected, "update rejected, cache left alone");

    // a late reader is served from the cache the refetch repopulated
    let cached = Query::new(&coordinator, key!["account"], || async {
        Err::<Account, _>("unexpected fetch")
    })?;
    let state = cached.execute().await;
    info!(
        account = %serde_json::to_string(&state.value())?,
        stats = ?coordinator.stats(),
        "served from cache"
    );

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    Ok(())
}
