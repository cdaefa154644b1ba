use anyhow::Context;
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;

use crate::backup::Reconciler;
use crate::db::Store;
use crate::error::DispatchError;

/// Starts a single-user backup without waiting for it to finish.
#[async_trait]
pub trait BackupDispatcher: Send + Sync {
    async fn dispatch(&self, user_id: &str) -> Result<(), DispatchError>;

    /// Wait for every task dispatched so far.
    async fn wait_idle(&self);
}

/// Detached tasks owned by a dispatcher.
#[derive(Default)]
struct Detached {
    tasks: Mutex<JoinSet<()>>,
}

impl Detached {
    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        // reap finished tasks
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    async fn wait_idle(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!("dispatched backup task failed: {}", e);
            }
        }
    }
}

/// Posts `{ "userId": ... }` to the single-user backup endpoint.
pub struct HttpDispatcher {
    http: Client,
    endpoint: String,
    service_token: Option<String>,
    tasks: Detached,
}

impl HttpDispatcher {
    pub fn new(http: Client, endpoint: impl Into<String>, service_token: Option<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            service_token,
            tasks: Detached::default(),
        }
    }
}

#[async_trait]
impl BackupDispatcher for HttpDispatcher {
    async fn dispatch(&self, user_id: &str) -> Result<(), DispatchError> {
        let mut request = self
            .http
            .post(&self.endpoint)
            .json(&serde_json::json!({ "userId": user_id }));
        if let Some(token) = &self.service_token {
            request = request.bearer_auth(token);
        }
        let request = request.build().map_err(|e| DispatchError::Failed {
            user_id: user_id.to_string(),
            reason: e.to_string(),
        })?;

        let http = self.http.clone();
        let user_id = user_id.to_string();
        self.tasks.spawn(async move {
            match http.execute(request).await {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!("backup endpoint accepted {}", user_id);
                }
                Ok(response) => {
                    tracing::warn!(
                        "backup endpoint returned {} for {}",
                        response.status(),
                        user_id
                    );
                }
                Err(e) => {
                    tracing::error!("backup request for {} failed: {}", user_id, e);
                }
            }
        });

        Ok(())
    }

    async fn wait_idle(&self) {
        self.tasks.wait_idle().await;
    }
}

/// Runs the reconciler on this process's runtime.
pub struct LocalDispatcher {
    reconciler: Reconciler,
    tasks: Detached,
}

impl LocalDispatcher {
    pub fn new(reconciler: Reconciler) -> Self {
        Self {
            reconciler,
            tasks: Detached::default(),
        }
    }
}

#[async_trait]
impl BackupDispatcher for LocalDispatcher {
    async fn dispatch(&self, user_id: &str) -> Result<(), DispatchError> {
        let reconciler = self.reconciler.clone();
        let user_id = user_id.to_string();
        self.tasks.spawn(async move {
            match reconciler.run(&user_id).await {
                Ok(outcome) => match outcome.error_message() {
                    None => tracing::debug!("backup for {} finished", user_id),
                    Some(message) => tracing::warn!("backup for {}: {}", user_id, message),
                },
                Err(e) => tracing::error!("backup for {} failed: {}", user_id, e),
            }
        });
        Ok(())
    }

    async fn wait_idle(&self) {
        self.tasks.wait_idle().await;
    }
}

/// Dispatches over HTTP when an endpoint is configured, in-process otherwise.
pub fn dispatcher_for(
    endpoint: Option<&str>,
    service_token: Option<String>,
    http: Client,
    reconciler: Reconciler,
) -> Arc<dyn BackupDispatcher> {
    match endpoint {
        Some(endpoint) => {
            tracing::info!("dispatching backups to {}", endpoint);
            Arc::new(HttpDispatcher::new(http, endpoint, service_token))
        }
        None => {
            tracing::info!("dispatching backups in-process");
            Arc::new(LocalDispatcher::new(reconciler))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FanoutSummary {
    pub users: usize,
    pub dispatched: usize,
    pub failed: usize,
}

/// Dispatch a backup for every user with weekly backups enabled. Reports
/// dispatch only; the backups themselves complete (or not) on their own.
pub async fn run_weekly(
    store: &dyn Store,
    dispatcher: &dyn BackupDispatcher,
) -> anyhow::Result<FanoutSummary> {
    let users = store
        .weekly_backup_users()
        .await
        .context("failed to list users with weekly backup enabled")?;

    let results = join_all(users.iter().map(|user_id| dispatcher.dispatch(user_id))).await;

    let mut failed = 0;
    for result in results {
        if let Err(e) = result {
            tracing::error!("{}", e);
            failed += 1;
        }
    }

    let summary = FanoutSummary {
        users: users.len(),
        dispatched: users.len() - failed,
        failed,
    };
    tracing::info!(
        "weekly fan-out: {} users, {} dispatched, {} failed",
        summary.users,
        summary.dispatched,
        summary.failed
    );
    Ok(summary)
}
