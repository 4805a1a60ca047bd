//! Startup readiness and shutdown of all environments.
//!
//! The relay moves through `Starting -> Running -> Closing -> Closed`. Every
//! change to the set of environments goes through [`Lifecycle`], which is
//! also the only component allowed to close a flag client.

use crate::config::EnvironmentConfig;
use crate::credential::CredentialError;
use crate::environment::{EnvironmentContext, EnvironmentId, EnvironmentState};
use crate::flag_client::{FlagClientError, FlagClientFactory};
use crate::metrics_defs::{ENVIRONMENTS_ACTIVE, ENVIRONMENTS_READY};
use crate::registry::EnvironmentRegistry;
use parking_lot::Mutex;
use shared::gauge;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, TryCurrentError};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayState {
    Starting,
    Running,
    Closing,
    Closed,
}

impl RelayState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            RelayState::Starting => "starting",
            RelayState::Running => "running",
            RelayState::Closing => "closing",
            RelayState::Closed => "closed",
        }
    }
}

#[derive(Debug)]
pub struct CloseFailure {
    pub environment: String,
    pub error: FlagClientError,
}

impl fmt::Display for CloseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.environment, self.error)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum LifecycleError {
    #[error("environment {environment}: invalid {field}: {source}")]
    InvalidCredential {
        environment: String,
        field: &'static str,
        #[source]
        source: CredentialError,
    },

    #[error("environment {0} has no credentials")]
    NoCredentials(String),

    #[error("credential {credential} of environment {environment} is already used by {existing}")]
    DuplicateCredential {
        environment: String,
        existing: String,
        credential: String,
    },

    #[error("environment {0} already exists")]
    DuplicateEnvironment(String),

    #[error("unknown environment {0}")]
    UnknownEnvironment(String),

    #[error("failed to create flag client for {environment}: {source}")]
    ClientCreation {
        environment: String,
        #[source]
        source: FlagClientError,
    },

    #[error("relay is shutting down")]
    NotAccepting,

    #[error("no tokio runtime: {0}")]
    NoRuntime(#[from] TryCurrentError),

    #[error("shutdown task failed: {0}")]
    Shutdown(#[from] JoinError),

    #[error("environments not ready after {timeout:?}: {}", .pending.join(", "))]
    Timeout {
        timeout: Duration,
        pending: Vec<String>,
    },

    #[error("failed to close {} environment(s): {}", .0.len(), join_failures(.0))]
    Close(Vec<CloseFailure>),
}

fn join_failures(failures: &[CloseFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

type Removing = Arc<Mutex<HashMap<EnvironmentId, Arc<EnvironmentContext>>>>;

pub struct Lifecycle {
    registry: Arc<EnvironmentRegistry>,
    factory: Arc<dyn FlagClientFactory>,
    state: Arc<watch::Sender<RelayState>>,
    readiness_tasks: Mutex<HashMap<EnvironmentId, JoinHandle<()>>>,
    // Unregistered environments whose flag client may still be closing
    removing: Removing,
    // Serializes add/remove against the transition to Closing. Never held
    // across an await.
    config_lock: Mutex<()>,
}

impl Lifecycle {
    pub fn new(registry: Arc<EnvironmentRegistry>, factory: Arc<dyn FlagClientFactory>) -> Self {
        let (state, _) = watch::channel(RelayState::Starting);
        Lifecycle {
            registry,
            factory,
            state: Arc::new(state),
            readiness_tasks: Mutex::new(HashMap::new()),
            removing: Arc::new(Mutex::new(HashMap::new())),
            config_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<EnvironmentRegistry> {
        &self.registry
    }

    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    /// Whether environment-scoped requests may still be served.
    pub fn is_accepting(&self) -> bool {
        matches!(self.state(), RelayState::Starting | RelayState::Running)
    }

    /// Running, with every registered environment ready.
    pub fn is_ready(&self) -> bool {
        self.state() == RelayState::Running
            && self
                .registry
                .all_environments()
                .iter()
                .all(|environment| environment.is_ready())
    }

    /// Creates the flag client of a new environment and registers all of its
    /// credentials at once. Fails outside of a tokio runtime.
    pub fn add_environment(
        &self,
        config: &EnvironmentConfig,
    ) -> Result<Arc<EnvironmentContext>, LifecycleError> {
        let runtime = Handle::try_current()?;
        let credentials = config
            .credentials()
            .map_err(|(field, source)| LifecycleError::InvalidCredential {
                environment: config.name.clone(),
                field,
                source,
            })?;
        if credentials.is_empty() {
            return Err(LifecycleError::NoCredentials(config.name.clone()));
        }

        let _guard = self.config_lock.lock();
        if !self.is_accepting() {
            return Err(LifecycleError::NotAccepting);
        }
        if self.registry.find_by_name(&config.name).is_some() {
            return Err(LifecycleError::DuplicateEnvironment(config.name.clone()));
        }
        for credential in credentials.iter() {
            if let Some(existing) = self.registry.lookup(credential) {
                return Err(LifecycleError::DuplicateCredential {
                    environment: config.name.clone(),
                    existing: existing.name().to_string(),
                    credential: credential.masked(),
                });
            }
        }

        let client = self
            .factory
            .create(config)
            .map_err(|source| LifecycleError::ClientCreation {
                environment: config.name.clone(),
                source,
            })?;
        let environment = Arc::new(EnvironmentContext::new(&config.name, credentials, client));
        self.registry.put_all(&environment);

        let task = runtime.spawn(watch_readiness(environment.clone(), self.registry.clone()));
        self.readiness_tasks.lock().insert(environment.id(), task);

        tracing::info!(environment = environment.name(), "Added environment");
        record_environment_gauges(&self.registry);
        Ok(environment)
    }

    /// Unregisters every credential of the environment, then closes its flag
    /// client. The close keeps running if the caller goes away, and a
    /// concurrent [`Lifecycle::close`] waits for it.
    pub async fn remove_environment(&self, name: &str) -> Result<(), LifecycleError> {
        let (environment, task) = {
            let _guard = self.config_lock.lock();
            if !self.is_accepting() {
                return Err(LifecycleError::NotAccepting);
            }
            let environment = self
                .registry
                .find_by_name(name)
                .ok_or_else(|| LifecycleError::UnknownEnvironment(name.to_string()))?;
            self.registry.remove_environment(environment.id());
            self.removing.lock().insert(environment.id(), environment.clone());
            let task = self.readiness_tasks.lock().remove(&environment.id());
            (environment, task)
        };

        if let Some(task) = task {
            task.abort();
        }
        record_environment_gauges(&self.registry);
        tracing::info!(environment = name, "Removed environment");

        let closing = tokio::spawn(close_removed(environment, self.removing.clone()));
        let result = match closing.await {
            Ok(result) => result,
            Err(e) => Err(FlagClientError::Close(e.to_string())),
        };
        result.map_err(|error| {
            tracing::error!(environment = name, error = %error, "Failed to close flag client");
            LifecycleError::Close(vec![CloseFailure {
                environment: name.to_string(),
                error,
            }])
        })
    }

    /// Waits until every registered environment is ready, then moves the relay
    /// to `Running`. Fails with the names of the environments still starting
    /// once `timeout` has elapsed.
    pub async fn wait_for_all_clients(&self, timeout: Duration) -> Result<(), LifecycleError> {
        let environments = self.registry.all_environments();

        let mut waiting = JoinSet::new();
        for environment in &environments {
            let mut rx = environment.subscribe();
            waiting.spawn(async move {
                // Closed environments no longer hold up startup
                let _ = rx
                    .wait_for(|state| *state != EnvironmentState::Starting)
                    .await;
            });
        }

        let all_settled = async { while waiting.join_next().await.is_some() {} };
        if tokio::time::timeout(timeout, all_settled).await.is_err() {
            let pending: Vec<String> = environments
                .iter()
                .filter(|environment| environment.state() == EnvironmentState::Starting)
                .map(|environment| environment.name().to_string())
                .collect();

            if !pending.is_empty() {
                tracing::error!(
                    pending = ?pending,
                    timeout_secs = timeout.as_secs_f64(),
                    "Timed out waiting for environments to become ready"
                );
                return Err(LifecycleError::Timeout { timeout, pending });
            }
        }

        let started = self.state.send_if_modified(|state| {
            if *state == RelayState::Starting {
                *state = RelayState::Running;
                true
            } else {
                false
            }
        });
        if started {
            tracing::info!(environments = environments.len(), "All environments ready");
        }
        Ok(())
    }

    /// Stops accepting work and closes the flag client of every environment
    /// once, including environments still being removed. Failures are
    /// collected, they do not stop the remaining closes.
    ///
    /// The closing runs in its own task, so it completes even if the caller
    /// is cancelled. Calling this again, or concurrently, waits for the first
    /// call to finish and returns `Ok`.
    pub async fn close(&self) -> Result<(), LifecycleError> {
        let environments = {
            let _guard = self.config_lock.lock();
            let first = self.state.send_if_modified(|state| match state {
                RelayState::Starting | RelayState::Running => {
                    *state = RelayState::Closing;
                    true
                }
                RelayState::Closing | RelayState::Closed => false,
            });
            if first {
                for (_, task) in self.readiness_tasks.lock().drain() {
                    task.abort();
                }
                let mut environments = self.registry.teardown();
                environments.extend(self.removing.lock().values().cloned());
                Some(environments)
            } else {
                None
            }
        };

        let Some(environments) = environments else {
            let mut rx = self.state.subscribe();
            let _ = rx.wait_for(|state| *state == RelayState::Closed).await;
            return Ok(());
        };

        tracing::info!(environments = environments.len(), "Closing all environments");
        let teardown = tokio::spawn(close_environments(
            environments,
            self.registry.clone(),
            self.state.clone(),
        ));
        teardown.await?
    }
}

async fn close_environments(
    environments: Vec<Arc<EnvironmentContext>>,
    registry: Arc<EnvironmentRegistry>,
    state: Arc<watch::Sender<RelayState>>,
) -> Result<(), LifecycleError> {
    let mut join_set = JoinSet::new();
    let mut task_environments = HashMap::new();
    for environment in environments {
        let name = environment.name().to_string();
        let abort_handle = join_set.spawn(async move { environment.close().await });
        task_environments.insert(abort_handle.id(), name);
    }

    let mut failures = Vec::new();
    while let Some(join_result) = join_set.join_next_with_id().await {
        let (task_id, result) = match join_result {
            Ok((id, result)) => (id, result),
            Err(e) => (e.id(), Err(FlagClientError::Close(e.to_string()))),
        };
        let environment = task_environments.remove(&task_id).unwrap_or_default();
        if let Err(error) = result {
            tracing::error!(
                environment = %environment,
                error = %error,
                "Failed to close flag client"
            );
            failures.push(CloseFailure { environment, error });
        }
    }

    record_environment_gauges(&registry);
    state.send_replace(RelayState::Closed);

    if failures.is_empty() {
        tracing::info!("All environments closed");
        Ok(())
    } else {
        failures.sort_by(|a, b| a.environment.cmp(&b.environment));
        Err(LifecycleError::Close(failures))
    }
}

async fn close_removed(
    environment: Arc<EnvironmentContext>,
    removing: Removing,
) -> Result<(), FlagClientError> {
    let result = environment.close().await;
    removing.lock().remove(&environment.id());
    result
}

async fn watch_readiness(
    environment: Arc<EnvironmentContext>,
    registry: Arc<EnvironmentRegistry>,
) {
    match environment.wait_client_ready().await {
        Ok(()) => {
            if environment.mark_ready() {
                tracing::info!(environment = environment.name(), "Environment is ready");
                record_environment_gauges(&registry);
            }
        }
        Err(e) => {
            tracing::warn!(
                environment = environment.name(),
                error = %e,
                "Flag client did not become ready"
            );
        }
    }
}

fn record_environment_gauges(registry: &EnvironmentRegistry) {
    let environments = registry.all_environments();
    let ready = environments
        .iter()
        .filter(|environment| environment.is_ready())
        .count();
    gauge!(ENVIRONMENTS_ACTIVE).set(environments.len() as f64);
    gauge!(ENVIRONMENTS_READY).set(ready as f64);
}
