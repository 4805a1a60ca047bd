//! The per-environment flag client capability.
//!
//! The routing core never talks to an upstream itself. Every environment owns
//! a [`FlagClient`] which evaluates flags and reports its own readiness; how
//! it acquires flag data (streaming, polling, a local file) is its own
//! business.

use crate::config::EnvironmentConfig;
use crate::user::UserContext;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Flag key to evaluated value. Ordered, so serializing it yields sorted keys.
pub type FlagValues = BTreeMap<String, Value>;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FlagClientError {
    #[error("flag client has not received any flag data yet")]
    NotInitialized,

    /// The data source is failing. `last_known` holds the most recent
    /// successful evaluation result, if the client has one.
    #[error("flag data source is unavailable: {reason}")]
    Unavailable {
        reason: String,
        last_known: Option<FlagValues>,
    },

    #[error("flag client is closed")]
    Closed,

    #[error("flag client could not be created: {0}")]
    Configuration(String),

    #[error("flag client failed to shut down: {0}")]
    Close(String),
}

#[async_trait]
pub trait FlagClient: Send + Sync {
    /// Evaluates every flag for `user`.
    async fn all_flags(&self, user: &UserContext) -> Result<FlagValues, FlagClientError>;

    /// Resolves once the client has received its first complete data set.
    async fn ready(&self) -> Result<(), FlagClientError>;

    /// Releases the client's resources. Called exactly once per client.
    async fn close(&self) -> Result<(), FlagClientError>;
}

/// Builds the flag client for a newly configured environment.
pub trait FlagClientFactory: Send + Sync {
    fn create(&self, config: &EnvironmentConfig) -> Result<Arc<dyn FlagClient>, FlagClientError>;
}
