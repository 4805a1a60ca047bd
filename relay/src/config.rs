use crate::credential::{Credential, CredentialError, CredentialKind};
use crate::environment::EnvironmentCredentials;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_INIT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Empty environment name")]
    EmptyEnvironmentName,

    #[error("Duplicate environment name: {0}")]
    DuplicateEnvironment(String),

    #[error("Environment {0:?} has no credentials")]
    NoCredentials(String),

    #[error("Environment {environment:?} has an invalid {field}: {source}")]
    InvalidCredential {
        environment: String,
        field: &'static str,
        #[source]
        source: CredentialError,
    },

    #[error("Environment {0:?} has a zero reload interval")]
    InvalidReloadInterval(String),

    #[error("Environments {first:?} and {second:?} share the {field}")]
    SharedCredential {
        first: String,
        second: String,
        field: &'static str,
    },
}

/// Relay configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Main listener for flag evaluation requests
    pub listener: Listener,
    /// Admin listener for health and readiness probes
    pub admin_listener: Listener,
    /// How long startup waits for every environment to become ready
    #[serde(default = "default_init_timeout_secs")]
    pub init_timeout_secs: u64,
    /// Upper bound for REPORT request bodies
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default)]
    pub stale_data_policy: StaleDataPolicy,
    pub environments: Vec<EnvironmentConfig>,
}

fn default_init_timeout_secs() -> u64 {
    DEFAULT_INIT_TIMEOUT_SECS
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

impl Config {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    /// Validates the relay configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        let mut names = HashSet::new();
        // credential value -> owning environment
        let mut owners: HashMap<String, &str> = HashMap::new();

        for environment in &self.environments {
            if environment.name.is_empty() {
                return Err(ValidationError::EmptyEnvironmentName);
            }
            if !names.insert(environment.name.as_str()) {
                return Err(ValidationError::DuplicateEnvironment(
                    environment.name.clone(),
                ));
            }

            let credentials = environment
                .credentials()
                .map_err(|(field, source)| ValidationError::InvalidCredential {
                    environment: environment.name.clone(),
                    field,
                    source,
                })?;
            if credentials.is_empty() {
                return Err(ValidationError::NoCredentials(environment.name.clone()));
            }
            environment.data_source.validate(&environment.name)?;

            for credential in credentials.iter() {
                let owner = owners.insert(credential.as_str().to_string(), &environment.name);
                if let Some(first) = owner {
                    return Err(ValidationError::SharedCredential {
                        first: first.to_string(),
                        second: environment.name.clone(),
                        field: field_name(credential.kind()),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    /// Validates the listener configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// What to answer when an environment that has been ready before can no
/// longer refresh its flag data.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StaleDataPolicy {
    /// Serve the last known flag values
    #[default]
    ServeStale,
    /// Answer 503 until the data source recovers
    Fail,
}

/// One tenant environment
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct EnvironmentConfig {
    pub name: String,
    pub server_key: Option<String>,
    pub mobile_key: Option<String>,
    pub client_side_id: Option<String>,
    pub data_source: DataSourceConfig,
}

impl EnvironmentConfig {
    /// Parses the configured credentials, checking each is of the kind its
    /// field promises. On failure returns the offending field name.
    pub fn credentials(&self) -> Result<EnvironmentCredentials, (&'static str, CredentialError)> {
        Ok(EnvironmentCredentials {
            server_key: parse_field(self.server_key.as_deref(), CredentialKind::Server)?,
            mobile_key: parse_field(self.mobile_key.as_deref(), CredentialKind::Mobile)?,
            client_side_id: parse_field(
                self.client_side_id.as_deref(),
                CredentialKind::ClientSide,
            )?,
        })
    }
}

fn parse_field(
    raw: Option<&str>,
    kind: CredentialKind,
) -> Result<Option<Credential>, (&'static str, CredentialError)> {
    let Some(raw) = raw else {
        return Ok(None);
    };

    match Credential::parse(raw) {
        Ok(credential) if credential.kind() == kind => Ok(Some(credential)),
        Ok(_) => Err((field_name(kind), CredentialError::Malformed)),
        Err(e) => Err((field_name(kind), e)),
    }
}

fn field_name(kind: CredentialKind) -> &'static str {
    match kind {
        CredentialKind::Server => "server_key",
        CredentialKind::Mobile => "mobile_key",
        CredentialKind::ClientSide => "client_side_id",
    }
}

/// Where an environment's flag client gets its data from
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum DataSourceConfig {
    /// A JSON object of flag key to value on the local filesystem
    File {
        path: PathBuf,
        /// Re-read the file at this interval. Read once if absent.
        reload_interval_secs: Option<u64>,
    },
}

impl DataSourceConfig {
    fn validate(&self, environment: &str) -> Result<(), ValidationError> {
        match self {
            DataSourceConfig::File {
                reload_interval_secs: Some(0),
                ..
            } => Err(ValidationError::InvalidReloadInterval(
                environment.to_string(),
            )),
            DataSourceConfig::File { .. } => Ok(()),
        }
    }
}
