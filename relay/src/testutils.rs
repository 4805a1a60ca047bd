use crate::config::{DataSourceConfig, EnvironmentConfig};
use crate::environment::EnvironmentContext;
use crate::flag_client::{FlagClient, FlagClientError, FlagClientFactory, FlagValues};
use crate::user::{UserContext, decode_from_body};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;

pub const SERVER_KEY: &str = "sdk-11111111-1111-4111-a111-111111111111";
pub const MOBILE_KEY: &str = "mob-ffffffff-ffff-4fff-afff-ffffffffffff";
pub const CLIENT_SIDE_ID: &str = "0123456789abcdef01234567";

/// base64 of `{"key":"test"}`
pub const USER_SEGMENT: &str = "eyJrZXkiOiJ0ZXN0In0=";

pub fn test_user() -> UserContext {
    decode_from_body(br#"{"key":"test"}"#).unwrap()
}

pub fn test_flag_values() -> FlagValues {
    FlagValues::from([
        ("some-flag-key".to_string(), json!(true)),
        ("another-flag-key".to_string(), json!(3)),
    ])
}

/// Flag client double. Panics if closed more than once.
pub struct FakeFlagClient {
    values: FlagValues,
    ready: watch::Sender<bool>,
    failure: Mutex<Option<FlagClientError>>,
    close_error: Mutex<Option<String>>,
    close_delay: Mutex<Option<Duration>>,
    closes: AtomicUsize,
    close_finished: AtomicBool,
}

impl FakeFlagClient {
    pub fn new() -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            values: test_flag_values(),
            ready,
            failure: Mutex::new(None),
            close_error: Mutex::new(None),
            close_delay: Mutex::new(None),
            closes: AtomicUsize::new(0),
            close_finished: AtomicBool::new(false),
        }
    }

    pub fn set_ready(&self) {
        self.ready.send_replace(true);
    }

    /// Makes every following `all_flags` call fail with `error`.
    pub fn fail_with(&self, error: FlagClientError) {
        *self.failure.lock() = Some(error);
    }

    pub fn fail_close_with(&self, reason: &str) {
        *self.close_error.lock() = Some(reason.to_string());
    }

    /// Makes `close` take `delay` before it returns.
    pub fn delay_close(&self, delay: Duration) {
        *self.close_delay.lock() = Some(delay);
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Whether a `close` call has run to completion.
    pub fn close_finished(&self) -> bool {
        self.close_finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FlagClient for FakeFlagClient {
    async fn all_flags(&self, _user: &UserContext) -> Result<FlagValues, FlagClientError> {
        let failure = self.failure.lock().clone();
        match failure {
            Some(error) => Err(error),
            None => Ok(self.values.clone()),
        }
    }

    async fn ready(&self) -> Result<(), FlagClientError> {
        let mut rx = self.ready.subscribe();
        rx.wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .map_err(|_| FlagClientError::Closed)
    }

    async fn close(&self) -> Result<(), FlagClientError> {
        let previous = self.closes.fetch_add(1, Ordering::SeqCst);
        assert_eq!(previous, 0, "flag client closed more than once");

        let close_delay = *self.close_delay.lock();
        if let Some(delay) = close_delay {
            tokio::time::sleep(delay).await;
        }
        self.close_finished.store(true, Ordering::SeqCst);

        let close_error = self.close_error.lock().clone();
        match close_error {
            Some(reason) => Err(FlagClientError::Close(reason)),
            None => Ok(()),
        }
    }
}

/// Hands out one `FakeFlagClient` per environment name and keeps them for
/// inspection.
pub struct FakeFactory {
    ready_immediately: bool,
    clients: Mutex<HashMap<String, Arc<FakeFlagClient>>>,
}

impl FakeFactory {
    pub fn new(ready_immediately: bool) -> Self {
        Self {
            ready_immediately,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn client(&self, environment: &str) -> Arc<FakeFlagClient> {
        self.clients
            .lock()
            .get(environment)
            .cloned()
            .expect("no client was created for this environment")
    }
}

impl FlagClientFactory for FakeFactory {
    fn create(&self, config: &EnvironmentConfig) -> Result<Arc<dyn FlagClient>, FlagClientError> {
        let client = Arc::new(FakeFlagClient::new());
        if self.ready_immediately {
            client.set_ready();
        }
        self.clients
            .lock()
            .insert(config.name.clone(), client.clone());
        Ok(client)
    }
}

pub fn environment_config(
    name: &str,
    server_key: Option<&str>,
    mobile_key: Option<&str>,
    client_side_id: Option<&str>,
) -> EnvironmentConfig {
    EnvironmentConfig {
        name: name.to_string(),
        server_key: server_key.map(str::to_string),
        mobile_key: mobile_key.map(str::to_string),
        client_side_id: client_side_id.map(str::to_string),
        data_source: DataSourceConfig::File {
            path: format!("/var/lib/relay/{name}.json").into(),
            reload_interval_secs: None,
        },
    }
}

/// An environment reachable through all three test credentials.
pub fn test_environment(name: &str) -> (Arc<EnvironmentContext>, Arc<FakeFlagClient>) {
    let client = Arc::new(FakeFlagClient::new());
    let config = environment_config(name, Some(SERVER_KEY), Some(MOBILE_KEY), Some(CLIENT_SIDE_ID));
    let credentials = config.credentials().unwrap();
    let environment = Arc::new(EnvironmentContext::new(name, credentials, client.clone()));
    (environment, client)
}
