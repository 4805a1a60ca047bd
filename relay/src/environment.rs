use crate::credential::Credential;
use crate::flag_client::{FlagClient, FlagClientError, FlagValues};
use crate::user::UserContext;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{OnceCell, watch};

static NEXT_ENVIRONMENT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an environment, independent of its credentials.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnvironmentId(u64);

impl EnvironmentId {
    fn next() -> Self {
        EnvironmentId(NEXT_ENVIRONMENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvironmentState {
    Starting,
    Ready,
    Closed,
}

impl EnvironmentState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            EnvironmentState::Starting => "starting",
            EnvironmentState::Ready => "ready",
            EnvironmentState::Closed => "closed",
        }
    }
}

/// Every credential that resolves to one environment.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EnvironmentCredentials {
    pub server_key: Option<Credential>,
    pub mobile_key: Option<Credential>,
    pub client_side_id: Option<Credential>,
}

impl EnvironmentCredentials {
    pub fn iter(&self) -> impl Iterator<Item = &Credential> {
        [&self.server_key, &self.mobile_key, &self.client_side_id]
            .into_iter()
            .flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

/// The per-tenant unit of the relay.
///
/// Request handling only reads an environment. State transitions and closing
/// the flag client are reserved to the lifecycle coordinator.
pub struct EnvironmentContext {
    id: EnvironmentId,
    name: String,
    credentials: EnvironmentCredentials,
    client: Arc<dyn FlagClient>,
    state: watch::Sender<EnvironmentState>,
    // Stays set after closing, unlike the state
    ever_ready: AtomicBool,
    close_result: OnceCell<Result<(), FlagClientError>>,
}

impl EnvironmentContext {
    pub fn new(
        name: impl Into<String>,
        credentials: EnvironmentCredentials,
        client: Arc<dyn FlagClient>,
    ) -> Self {
        let (state, _) = watch::channel(EnvironmentState::Starting);
        EnvironmentContext {
            id: EnvironmentId::next(),
            name: name.into(),
            credentials,
            client,
            state,
            ever_ready: AtomicBool::new(false),
            close_result: OnceCell::new(),
        }
    }

    pub fn id(&self) -> EnvironmentId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn credentials(&self) -> &EnvironmentCredentials {
        &self.credentials
    }

    pub fn state(&self) -> EnvironmentState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == EnvironmentState::Ready
    }

    /// Whether the environment has been ready at any point of its life.
    pub fn has_been_ready(&self) -> bool {
        self.ever_ready.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> watch::Receiver<EnvironmentState> {
        self.state.subscribe()
    }

    pub async fn all_flags(&self, user: &UserContext) -> Result<FlagValues, FlagClientError> {
        self.client.all_flags(user).await
    }

    pub(crate) async fn wait_client_ready(&self) -> Result<(), FlagClientError> {
        self.client.ready().await
    }

    /// Moves `Starting` to `Ready`. Returns false if the environment was in
    /// any other state, in particular if it has been closed meanwhile.
    pub(crate) fn mark_ready(&self) -> bool {
        let transitioned = self.state.send_if_modified(|state| {
            if *state == EnvironmentState::Starting {
                *state = EnvironmentState::Ready;
                true
            } else {
                false
            }
        });
        if transitioned {
            self.ever_ready.store(true, Ordering::Release);
        }
        transitioned
    }

    /// Closes the flag client. Only the first call reaches the client, later
    /// calls wait for it to finish and share its result.
    pub(crate) async fn close(&self) -> Result<(), FlagClientError> {
        self.state.send_replace(EnvironmentState::Closed);
        self.close_result
            .get_or_init(|| self.client.close())
            .await
            .clone()
    }
}

impl fmt::Debug for EnvironmentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvironmentContext")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("credentials", &self.credentials)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{FakeFlagClient, test_user};
    use std::time::Duration;

    #[tokio::test]
    async fn test_state_transitions() {
        let client = Arc::new(FakeFlagClient::new());
        let environment = EnvironmentContext::new("test", Default::default(), client.clone());
        let mut rx = environment.subscribe();

        assert_eq!(environment.state(), EnvironmentState::Starting);
        assert!(!environment.has_been_ready());

        assert!(environment.mark_ready());
        assert!(!environment.mark_ready(), "already ready");
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), EnvironmentState::Ready);

        environment.close().await.unwrap();
        assert_eq!(environment.state(), EnvironmentState::Closed);
        assert!(environment.has_been_ready());
        assert!(!environment.mark_ready(), "closed environments stay closed");
    }

    #[tokio::test]
    async fn test_close_reaches_client_once() {
        let client = Arc::new(FakeFlagClient::new());
        let environment = EnvironmentContext::new("test", Default::default(), client.clone());

        environment.close().await.unwrap();
        environment.close().await.unwrap();
        assert_eq!(client.close_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_close_waits_for_client() {
        let client = Arc::new(FakeFlagClient::new());
        client.delay_close(Duration::from_millis(50));
        client.fail_close_with("boom");
        let environment = EnvironmentContext::new("test", Default::default(), client.clone());

        let (first, second) = tokio::join!(environment.close(), environment.close());
        assert!(client.close_finished());
        assert_eq!(first, Err(FlagClientError::Close("boom".to_string())));
        assert_eq!(second, first);
        assert_eq!(client.close_count(), 1);
    }

    #[tokio::test]
    async fn test_wait_client_ready() {
        let client = Arc::new(FakeFlagClient::new());
        let environment = EnvironmentContext::new("test", Default::default(), client.clone());

        let wait = tokio::time::timeout(Duration::from_millis(20), environment.wait_client_ready());
        assert!(wait.await.is_err(), "client is not ready yet");

        client.set_ready();
        environment.wait_client_ready().await.unwrap();
        assert!(environment.all_flags(&test_user()).await.is_ok());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = EnvironmentContext::new("a", Default::default(), Arc::new(FakeFlagClient::new()));
        let b = EnvironmentContext::new("a", Default::default(), Arc::new(FakeFlagClient::new()));
        assert_ne!(a.id(), b.id());
    }
}
