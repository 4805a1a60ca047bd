//! Resolves the environment a request is addressed to.
//!
//! Every environment-scoped endpoint runs behind [`Authorizer::dispatch`]:
//! the credential is taken from a header first and, for routes that name an
//! environment in the URL, from a path variable otherwise. The wrapped
//! handler only runs when the credential resolves to a registered
//! environment, and receives that environment as an [`EnvScope`].

use crate::credential::{Credential, CredentialKind};
use crate::environment::EnvironmentContext;
use crate::metrics_defs::AUTH_REJECTED;
use crate::registry::EnvironmentRegistry;
use hyper::header::AUTHORIZATION;
use hyper::{Request, Response, StatusCode};
use shared::counter;
use shared::http::{ResponseBody, make_error_response};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Dedicated header for mobile keys.
pub const MOBILE_KEY_HEADER: &str = "x-mobile-key";

/// Path variables of the matched route, owned so the request can move on.
pub type PathParams = HashMap<String, String>;

pub const SDK_KEY_KINDS: &[CredentialKind] = &[CredentialKind::Server, CredentialKind::Mobile];

/// Where an endpoint looks for its credential.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialSource {
    /// `Authorization` or the mobile key header, restricted to `kinds`.
    Header { kinds: &'static [CredentialKind] },
    /// As `Header` when a header is present. Otherwise the path variable
    /// `param` holds a client-side id naming the environment.
    HeaderOrPath {
        kinds: &'static [CredentialKind],
        param: &'static str,
    },
}

impl CredentialSource {
    fn header_kinds(&self) -> &'static [CredentialKind] {
        match self {
            CredentialSource::Header { kinds } => kinds,
            CredentialSource::HeaderOrPath { kinds, .. } => kinds,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("no credential was supplied")]
    MissingCredential,
    #[error("credential is not recognized")]
    UnknownCredential,
    #[error("no environment matches the requested id")]
    UnknownEnvironment,
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::MissingCredential | AuthError::UnknownCredential => StatusCode::UNAUTHORIZED,
            AuthError::UnknownEnvironment => StatusCode::NOT_FOUND,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            AuthError::MissingCredential => "missing_credential",
            AuthError::UnknownCredential => "unknown_credential",
            AuthError::UnknownEnvironment => "unknown_environment",
        }
    }
}

/// Request-scoped view of the resolved environment. Built fresh for every
/// request and handed to exactly one handler invocation.
#[derive(Debug)]
pub struct EnvScope {
    environment: Arc<EnvironmentContext>,
    credential: Credential,
}

impl EnvScope {
    pub(crate) fn new(environment: Arc<EnvironmentContext>, credential: Credential) -> Self {
        Self {
            environment,
            credential,
        }
    }

    pub fn environment(&self) -> &EnvironmentContext {
        &self.environment
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }
}

#[derive(Clone)]
pub struct Authorizer {
    registry: Arc<EnvironmentRegistry>,
}

impl Authorizer {
    pub fn new(registry: Arc<EnvironmentRegistry>) -> Self {
        Self { registry }
    }

    /// Finds the environment for a request without running any handler.
    pub fn resolve<B>(
        &self,
        req: &Request<B>,
        params: &PathParams,
        source: CredentialSource,
    ) -> Result<EnvScope, AuthError> {
        // A header always wins over the path variable.
        if let Some(header_value) = credential_header(req) {
            let credential = header_value
                .and_then(|value| Credential::from_authorization(value).ok())
                .filter(|credential| source.header_kinds().contains(&credential.kind()))
                .ok_or(AuthError::UnknownCredential)?;

            return self
                .registry
                .lookup(&credential)
                .map(|environment| EnvScope::new(environment, credential))
                .ok_or(AuthError::UnknownCredential);
        }

        let CredentialSource::HeaderOrPath { param, .. } = source else {
            return Err(AuthError::MissingCredential);
        };
        let env_id = params
            .get(param)
            .filter(|value| !value.trim().is_empty())
            .ok_or(AuthError::MissingCredential)?;

        // Malformed ids are reported like unknown ones
        let credential = Credential::parse(env_id)
            .ok()
            .filter(|credential| credential.kind() == CredentialKind::ClientSide)
            .ok_or(AuthError::UnknownEnvironment)?;

        self.registry
            .lookup(&credential)
            .map(|environment| EnvScope::new(environment, credential))
            .ok_or(AuthError::UnknownEnvironment)
    }

    /// Runs `handler` with the resolved environment, or answers 401/404
    /// without running it.
    pub async fn dispatch<B, F, Fut>(
        &self,
        req: Request<B>,
        params: PathParams,
        source: CredentialSource,
        handler: F,
    ) -> Response<ResponseBody>
    where
        F: FnOnce(EnvScope, Request<B>, PathParams) -> Fut,
        Fut: Future<Output = Response<ResponseBody>>,
    {
        match self.resolve(&req, &params, source) {
            Ok(scope) => handler(scope, req, params).await,
            Err(e) => {
                tracing::debug!(
                    method = %req.method(),
                    path = %req.uri().path(),
                    error = %e,
                    "Rejected request"
                );
                counter!(AUTH_REJECTED, "reason" => e.reason()).increment(1);
                make_error_response(e.status())
            }
        }
    }
}

/// The first credential header present, `Authorization` before the mobile
/// key header. `Some(None)` means a header is present but unreadable.
fn credential_header<B>(req: &Request<B>) -> Option<Option<&str>> {
    [AUTHORIZATION.as_str(), MOBILE_KEY_HEADER]
        .into_iter()
        .filter_map(|name| req.headers().get(name))
        .map(|value| value.to_str().ok())
        .find(|value| value.is_none_or(|s| !s.trim().is_empty()))
}
