//! Evaluation of all flags for one user.
//!
//! GET requests carry the user in the `{user}` path segment, REPORT requests
//! carry it as a JSON body. Once decoded, both are evaluated the same way
//! against the environment resolved by the auth middleware.

use crate::auth::{EnvScope, PathParams};
use crate::config::StaleDataPolicy;
use crate::flag_client::FlagClientError;
use crate::metrics_defs::STALE_EVALUATIONS;
use crate::user::{UserContext, UserDecodeError, decode_from_body, decode_from_path};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{CONTENT_TYPE, HeaderMap};
use hyper::{Request, Response, StatusCode};
use shared::counter;
use shared::http::{ResponseBody, make_error_response, make_json_response};
use std::error::Error;

/// Path variable holding the base64 encoded user.
pub const USER_PARAM: &str = "user";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserSource {
    PathSegment,
    JsonBody,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EvaluationOptions {
    pub max_body_bytes: usize,
    pub stale_data_policy: StaleDataPolicy,
}

#[derive(thiserror::Error, Debug)]
pub enum EvaluationError {
    #[error("invalid user: {0}")]
    InvalidUser(#[from] UserDecodeError),

    #[error("request has no user segment")]
    MissingUser,

    #[error("REPORT requests must have a JSON body")]
    UnsupportedContentType,

    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("failed to read request body: {0}")]
    BodyRead(String),
}

impl EvaluationError {
    pub fn status(&self) -> StatusCode {
        match self {
            EvaluationError::InvalidUser(_)
            | EvaluationError::MissingUser
            | EvaluationError::BodyRead(_) => StatusCode::BAD_REQUEST,
            EvaluationError::UnsupportedContentType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            EvaluationError::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }
}

/// Decodes the user of an evaluation request.
pub async fn read_user<B>(
    req: Request<B>,
    params: &PathParams,
    source: UserSource,
    max_body_bytes: usize,
) -> Result<UserContext, EvaluationError>
where
    B: Body,
    B::Error: Into<Box<dyn Error + Send + Sync>>,
{
    match source {
        UserSource::PathSegment => {
            let segment = params.get(USER_PARAM).ok_or(EvaluationError::MissingUser)?;
            Ok(decode_from_path(segment)?)
        }
        UserSource::JsonBody => {
            if !is_json(req.headers()) {
                return Err(EvaluationError::UnsupportedContentType);
            }

            let bytes = Limited::new(req.into_body(), max_body_bytes)
                .collect()
                .await
                .map_err(|e| {
                    if e.downcast_ref::<LengthLimitError>().is_some() {
                        EvaluationError::BodyTooLarge(max_body_bytes)
                    } else {
                        EvaluationError::BodyRead(e.to_string())
                    }
                })?
                .to_bytes();

            Ok(decode_from_body(&bytes)?)
        }
    }
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|media_type| media_type.trim().eq_ignore_ascii_case("application/json"))
}

/// Evaluates every flag of the scoped environment for `user` and answers
/// with a JSON object sorted by flag key.
pub async fn evaluate_all_flags(
    scope: &EnvScope,
    user: &UserContext,
    policy: StaleDataPolicy,
) -> Response<ResponseBody> {
    let environment = scope.environment();

    let values = match environment.all_flags(user).await {
        Ok(values) => values,
        Err(FlagClientError::Unavailable {
            reason,
            last_known: Some(values),
        }) if policy == StaleDataPolicy::ServeStale && environment.has_been_ready() => {
            tracing::warn!(
                environment = environment.name(),
                reason = %reason,
                "Serving last known flag values"
            );
            counter!(STALE_EVALUATIONS).increment(1);
            values
        }
        Err(e) => {
            tracing::warn!(
                environment = environment.name(),
                error = %e,
                "Flag evaluation failed"
            );
            return make_error_response(StatusCode::SERVICE_UNAVAILABLE);
        }
    };

    match serde_json::to_vec(&values) {
        Ok(json) => make_json_response(StatusCode::OK, json),
        Err(e) => {
            tracing::error!(
                environment = environment.name(),
                error = %e,
                "Failed to serialize flag values"
            );
            make_error_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// The handler wrapped by the auth middleware on evaluation routes.
pub async fn handle_evaluation<B>(
    scope: EnvScope,
    req: Request<B>,
    params: PathParams,
    source: UserSource,
    options: EvaluationOptions,
) -> Response<ResponseBody>
where
    B: Body,
    B::Error: Into<Box<dyn Error + Send + Sync>>,
{
    let user = match read_user(req, &params, source, options.max_body_bytes).await {
        Ok(user) => user,
        Err(e) => {
            tracing::debug!(
                environment = scope.environment().name(),
                error = %e,
                "Rejected evaluation request"
            );
            return make_error_response(e.status());
        }
    };

    evaluate_all_flags(&scope, &user, options.stale_data_policy).await
}
