//! The main listener's HTTP surface.
//!
//! | method | path                                  |
//! |--------|---------------------------------------|
//! | GET    | `/flags/{user}`                       |
//! | REPORT | `/flags`                              |
//! | GET    | `/environments/{env_id}/flags/{user}` |
//! | REPORT | `/environments/{env_id}/flags`        |
//! | GET    | `/status`                             |

use crate::auth::{Authorizer, CredentialSource, PathParams, SDK_KEY_KINDS};
use crate::credential::Credential;
use crate::evaluation::{EvaluationOptions, UserSource, handle_evaluation};
use crate::lifecycle::Lifecycle;
use crate::metrics_defs::{REQUESTS, REQUEST_DURATION};
use http::method::InvalidMethod;
use hyper::body::{Body, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use routing::{Resolution, Route, RouteTable};
use serde::Serialize;
use shared::http::{ResponseBody, make_error_response, make_json_response};
use shared::{counter, histogram};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::error::Error;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

pub const ENV_ID_PARAM: &str = "env_id";

const HEADER_CREDENTIALS: CredentialSource = CredentialSource::Header {
    kinds: SDK_KEY_KINDS,
};
const ENVIRONMENT_CREDENTIALS: CredentialSource = CredentialSource::HeaderOrPath {
    kinds: SDK_KEY_KINDS,
    param: ENV_ID_PARAM,
};

#[derive(Clone, Copy, Debug)]
enum Endpoint {
    Evaluate {
        credentials: CredentialSource,
        user: UserSource,
    },
    Status,
}

#[derive(Clone, Copy, Debug)]
struct RouteAction {
    // Metric tag
    name: &'static str,
    endpoint: Endpoint,
}

fn route_table() -> Result<RouteTable<RouteAction>, InvalidMethod> {
    let report = Method::from_bytes(b"REPORT")?;
    let evaluate = |name, credentials, user| RouteAction {
        name,
        endpoint: Endpoint::Evaluate { credentials, user },
    };

    Ok(RouteTable::new(vec![
        Route::new(
            Method::GET,
            "/flags/{user}",
            evaluate("flags", HEADER_CREDENTIALS, UserSource::PathSegment),
        ),
        Route::new(
            report.clone(),
            "/flags",
            evaluate("flags_report", HEADER_CREDENTIALS, UserSource::JsonBody),
        ),
        Route::new(
            Method::GET,
            "/environments/{env_id}/flags/{user}",
            evaluate(
                "environment_flags",
                ENVIRONMENT_CREDENTIALS,
                UserSource::PathSegment,
            ),
        ),
        Route::new(
            report,
            "/environments/{env_id}/flags",
            evaluate(
                "environment_flags_report",
                ENVIRONMENT_CREDENTIALS,
                UserSource::JsonBody,
            ),
        ),
        Route::new(
            Method::GET,
            "/status",
            RouteAction {
                name: "status",
                endpoint: Endpoint::Status,
            },
        ),
    ]))
}

struct Inner {
    routes: RouteTable<RouteAction>,
    authorizer: Authorizer,
    lifecycle: Arc<Lifecycle>,
    options: EvaluationOptions,
}

#[derive(Clone)]
pub struct RelayService {
    inner: Arc<Inner>,
}

impl RelayService {
    pub fn new(
        lifecycle: Arc<Lifecycle>,
        options: EvaluationOptions,
    ) -> Result<Self, InvalidMethod> {
        Ok(RelayService {
            inner: Arc::new(Inner {
                routes: route_table()?,
                authorizer: Authorizer::new(lifecycle.registry().clone()),
                lifecycle,
                options,
            }),
        })
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Response<ResponseBody>
    where
        B: Body,
        B::Error: Into<Box<dyn Error + Send + Sync>>,
    {
        let start = Instant::now();
        let path = req.uri().path().to_string();

        let (route, response) = match self.inner.routes.resolve(req.method(), &path) {
            Resolution::Matched(route_match) => {
                let action = *route_match.action;
                let params: PathParams = route_match
                    .params
                    .into_iter()
                    .map(|(name, value)| (name, value.to_string()))
                    .collect();
                (action.name, self.run(action.endpoint, req, params).await)
            }
            Resolution::MethodNotAllowed => (
                "unmatched",
                make_error_response(StatusCode::METHOD_NOT_ALLOWED),
            ),
            Resolution::NotFound => ("unmatched", make_error_response(StatusCode::NOT_FOUND)),
        };

        counter!(REQUESTS, "route" => route, "status" => response.status().as_str().to_string())
            .increment(1);
        histogram!(REQUEST_DURATION, "route" => route).record(start.elapsed().as_secs_f64());
        response
    }

    async fn run<B>(
        &self,
        endpoint: Endpoint,
        req: Request<B>,
        params: PathParams,
    ) -> Response<ResponseBody>
    where
        B: Body,
        B::Error: Into<Box<dyn Error + Send + Sync>>,
    {
        match endpoint {
            Endpoint::Status => self.status(),
            Endpoint::Evaluate { credentials, user } => {
                if !self.inner.lifecycle.is_accepting() {
                    return make_error_response(StatusCode::SERVICE_UNAVAILABLE);
                }

                let options = self.inner.options;
                self.inner
                    .authorizer
                    .dispatch(req, params, credentials, move |scope, req, params| {
                        handle_evaluation(scope, req, params, user, options)
                    })
                    .await
            }
        }
    }

    fn status(&self) -> Response<ResponseBody> {
        let environments = self.inner.lifecycle.registry().all_environments();
        let report = StatusReport {
            state: self.inner.lifecycle.state().as_str(),
            environments: environments
                .iter()
                .map(|environment| {
                    let credentials = environment.credentials();
                    (
                        environment.name(),
                        EnvironmentStatus {
                            state: environment.state().as_str(),
                            server_key: credentials.server_key.as_ref().map(Credential::masked),
                            mobile_key: credentials.mobile_key.as_ref().map(Credential::masked),
                            client_side_id: credentials
                                .client_side_id
                                .as_ref()
                                .map(Credential::masked),
                        },
                    )
                })
                .collect(),
        };

        match serde_json::to_vec(&report) {
            Ok(json) => make_json_response(StatusCode::OK, json),
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize status report");
                make_error_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

#[derive(Serialize)]
struct StatusReport<'a> {
    state: &'static str,
    environments: BTreeMap<&'a str, EnvironmentStatus>,
}

#[derive(Serialize)]
struct EnvironmentStatus {
    state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    server_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mobile_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_side_id: Option<String>,
}

impl Service<Request<Incoming>> for RelayService {
    type Response = Response<ResponseBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.handle(req).await) })
    }
}
