use crate::http::{ResponseBody, full_body, make_error_response};
use hyper::body::Incoming;
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

type ReadinessProbe = Arc<dyn Fn() -> bool + Send + Sync>;

/// Liveness and readiness endpoints for the admin listener.
///
/// `/health` always succeeds once the process is serving. `/ready` asks the
/// probe on every request so that orchestrators stop routing traffic as soon
/// as the relay starts shutting down.
#[derive(Clone)]
pub struct AdminService {
    is_ready: ReadinessProbe,
}

impl AdminService {
    pub fn new<F>(is_ready: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            is_ready: Arc::new(is_ready),
        }
    }

    pub fn respond(&self, path: &str) -> Response<ResponseBody> {
        match path {
            "/health" => Response::new(full_body("ok\n")),
            "/ready" if (self.is_ready)() => Response::new(full_body("ok\n")),
            "/ready" => make_error_response(StatusCode::SERVICE_UNAVAILABLE),
            _ => make_error_response(StatusCode::NOT_FOUND),
        }
    }
}

impl Service<Request<Incoming>> for AdminService {
    type Response = Response<ResponseBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let response = self.respond(req.uri().path());
        Box::pin(async move { Ok(response) })
    }
}
