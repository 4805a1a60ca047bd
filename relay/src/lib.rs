//! Multi-environment feature flag relay.
//!
//! Requests are routed to one of many environments by the credential they
//! carry, and answered with every flag evaluated for the user they describe.

pub mod auth;
pub mod config;
pub mod credential;
pub mod environment;
pub mod evaluation;
pub mod file_source;
pub mod flag_client;
pub mod lifecycle;
pub mod metrics_defs;
pub mod registry;
pub mod service;
pub mod user;

#[cfg(test)]
mod testutils;

use crate::config::{Config, ValidationError};
use crate::evaluation::EvaluationOptions;
use crate::flag_client::FlagClientFactory;
use crate::lifecycle::{Lifecycle, LifecycleError};
use crate::registry::EnvironmentRegistry;
use crate::service::RelayService;
use http::method::InvalidMethod;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::future::Future;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("invalid route: {0}")]
    Route(#[from] InvalidMethod),
}

/// Starts every configured environment, waits for all of them to become
/// ready and serves the main and admin listeners until `shutdown` resolves.
/// Every flag client is closed before returning, also on failure.
pub async fn run<F>(
    config: Config,
    factory: Arc<dyn FlagClientFactory>,
    shutdown: F,
) -> Result<(), RelayError>
where
    F: Future<Output = ()>,
{
    config.validate()?;

    let lifecycle = Arc::new(Lifecycle::new(Arc::new(EnvironmentRegistry::new()), factory));

    if let Err(e) = start(&lifecycle, &config).await {
        if let Err(close_error) = lifecycle.close().await {
            tracing::error!(
                error = %close_error,
                "Failed to close environments after startup failure"
            );
        }
        return Err(e);
    }

    let served = serve(&lifecycle, &config, shutdown).await;
    let closed = lifecycle.close().await;
    served?;
    closed?;
    Ok(())
}

async fn start(lifecycle: &Lifecycle, config: &Config) -> Result<(), RelayError> {
    for environment in &config.environments {
        lifecycle.add_environment(environment)?;
    }
    lifecycle.wait_for_all_clients(config.init_timeout()).await?;
    Ok(())
}

async fn serve<F>(
    lifecycle: &Arc<Lifecycle>,
    config: &Config,
    shutdown: F,
) -> Result<(), RelayError>
where
    F: Future<Output = ()>,
{
    let relay_service = RelayService::new(
        lifecycle.clone(),
        EvaluationOptions {
            max_body_bytes: config.max_body_bytes,
            stale_data_policy: config.stale_data_policy,
        },
    )?;
    let admin_service = AdminService::new({
        let lifecycle = lifecycle.clone();
        move || lifecycle.is_ready()
    });

    let listeners = async {
        tokio::try_join!(
            run_http_service(&config.listener.host, config.listener.port, relay_service),
            run_http_service(
                &config.admin_listener.host,
                config.admin_listener.port,
                admin_service
            ),
        )
    };

    tokio::select! {
        result = listeners => {
            result?;
            Ok(())
        }
        _ = shutdown => {
            tracing::info!("Shutdown requested");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Listener, StaleDataPolicy};
    use crate::testutils::{
        CLIENT_SIDE_ID, FakeFactory, MOBILE_KEY, SERVER_KEY, USER_SEGMENT, environment_config,
    };
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn test_config(init_timeout_secs: u64) -> Config {
        Config {
            listener: Listener {
                host: "127.0.0.1".to_string(),
                port: free_port(),
            },
            admin_listener: Listener {
                host: "127.0.0.1".to_string(),
                port: free_port(),
            },
            init_timeout_secs,
            max_body_bytes: 1024,
            stale_data_policy: StaleDataPolicy::ServeStale,
            environments: vec![environment_config(
                "production",
                Some(SERVER_KEY),
                Some(MOBILE_KEY),
                Some(CLIENT_SIDE_ID),
            )],
        }
    }

    async fn http_get(port: u16, path: &str, headers: &[(&str, &str)]) -> String {
        let mut stream = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match TcpStream::connect(("127.0.0.1", port)).await {
                    Ok(stream) => break stream,
                    Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
                }
            }
        })
        .await
        .unwrap();

        let mut request =
            format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n");
        for (name, value) in headers {
            request.push_str(&format!("{name}: {value}\r\n"));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_run_serves_until_shutdown() {
        let config = test_config(5);
        let port = config.listener.port;
        let admin_port = config.admin_listener.port;
        let factory = Arc::new(FakeFactory::new(true));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let relay = tokio::spawn(run(config, factory.clone(), async {
            let _ = shutdown_rx.await;
        }));

        let response = http_get(
            port,
            &format!("/flags/{USER_SEGMENT}"),
            &[("Authorization", SERVER_KEY)],
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(
            response.ends_with(r#"{"another-flag-key":3,"some-flag-key":true}"#),
            "{response}"
        );

        let response = http_get(admin_port, "/ready", &[]).await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");

        shutdown_tx.send(()).unwrap();
        relay.await.unwrap().unwrap();
        assert_eq!(factory.client("production").close_count(), 1);
    }

    #[tokio::test]
    async fn test_run_fails_when_environments_never_become_ready() {
        let factory = Arc::new(FakeFactory::new(false));

        let err = run(test_config(0), factory.clone(), std::future::pending())
            .await
            .unwrap_err();
        match err {
            RelayError::Lifecycle(LifecycleError::Timeout { pending, .. }) => {
                assert_eq!(pending, vec!["production"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(factory.client("production").close_count(), 1);
    }

    #[tokio::test]
    async fn test_run_rejects_invalid_config() {
        let mut config = test_config(5);
        config.environments.push(environment_config(
            "production",
            Some("sdk-22222222-2222-4222-a222-222222222222"),
            None,
            None,
        ));

        let err = run(config, Arc::new(FakeFactory::new(true)), std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RelayError::Validation(ValidationError::DuplicateEnvironment(_))
        ));
    }
}
