use std::sync::Arc;

use error_stack::Report;
use poem::get;
use poem::listener::Listener;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::errors::ApiError;
use super::handlers::healthz;
use super::handlers::readyz;
use crate::controllers::SharedState;

pub const DEFAULT_HEALTH_ADDR: &str = "0.0.0.0:8081";

/// HTTP server exposing liveness and readiness probes
pub struct HealthServer {
    shared: Arc<SharedState>,
    listen_addr: String,
}

fn routes(shared: Arc<SharedState>) -> impl Endpoint {
    Route::new()
        .at("/healthz", get(healthz))
        .at("/readyz", get(readyz))
        .data(shared)
        .with(Tracing)
}

impl HealthServer {
    pub fn new(shared: Arc<SharedState>, listen_addr: String) -> Self {
        Self {
            shared,
            listen_addr,
        }
    }

    /// Serves until `cancellation_token` is cancelled.
    ///
    /// # Errors
    ///
    /// - [`ApiError::Bind`] if the listen address cannot be bound
    /// - [`ApiError::Serve`] if the server stops on its own
    pub async fn run(self, cancellation_token: CancellationToken) -> Result<(), Report<ApiError>> {
        let acceptor = TcpListener::bind(&self.listen_addr)
            .into_acceptor()
            .await
            .map_err(|e| {
                Report::new(ApiError::Bind {
                    addr: self.listen_addr.clone(),
                    message: e.to_string(),
                })
            })?;
        info!("Health server listening on {}", self.listen_addr);
        let server = Server::new_with_acceptor(acceptor);

        tokio::select! {
            result = server.run(routes(self.shared)) => {
                error!("Health server stopped unexpectedly: {result:?}");
                Err(Report::new(ApiError::Serve {
                    message: match result {
                        Ok(()) => "listener closed".to_string(),
                        Err(e) => e.to_string(),
                    },
                }))
            }
            _ = cancellation_token.cancelled() => {
                info!("Health server shutdown requested");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use poem::http::StatusCode;
    use poem::test::TestClient;
    use test_log::test;

    use super::*;

    #[test(tokio::test)]
    async fn healthz_is_always_ok() {
        let client = TestClient::new(routes(Arc::new(SharedState::new())));
        let response = client.get("/healthz").send().await;
        response.assert_status_is_ok();
        response.assert_text("ok").await;
    }

    #[test(tokio::test)]
    async fn readyz_waits_for_first_report() {
        let shared = Arc::new(SharedState::new());
        let client = TestClient::new(routes(shared.clone()));

        client
            .get("/readyz")
            .send()
            .await
            .assert_status(StatusCode::SERVICE_UNAVAILABLE);

        shared.mark_ready();
        client.get("/readyz").send().await.assert_status_is_ok();
    }

    #[test(tokio::test)]
    async fn occupied_address_is_a_bind_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap().to_string();

        let server = HealthServer::new(Arc::new(SharedState::new()), addr.clone());
        let err = server.run(CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err.current_context(), ApiError::Bind { addr: a, .. } if *a == addr));
        assert!(err
            .current_context()
            .to_string()
            .starts_with(&format!("Unable to listen on {addr}: ")));
    }

    #[test(tokio::test)]
    async fn cancelled_server_stops_cleanly() {
        let server = HealthServer::new(Arc::new(SharedState::new()), "127.0.0.1:0".to_string());
        let token = CancellationToken::new();
        token.cancel();
        server.run(token).await.unwrap();
    }
}
