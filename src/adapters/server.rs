use std::{future::Future, io, sync::Arc};

use axum::Router;
use eyre::Result;
use tokio::sync::mpsc;

use crate::{
    adapters::{HttpHandler, listener::GateListener},
    config::ServerConfig,
    ports::http_client::HttpClient,
    utils::{AdmissionGate, ShutdownCoordinator, ShutdownReport},
};

/// Composition root for the serving side: runs the router behind an
/// [`AdmissionGate`] and hands lifecycle control to a
/// [`ShutdownCoordinator`].
pub struct GatewayServer {
    router: Router,
}

impl GatewayServer {
    pub fn new(router: Router) -> Self {
        Self { router }
    }

    /// Wire the fetch endpoint for `config` on top of `http_client`.
    pub fn from_config(config: &ServerConfig, http_client: Arc<dyn HttpClient>) -> Result<Self> {
        let handler = Arc::new(HttpHandler::from_config(config, http_client)?);
        Ok(Self::new(handler.router()))
    }

    /// Serve until `stop` resolves or the server fails, then shut down.
    ///
    /// Returns once the coordinator has reached `Stopped`. Connections that
    /// are still open at that point are left for [`AdmissionGate::wait`].
    pub async fn run<S>(
        self,
        gate: Arc<AdmissionGate>,
        coordinator: &ShutdownCoordinator,
        stop: S,
    ) -> ShutdownReport
    where
        S: Future<Output = ()>,
    {
        let (error_tx, error_rx) = mpsc::channel::<io::Error>(1);
        let serve_token = coordinator.serve_token();
        let listener = GateListener::new(gate.clone());
        let router = self.router;

        tracing::info!("fetchgate listening on {}", gate.local_addr());

        let server = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(serve_token.cancelled_owned())
                .await;
            if let Err(e) = result {
                let _ = error_tx.send(e).await;
            }
        });

        let server_done = async move {
            if let Err(e) = server.await {
                tracing::error!("Server task failed: {}", e);
            }
        };

        coordinator.run(stop, error_rx, &gate, server_done).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::routing::get;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
        sync::oneshot,
    };

    use super::*;
    use crate::utils::{AdmissionGateConfig, ShutdownCause, ShutdownState};

    #[tokio::test]
    async fn test_serves_until_stopped() {
        let gate = Arc::new(
            AdmissionGate::bind("127.0.0.1:0", AdmissionGateConfig::new(4))
                .await
                .unwrap(),
        );
        let addr = gate.local_addr();
        let coordinator = Arc::new(ShutdownCoordinator::with_timeout(Duration::from_secs(2)));
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let server = GatewayServer::new(Router::new().route("/", get(|| async { "pong" })));
        let running = {
            let gate = gate.clone();
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                server
                    .run(gate, &coordinator, async move {
                        let _ = stop_rx.await;
                    })
                    .await
            })
        };

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("pong"));

        stop_tx.send(()).unwrap();
        let report = running.await.unwrap();

        assert_eq!(report.cause, ShutdownCause::StopRequested);
        assert!(report.error.is_none());
        assert_eq!(coordinator.state(), ShutdownState::Stopped);
        assert!(gate.is_closed());
        tokio::time::timeout(Duration::from_secs(1), gate.wait())
            .await
            .unwrap();
    }
}
