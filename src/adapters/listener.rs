use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use axum::serve::Listener;
use tokio::time::sleep;

use crate::utils::{AdmissionGate, AdmittedConnection, GateError};

/// Exposes an [`AdmissionGate`] to `axum::serve`.
///
/// Denied admissions and transient accept errors are logged and retried.
/// Once the gate is closed the listener never yields again, which leaves the
/// serve loop parked until its graceful-shutdown signal fires.
pub struct GateListener {
    gate: Arc<AdmissionGate>,
}

impl GateListener {
    pub fn new(gate: Arc<AdmissionGate>) -> Self {
        Self { gate }
    }
}

impl Listener for GateListener {
    type Io = AdmittedConnection;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.gate.accept().await {
                Ok(conn) => {
                    let addr = conn.peer_addr();
                    return (conn, addr);
                }
                Err(GateError::ListenerClosed) => std::future::pending().await,
                Err(GateError::AdmissionDenied(waited)) => {
                    tracing::debug!("Admission still denied after {:?}, retrying", waited);
                }
                Err(e) => {
                    tracing::debug!("Accept error: {}", e);
                    if !is_connection_error(&e) {
                        // Likely fd exhaustion; back off instead of spinning.
                        sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.gate.local_addr())
    }
}

fn is_connection_error(e: &GateError) -> bool {
    match e {
        GateError::Accept(e) => matches!(
            e.kind(),
            io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::ConnectionReset
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpStream;

    use super::*;
    use crate::utils::AdmissionGateConfig;

    #[tokio::test]
    async fn test_accept_yields_admitted_connection() {
        let gate = Arc::new(
            AdmissionGate::bind("127.0.0.1:0", AdmissionGateConfig::new(2))
                .await
                .unwrap(),
        );
        let mut listener = GateListener::new(gate.clone());
        assert_eq!(listener.local_addr().unwrap(), gate.local_addr());

        let client = TcpStream::connect(gate.local_addr()).await.unwrap();
        let (conn, addr) = listener.accept().await;

        assert_eq!(addr, client.local_addr().unwrap());
        assert_eq!(gate.in_use(), 1);
        drop(conn);
        assert_eq!(gate.in_use(), 0);
    }

    #[tokio::test]
    async fn test_closed_gate_parks_accept() {
        let gate = Arc::new(
            AdmissionGate::bind("127.0.0.1:0", AdmissionGateConfig::new(2))
                .await
                .unwrap(),
        );
        let mut listener = GateListener::new(gate.clone());
        gate.close();

        let parked = tokio::time::timeout(Duration::from_millis(50), listener.accept()).await;
        assert!(parked.is_err());
    }
}
