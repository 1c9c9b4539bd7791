//! TCP-Listener – Bindet Socket, akzeptiert Verbindungen
//!
//! Der `SignalingServer` bindet einen TCP-Socket und startet fuer jede
//! eingehende Verbindung einen eigenen tokio-Task mit einer `ClientConnection`.
//!
//! ## Concurrency-Modell
//! Der Speicher-Trait liefert `Send`-Futures, daher laufen die
//! Verbindungs-Tasks auf dem Multi-Thread-Runtime. Gruppen serialisieren
//! sich ueber ihren eigenen Mutex, nicht ueber den Listener.

use std::net::SocketAddr;
use std::sync::Arc;

use encore_db::ChatStore;
use encore_protocol::{ControlMessage, ErrorCode, FrameCodec};
use futures_util::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::codec::Framed;

use crate::connection::ClientConnection;
use crate::error::SignalingError;
use crate::server_state::SignalingState;

/// TCP-Signaling-Server
pub struct SignalingServer<S: ChatStore> {
    state: Arc<SignalingState<S>>,
    bind_addr: SocketAddr,
}

impl<S: ChatStore> SignalingServer<S> {
    /// Erstellt einen neuen SignalingServer
    pub fn neu(state: Arc<SignalingState<S>>, bind_addr: SocketAddr) -> Self {
        Self { state, bind_addr }
    }

    /// Bindet den TCP-Listener und akzeptiert Verbindungen
    ///
    /// Laeuft bis `shutdown_rx` ein `true`-Signal empfaengt.
    pub async fn starten(self, shutdown_rx: watch::Receiver<bool>) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.bedienen(listener, shutdown_rx).await
    }

    /// Accept-Loop auf einem bereits gebundenen Listener
    pub async fn bedienen(
        self,
        listener: TcpListener,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        let lokale_addr = listener.local_addr()?;
        tracing::info!(adresse = %lokale_addr, "TCP Signaling-Server gestartet");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => self.annehmen(stream, peer_addr, &shutdown_rx),
                        Err(e) => {
                            tracing::error!(fehler = %e, "TCP-Accept-Fehler");
                            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        }
                    }
                }

                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Signaling-Server: Shutdown-Signal empfangen");
                        break;
                    }
                }
            }
        }

        tracing::info!("TCP Signaling-Server gestoppt");
        Ok(())
    }

    fn annehmen(&self, stream: TcpStream, peer_addr: SocketAddr, shutdown_rx: &watch::Receiver<bool>) {
        let Some(platz) = self.state.verbindung_belegen() else {
            tracing::warn!(
                peer = %peer_addr,
                max = self.state.config.max_clients,
                "Server voll – Verbindung abgelehnt"
            );
            tokio::spawn(ablehnen(stream));
            return;
        };

        tracing::debug!(peer = %peer_addr, "Verbindung akzeptiert");
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer = %peer_addr, fehler = %e, "TCP_NODELAY nicht gesetzt");
        }

        let verbindung = ClientConnection::neu(Arc::clone(&self.state), peer_addr.to_string());
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let _platz = platz;
            verbindung.verarbeiten(stream, shutdown_rx).await;
        });
    }

    /// Gibt die Bind-Adresse zurueck
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }
}

/// Meldet `ServerFull` und schliesst die Verbindung
async fn ablehnen(stream: TcpStream) {
    let fehler = SignalingError::ServerVoll;
    let mut framed = Framed::new(stream, FrameCodec::<ControlMessage>::new());
    let _ = framed
        .send(ControlMessage::error(0, ErrorCode::ServerFull, fehler.to_string()))
        .await;
}
