//! encore-server – Bibliotheks-Root
//!
//! Deklariert alle Server-Module und stellt den oeffentlichen Einstiegspunkt
//! fuer Integrationstests bereit.

pub mod config;
pub mod logging;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use config::ServerConfig;
use encore_chat::ChatService;
use encore_db::SqliteDb;
use encore_signaling::{SignalingServer, SignalingState};
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Haelt den laufenden Server-Zustand zusammen
pub struct Server {
    pub config: ServerConfig,
}

/// Server mit geoeffneter Datenbank und gebundenem Listener
pub struct GebundenerServer {
    db: Arc<SqliteDb>,
    state: Arc<SignalingState<SqliteDb>>,
    listener: TcpListener,
    adresse: SocketAddr,
}

impl Server {
    /// Erstellt einen neuen Server aus der gegebenen Konfiguration
    pub fn neu(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Startet alle Subsysteme und laeuft bis Ctrl-C
    pub async fn starten(self) -> Result<()> {
        let gebunden = self.binden().await?;
        gebunden
            .ausfuehren(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(fehler = %e, "Ctrl-C-Handler konnte nicht registriert werden");
                }
            })
            .await
    }

    /// Oeffnet die Datenbank und bindet den TCP-Listener
    ///
    /// Reihenfolge:
    /// 1. Datenbank oeffnen und Migrationen ausfuehren
    /// 2. Mitglieder und Gruppen aus dem Speicher laden, Dispatcher-Zustand
    ///    aufbauen
    /// 3. TCP-Listener binden
    pub async fn binden(self) -> Result<GebundenerServer> {
        tracing::info!(
            server_name = %self.config.server.name,
            tcp = %self.config.tcp_bind_adresse(),
            "Server startet"
        );

        let db = SqliteDb::oeffnen(&self.config.datenbank_config())
            .await
            .with_context(|| format!("Datenbank '{}' nicht nutzbar", self.config.datenbank.url))?;
        let db = Arc::new(db);

        let chat = ChatService::laden(Arc::clone(&db), self.config.chat_config())
            .await
            .context("Gespeicherten Zustand laden fehlgeschlagen")?;
        let state = SignalingState::neu(self.config.dispatcher_config(), chat);

        let listener = TcpListener::bind(self.config.tcp_bind_adresse())
            .await
            .with_context(|| format!("TCP-Bind auf {} fehlgeschlagen", self.config.tcp_bind_adresse()))?;
        let adresse = listener.local_addr()?;

        Ok(GebundenerServer {
            db,
            state,
            listener,
            adresse,
        })
    }
}

impl GebundenerServer {
    /// Tatsaechlich gebundene Adresse (relevant bei Port 0)
    pub fn adresse(&self) -> SocketAddr {
        self.adresse
    }

    pub fn state(&self) -> &Arc<SignalingState<SqliteDb>> {
        &self.state
    }

    /// Bedient Verbindungen bis `shutdown` fertig ist
    ///
    /// Beim Shutdown bekommen alle offenen Verbindungen eine Abschieds-
    /// nachricht, danach wird der Pool geschlossen.
    pub async fn ausfuehren<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = SignalingServer::neu(Arc::clone(&self.state), self.adresse);
        let mut server_task = tokio::spawn(server.bedienen(self.listener, shutdown_rx));

        tracing::info!(adresse = %self.adresse, "Server laeuft. Warte auf Shutdown-Signal");

        tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown-Signal empfangen, Server wird beendet");
                let _ = shutdown_tx.send(true);
                (&mut server_task).await.context("Signaling-Task abgebrochen")??;
            }
            ergebnis = &mut server_task => {
                ergebnis.context("Signaling-Task abgebrochen")??;
            }
        }

        // Verbindungs-Tasks bekommen Zeit fuer ihre Abschiedsnachricht
        tokio::task::yield_now().await;
        self.db.schliessen().await;
        tracing::info!("Server beendet");
        Ok(())
    }
}
