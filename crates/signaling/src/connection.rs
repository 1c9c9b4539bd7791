//! Client-Connection – Verwaltet eine einzelne Verbindung
//!
//! Jede Verbindung bekommt eine `ClientConnection` in einem eigenen
//! tokio-Task. Gelesen und geschrieben wird ueber den `FrameCodec`.
//!
//! ## Ablauf
//! ```text
//! Verbunden --Hello--> Angemeldet (Push-Queue beim Broadcaster registriert)
//!     |                    |
//!     +----- Trennen ------+--> Registrierung entfernen
//! ```
//!
//! ## Keepalive
//! - Server sendet alle `keepalive_sek` einen Ping
//! - Kommt `verbindungs_timeout_sek` lang kein Frame, wird getrennt
//!
//! ## Zustellung
//! Ein gepushtes Envelope gilt erst als `delivered`, wenn es vollstaendig
//! auf den Transport geschrieben wurde.

use std::sync::Arc;
use std::time::{Duration, Instant};

use encore_core::MemberId;
use encore_db::ChatStore;
use encore_protocol::{ControlMessage, ControlPayload, ErrorCode, FrameCodec};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;

use crate::dispatcher::{jetzt_ms, DispatcherContext, MessageDispatcher};
use crate::server_state::SignalingState;

/// Registrierte Push-Queue einer angemeldeten Verbindung
struct PushQueue {
    member_id: MemberId,
    verbindung: u64,
    rx: mpsc::Receiver<ControlMessage>,
}

/// Verarbeitet eine einzelne Verbindung
///
/// Liest Frames via `FrameCodec`, dispatcht an `MessageDispatcher` und
/// sendet Antworten sowie Pushes zurueck.
pub struct ClientConnection<S: ChatStore> {
    state: Arc<SignalingState<S>>,
    peer: String,
}

impl<S: ChatStore> ClientConnection<S> {
    /// Erstellt eine neue ClientConnection
    pub fn neu(state: Arc<SignalingState<S>>, peer: impl Into<String>) -> Self {
        Self {
            state,
            peer: peer.into(),
        }
    }

    /// Startet die Verarbeitungsschleife
    ///
    /// Laeuft bis die Verbindung getrennt wird oder ein Shutdown-Signal
    /// eingeht. Der Transport ist beliebig (TCP, TLS-Stream, In-Memory-Duplex).
    pub async fn verarbeiten<T>(self, stream: T, mut shutdown_rx: watch::Receiver<bool>)
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let keepalive_intervall = Duration::from_secs(self.state.config.keepalive_sek);
        let timeout_dauer = Duration::from_secs(self.state.config.verbindungs_timeout_sek);

        tracing::info!(peer = %self.peer, "Neue Verbindung");

        let mut framed = Framed::new(stream, FrameCodec::<ControlMessage>::new());
        let mut ctx = DispatcherContext::neu(self.peer.clone());
        let dispatcher = MessageDispatcher::neu(Arc::clone(&self.state));
        let mut push: Option<PushQueue> = None;

        let mut letzter_empfang = Instant::now();
        let mut naechster_ping = Instant::now() + keepalive_intervall;
        let mut ping_request_id: u32 = 0;

        loop {
            let jetzt = Instant::now();

            if jetzt.duration_since(letzter_empfang) > timeout_dauer {
                tracing::warn!(peer = %self.peer, "Verbindungs-Timeout");
                break;
            }

            let ping_verzoegerung = if jetzt < naechster_ping {
                naechster_ping.duration_since(jetzt)
            } else {
                Duration::from_millis(1)
            };

            tokio::select! {
                // Eingehende Nachricht vom Client
                frame = framed.next() => {
                    match frame {
                        Some(Ok(nachricht)) => {
                            letzter_empfang = Instant::now();
                            tracing::trace!(
                                peer = %self.peer,
                                request_id = nachricht.request_id,
                                "Nachricht empfangen"
                            );

                            if let Some(antwort) = dispatcher.dispatch(nachricht, &mut ctx).await {
                                if let Err(e) = framed.send(antwort).await {
                                    tracing::warn!(peer = %self.peer, fehler = %e, "Senden fehlgeschlagen");
                                    break;
                                }
                            }

                            // Nach erfolgreichem Hello: Push-Queue registrieren
                            if let (Some(member_id), None) = (ctx.member_id, push.as_ref()) {
                                let (verbindung, rx) =
                                    self.state.broadcaster.client_registrieren(member_id);
                                push = Some(PushQueue { member_id, verbindung, rx });
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!(peer = %self.peer, fehler = %e, "Frame-Lesefehler");
                            break;
                        }
                        None => {
                            tracing::info!(peer = %self.peer, "Verbindung vom Client getrennt");
                            break;
                        }
                    }
                }

                // Ausgehende Nachricht aus dem Broadcaster
                ausgehend = naechster_push(&mut push) => {
                    let Some(nachricht) = ausgehend else {
                        // Sender weg: eine neuere Verbindung hat uebernommen
                        tracing::info!(peer = %self.peer, "Registrierung von neuer Verbindung ersetzt");
                        push = None;
                        break;
                    };
                    let zugestellt = match &nachricht.payload {
                        ControlPayload::Envelope(envelope) => Some(envelope.message_id),
                        _ => None,
                    };
                    if let Err(e) = framed.send(nachricht).await {
                        tracing::warn!(peer = %self.peer, fehler = %e, "Push-Senden fehlgeschlagen");
                        break;
                    }
                    if let (Some(message_id), Some(queue)) = (zugestellt, push.as_ref()) {
                        if let Err(e) = self
                            .state
                            .realtime
                            .zustellung_bestaetigt(message_id, queue.member_id)
                            .await
                        {
                            tracing::debug!(
                                message_id = %message_id,
                                fehler = %e,
                                "Zustellung konnte nicht vermerkt werden"
                            );
                        }
                    }
                }

                // Keepalive-Ping
                _ = tokio::time::sleep(ping_verzoegerung) => {
                    if jetzt >= naechster_ping {
                        ping_request_id = ping_request_id.wrapping_add(1);
                        let ping = ControlMessage::ping(ping_request_id, jetzt_ms());

                        if let Err(e) = framed.send(ping).await {
                            tracing::warn!(peer = %self.peer, fehler = %e, "Ping-Senden fehlgeschlagen");
                            break;
                        }
                        naechster_ping = Instant::now() + keepalive_intervall;
                    }
                }

                // Shutdown-Signal
                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!(peer = %self.peer, "Shutdown-Signal – Verbindung wird getrennt");
                        let abschied = ControlMessage::error(
                            0,
                            ErrorCode::InternalError,
                            "Server wird heruntergefahren",
                        );
                        let _ = framed.send(abschied).await;
                        break;
                    }
                }
            }
        }

        if let Some(queue) = push {
            dispatcher.client_cleanup(&queue.member_id, queue.verbindung);
        }

        tracing::info!(peer = %self.peer, "Verbindungs-Task beendet");
    }
}

/// Wartet auf den naechsten Push; ohne Anmeldung nie bereit
async fn naechster_push(push: &mut Option<PushQueue>) -> Option<ControlMessage> {
    match push {
        Some(queue) => queue.rx.recv().await,
        None => std::future::pending().await,
    }
}
