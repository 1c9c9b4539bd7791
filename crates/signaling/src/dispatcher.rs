//! Message-Dispatcher – Routet ControlMessages an die richtigen Handler
//!
//! Der Dispatcher empfaengt ControlMessages von einer ClientConnection,
//! bestimmt den richtigen Handler und gibt die Antwort zurueck.
//!
//! ## Zustandspruefung
//! - `Hello` nur solange die Verbindung noch nicht angemeldet ist
//! - `Ping`/`Pong` immer
//! - Alle anderen nur nach `Hello`

use std::sync::Arc;

use encore_core::MemberId;
use encore_db::ChatStore;
use encore_protocol::{ControlMessage, ControlPayload};

use crate::error::SignalingError;
use crate::handlers::{fehler_antwort, group_handler, message_handler, session_handler};
use crate::server_state::SignalingState;

/// Dispatcher-Kontext – Informationen ueber die aktuelle Verbindung
#[derive(Debug, Clone)]
pub struct DispatcherContext {
    /// Gegenstelle (Adresse oder Bezeichnung fuer Logs)
    pub peer: String,
    /// Angemeldetes Mitglied (None vor `Hello`)
    pub member_id: Option<MemberId>,
}

impl DispatcherContext {
    pub fn neu(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            member_id: None,
        }
    }
}

/// Zentraler Message-Dispatcher
pub struct MessageDispatcher<S: ChatStore> {
    state: Arc<SignalingState<S>>,
}

impl<S: ChatStore> MessageDispatcher<S> {
    /// Erstellt einen neuen Dispatcher
    pub fn neu(state: Arc<SignalingState<S>>) -> Self {
        Self { state }
    }

    /// Verarbeitet eine eingehende ControlMessage und gibt die Antwort zurueck
    ///
    /// Gibt `None` zurueck wenn keine Antwort gesendet werden soll
    /// (Pong-Antworten des Clients).
    pub async fn dispatch(
        &self,
        message: ControlMessage,
        ctx: &mut DispatcherContext,
    ) -> Option<ControlMessage> {
        let request_id = message.request_id;

        match message.payload {
            ControlPayload::Hello(req) => {
                if ctx.member_id.is_some() {
                    return Some(fehler_antwort(
                        request_id,
                        SignalingError::protokoll("Bereits angemeldet"),
                    ));
                }
                Some(session_handler::handle_hello(req, request_id, ctx, &self.state).await)
            }

            // -------------------------------------------------------------------
            // Keepalive
            // -------------------------------------------------------------------
            ControlPayload::Ping(ping) => Some(ControlMessage::pong(
                request_id,
                ping.timestamp_ms,
                jetzt_ms(),
            )),

            ControlPayload::Pong(_) => {
                tracing::trace!(peer = %ctx.peer, "Pong empfangen");
                None
            }

            // -------------------------------------------------------------------
            // Anmeldung erfordernde Nachrichten
            // -------------------------------------------------------------------
            payload => {
                let member_id = match ctx.member_id {
                    Some(mid) => mid,
                    None => return Some(fehler_antwort(request_id, SignalingError::NichtAngemeldet)),
                };
                Some(self.dispatch_angemeldet(payload, request_id, member_id).await)
            }
        }
    }

    /// Routet Nachrichten die eine Anmeldung erfordern
    async fn dispatch_angemeldet(
        &self,
        payload: ControlPayload,
        request_id: u32,
        member_id: MemberId,
    ) -> ControlMessage {
        let state = &self.state;
        match payload {
            // -------------------------------------------------------------------
            // Gruppen
            // -------------------------------------------------------------------
            ControlPayload::CreateGroup(req) => {
                group_handler::handle_create_group(req, request_id, member_id, state).await
            }
            ControlPayload::Membership(req) => {
                group_handler::handle_membership(req, request_id, member_id, state).await
            }
            ControlPayload::DissolveGroup { group_id } => {
                group_handler::handle_dissolve(group_id, request_id, member_id, state).await
            }
            ControlPayload::GroupInfoRequest { group_id } => {
                group_handler::handle_group_info(group_id, request_id, member_id, state).await
            }
            ControlPayload::Subscribe { group_id } => {
                group_handler::handle_subscribe(group_id, request_id, member_id, state).await
            }
            ControlPayload::Unsubscribe { group_id } => {
                group_handler::handle_unsubscribe(group_id, request_id, member_id, state)
            }

            // -------------------------------------------------------------------
            // Nachrichten
            // -------------------------------------------------------------------
            ControlPayload::ReserveSend { group_id } => {
                message_handler::handle_reserve(group_id, request_id, member_id, state).await
            }
            ControlPayload::SendMessage(req) => {
                message_handler::handle_send(req, request_id, member_id, state).await
            }
            ControlPayload::FetchBacklog(req) => {
                message_handler::handle_fetch_backlog(req, request_id, member_id, state).await
            }
            ControlPayload::Acknowledge(req) => {
                message_handler::handle_acknowledge(req, request_id, member_id, state).await
            }
            ControlPayload::React(req) => {
                message_handler::handle_react(req, request_id, member_id, state).await
            }

            // -------------------------------------------------------------------
            // Unerwartete Server->Client Nachrichten
            // -------------------------------------------------------------------
            ControlPayload::HelloOk(_)
            | ControlPayload::Group(_)
            | ControlPayload::SendReserved(_)
            | ControlPayload::MessageAccepted(_)
            | ControlPayload::Backlog(_)
            | ControlPayload::AckOk(_)
            | ControlPayload::ReactOk(_)
            | ControlPayload::Subscribed(_)
            | ControlPayload::Unsubscribed { .. }
            | ControlPayload::Envelope(_)
            | ControlPayload::Receipt(_)
            | ControlPayload::Reaction(_)
            | ControlPayload::GroupChanged(_)
            | ControlPayload::Error(_) => {
                tracing::warn!(
                    request_id,
                    "Unerwartete Server->Client Nachricht vom Client empfangen"
                );
                fehler_antwort(request_id, SignalingError::protokoll("Unerwartete Nachricht"))
            }

            // Oben bereits behandelt
            ControlPayload::Hello(_) | ControlPayload::Ping(_) | ControlPayload::Pong(_) => {
                fehler_antwort(request_id, SignalingError::protokoll("Unerwartete Nachricht"))
            }
        }
    }

    /// Bereinigt alle Ressourcen einer Verbindung beim Trennen
    pub fn client_cleanup(&self, member_id: &MemberId, verbindung: u64) {
        self.state.broadcaster.client_entfernen(member_id, verbindung);
        tracing::debug!(member_id = %member_id, "Client-Ressourcen bereinigt");
    }
}

/// Unix-Zeit in Millisekunden
pub(crate) fn jetzt_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
