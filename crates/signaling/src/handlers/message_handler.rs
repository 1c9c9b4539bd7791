//! Nachrichten-Handler – Senden, Backlog, Bestaetigungen, Reaktionen
//!
//! Versand und Zustellstatus laufen ueber den RealtimeDispatcher, damit
//! Pushes und Quittungen nur an einer Stelle entstehen.

use std::sync::Arc;

use chrono::Utc;
use encore_core::{GroupId, MemberId};
use encore_db::ChatStore;
use encore_protocol::control::{
    AcknowledgeRequest, FetchBacklogRequest, ReactRequest, ReactResponse, SendMessageRequest,
};
use encore_protocol::{ControlMessage, ControlPayload};

use super::fehler_antwort;
use crate::server_state::SignalingState;

/// Reserviert Sequenz und Empfaengerliste fuer einen Versand
pub async fn handle_reserve<S: ChatStore>(
    group_id: GroupId,
    request_id: u32,
    member_id: MemberId,
    state: &Arc<SignalingState<S>>,
) -> ControlMessage {
    match state.realtime.reservieren(group_id, member_id).await {
        Ok(reservierung) => {
            ControlMessage::new(request_id, ControlPayload::SendReserved(reservierung))
        }
        Err(e) => fehler_antwort(request_id, e),
    }
}

/// Nimmt ein beim Client versiegeltes Envelope an, speichert und verteilt es
pub async fn handle_send<S: ChatStore>(
    request: SendMessageRequest,
    request_id: u32,
    member_id: MemberId,
    state: &Arc<SignalingState<S>>,
) -> ControlMessage {
    let group_id = request.envelope.group_id;
    let sequence = request.envelope.sequence;
    match state.realtime.senden(member_id, request.envelope).await {
        Ok(accepted) => ControlMessage::new(request_id, ControlPayload::MessageAccepted(accepted)),
        Err(e) => {
            tracing::warn!(
                member_id = %member_id,
                group_id = %group_id,
                sequence,
                fehler = %e,
                "Nachricht senden fehlgeschlagen"
            );
            fehler_antwort(request_id, e)
        }
    }
}

/// Liefert den Backlog ab einer Sequenznummer
pub async fn handle_fetch_backlog<S: ChatStore>(
    request: FetchBacklogRequest,
    request_id: u32,
    member_id: MemberId,
    state: &Arc<SignalingState<S>>,
) -> ControlMessage {
    match state
        .chat
        .fetch_backlog(
            request.group_id,
            member_id,
            request.since_sequence,
            request.limit,
        )
        .await
    {
        Ok(backlog) => ControlMessage::new(request_id, ControlPayload::Backlog(backlog)),
        Err(e) => fehler_antwort(request_id, e),
    }
}

/// Empfangs- oder Lesebestaetigung des Clients
pub async fn handle_acknowledge<S: ChatStore>(
    request: AcknowledgeRequest,
    request_id: u32,
    member_id: MemberId,
    state: &Arc<SignalingState<S>>,
) -> ControlMessage {
    let at = request.timestamp.unwrap_or_else(Utc::now);
    match state
        .realtime
        .bestaetigen(request.message_id, member_id, request.state, at)
        .await
    {
        Ok(ergebnis) => ControlMessage::new(request_id, ControlPayload::AckOk(ergebnis.record)),
        Err(e) => fehler_antwort(request_id, e),
    }
}

/// Reaktion setzen
pub async fn handle_react<S: ChatStore>(
    request: ReactRequest,
    request_id: u32,
    member_id: MemberId,
    state: &Arc<SignalingState<S>>,
) -> ControlMessage {
    match state
        .realtime
        .reagieren(request.message_id, member_id, &request.emoji)
        .await
    {
        Ok((_, summary)) => ControlMessage::new(
            request_id,
            ControlPayload::ReactOk(ReactResponse {
                message_id: request.message_id,
                summary,
            }),
        ),
        Err(e) => fehler_antwort(request_id, e),
    }
}
