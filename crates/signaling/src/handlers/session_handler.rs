//! Session-Handler – Hello
//!
//! Die Identitaet im `Hello` ist bereits authentifiziert (vorgelagerter
//! Identity-Dienst). Hier wird sie nur im Mitglieder-Verzeichnis
//! registriert und an die Verbindung gebunden.

use std::sync::Arc;

use encore_chat::Member;
use encore_db::ChatStore;
use encore_protocol::control::{HelloRequest, HelloResponse};
use encore_protocol::{ControlMessage, ControlPayload};

use super::fehler_antwort;
use crate::dispatcher::DispatcherContext;
use crate::server_state::SignalingState;

/// Server-Version fuer `HelloOk`
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Verarbeitet eine Hello-Anfrage
pub async fn handle_hello<S: ChatStore>(
    request: HelloRequest,
    request_id: u32,
    ctx: &mut DispatcherContext,
    state: &Arc<SignalingState<S>>,
) -> ControlMessage {
    let member = Member {
        id: request.member_id,
        display_handle: request.display_handle,
        public_key: request.public_key,
    };

    if let Err(e) = state.chat.register_member(member).await {
        tracing::warn!(
            peer = %ctx.peer,
            member_id = %request.member_id,
            fehler = %e,
            "Hello abgelehnt"
        );
        return fehler_antwort(request_id, e);
    }

    ctx.member_id = Some(request.member_id);
    tracing::info!(
        peer = %ctx.peer,
        member_id = %request.member_id,
        client_version = %request.client_version,
        "Verbindung angemeldet"
    );

    ControlMessage::new(
        request_id,
        ControlPayload::HelloOk(HelloResponse {
            member_id: request.member_id,
            server_version: SERVER_VERSION.to_string(),
        }),
    )
}
