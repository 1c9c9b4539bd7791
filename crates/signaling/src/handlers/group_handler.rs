//! Gruppen-Handler – Anlegen, Mitgliedschaft, Aufloesen, Abonnements
//!
//! Jede erfolgreiche Roster-Aenderung wird als `GroupChanged` an die
//! verbundenen Mitglieder gepusht.

use std::sync::Arc;

use encore_chat::ChatError;
use encore_core::{GroupId, MemberId};
use encore_db::ChatStore;
use encore_protocol::control::{
    CreateGroupRequest, MembershipAction, MembershipRequest, SubscribedResponse,
};
use encore_protocol::{ControlMessage, ControlPayload};

use super::fehler_antwort;
use crate::server_state::SignalingState;

/// Legt eine Gruppe an
pub async fn handle_create_group<S: ChatStore>(
    request: CreateGroupRequest,
    request_id: u32,
    member_id: MemberId,
    state: &Arc<SignalingState<S>>,
) -> ControlMessage {
    match state
        .chat
        .create_group(member_id, request.visibility, &request.members)
        .await
    {
        Ok(info) => {
            state.realtime.gruppe_geaendert(&info, None);
            ControlMessage::new(request_id, ControlPayload::Group(info))
        }
        Err(e) => {
            tracing::debug!(member_id = %member_id, fehler = %e, "Gruppe anlegen fehlgeschlagen");
            fehler_antwort(request_id, e)
        }
    }
}

/// Mitglied hinzufuegen/entfernen, Admin-Rolle vergeben/entziehen
pub async fn handle_membership<S: ChatStore>(
    request: MembershipRequest,
    request_id: u32,
    member_id: MemberId,
    state: &Arc<SignalingState<S>>,
) -> ControlMessage {
    let chat = &state.chat;
    let (group_id, ziel) = (request.group_id, request.member_id);
    let ergebnis = match request.action {
        MembershipAction::Add => chat.add_member(group_id, member_id, ziel).await,
        MembershipAction::Remove => chat.remove_member(group_id, member_id, ziel).await,
        MembershipAction::Promote => chat.promote_admin(group_id, member_id, ziel).await,
        MembershipAction::Demote => chat.demote_admin(group_id, member_id, ziel).await,
    };

    match ergebnis {
        Ok(info) => {
            if request.action == MembershipAction::Remove {
                state.broadcaster.abbestellen(&ziel, &group_id);
            }
            state.realtime.gruppe_geaendert(&info, Some(ziel));
            tracing::debug!(
                group_id = %group_id,
                aktion = ?request.action,
                ziel = %ziel,
                epoch = info.epoch,
                "Mitgliedschaft geaendert"
            );
            ControlMessage::new(request_id, ControlPayload::Group(info))
        }
        Err(e) => {
            tracing::debug!(group_id = %group_id, aktion = ?request.action, fehler = %e, "Mitgliedschaftsaenderung abgelehnt");
            fehler_antwort(request_id, e)
        }
    }
}

/// Loest eine Gruppe auf
pub async fn handle_dissolve<S: ChatStore>(
    group_id: GroupId,
    request_id: u32,
    member_id: MemberId,
    state: &Arc<SignalingState<S>>,
) -> ControlMessage {
    let vorher = match state.chat.group_info(group_id).await {
        Ok(info) => info,
        Err(e) => return fehler_antwort(request_id, e),
    };
    match state.chat.dissolve_group(group_id, member_id).await {
        Ok(info) => {
            let push = ControlMessage::push(ControlPayload::GroupChanged(info.clone()));
            for m in &vorher.members {
                state.broadcaster.an_mitglied_senden(m, push.clone());
                state.broadcaster.abbestellen(m, &group_id);
            }
            ControlMessage::new(request_id, ControlPayload::Group(info))
        }
        Err(e) => fehler_antwort(request_id, e),
    }
}

/// Gruppeninfo abfragen (nur Mitglieder)
pub async fn handle_group_info<S: ChatStore>(
    group_id: GroupId,
    request_id: u32,
    member_id: MemberId,
    state: &Arc<SignalingState<S>>,
) -> ControlMessage {
    match state.chat.group_info(group_id).await {
        Ok(info) if info.dissolved || info.members.contains(&member_id) => {
            ControlMessage::new(request_id, ControlPayload::Group(info))
        }
        Ok(_) => fehler_antwort(
            request_id,
            ChatError::StaleMembership {
                member: member_id,
                group: group_id,
            },
        ),
        Err(e) => fehler_antwort(request_id, e),
    }
}

/// Live-Feed einer Gruppe abonnieren
///
/// Die Sequenz wird vor dem Abonnieren gelesen: eine Nachricht, die genau
/// dazwischen entsteht, taucht beim Client als Luecke auf und kommt ueber
/// den Backlog, statt als vermeintliches Duplikat verloren zu gehen.
pub async fn handle_subscribe<S: ChatStore>(
    group_id: GroupId,
    request_id: u32,
    member_id: MemberId,
    state: &Arc<SignalingState<S>>,
) -> ControlMessage {
    let info = match state.chat.group_info(group_id).await {
        Ok(info) => info,
        Err(e) => return fehler_antwort(request_id, e),
    };
    if info.dissolved {
        return fehler_antwort(request_id, ChatError::GroupDissolved(group_id));
    }
    if !info.members.contains(&member_id) {
        return fehler_antwort(
            request_id,
            ChatError::StaleMembership {
                member: member_id,
                group: group_id,
            },
        );
    }
    let latest_sequence = match state.chat.letzte_sequenz(group_id).await {
        Ok(s) => s,
        Err(e) => return fehler_antwort(request_id, e),
    };

    state.broadcaster.abonnieren(member_id, group_id);
    tracing::debug!(member_id = %member_id, group_id = %group_id, latest_sequence, "Gruppe abonniert");

    ControlMessage::new(
        request_id,
        ControlPayload::Subscribed(SubscribedResponse {
            group_id,
            epoch: info.epoch,
            latest_sequence,
        }),
    )
}

pub fn handle_unsubscribe<S: ChatStore>(
    group_id: GroupId,
    request_id: u32,
    member_id: MemberId,
    state: &Arc<SignalingState<S>>,
) -> ControlMessage {
    state.broadcaster.abbestellen(&member_id, &group_id);
    ControlMessage::new(request_id, ControlPayload::Unsubscribed { group_id })
}
