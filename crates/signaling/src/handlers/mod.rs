//! Handler fuer alle Control-Nachrichten
//!
//! Jeder Handler ist fuer eine Gruppe von Nachrichtentypen zustaendig
//! und hat Zugriff auf den gemeinsamen SignalingState.

pub mod group_handler;
pub mod message_handler;
pub mod session_handler;

use encore_protocol::ControlMessage;

use crate::error::SignalingError;

/// Fehler-Antwort mit dem passenden Code
pub(crate) fn fehler_antwort(request_id: u32, fehler: impl Into<SignalingError>) -> ControlMessage {
    let fehler = fehler.into();
    ControlMessage::error(request_id, fehler.error_code(), fehler.to_string())
}
