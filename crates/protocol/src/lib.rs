//! encore-protocol – Envelope-Format und Netzwerkprotokoll
//!
//! Definiert die uebertragbare Einheit einer Nachricht (Envelope),
//! Zustell- und Reaktions-Datensaetze sowie alle Control-Nachrichten
//! zwischen Mitglieds-Client und Server.

pub(crate) mod b64;
pub mod control;
pub mod envelope;
pub mod error;
pub mod wire;

pub use control::{
    ControlMessage, ControlPayload, ErrorCode, GroupInfo, RecipientKey, Role, SendReservation,
    Visibility,
};
pub use envelope::{
    reaktionen_zusammenfassen, DeliveryRecord, DeliveryState, DeliveryTransition, Envelope,
    ReactionRecord, ReactionSummary, WrappedKeyEntry,
};
pub use error::{ProtocolError, ProtocolResult};
pub use wire::FrameCodec;
