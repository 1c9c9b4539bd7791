//! Fehlertypen fuer das Chat-Crate

use std::time::Duration;

use encore_core::{GroupId, MemberId, MessageId};
use encore_crypto::CryptoError;
use encore_db::DbError;
use encore_protocol::{ErrorCode, ProtocolError};
use thiserror::Error;

/// Fehler des Gruppen-Messaging-Kerns
///
/// Kryptografische Pruef-Fehler (`AuthenticationFailure`, `KeyMismatch`,
/// `Corrupt`) bleiben getrennte Varianten und werden nie zu "kein Inhalt"
/// zusammengefasst.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Auth-Tag ungueltig: Ciphertext oder Metadaten wurden veraendert
    #[error("Authentifizierung fehlgeschlagen: Nachricht manipuliert")]
    AuthenticationFailure,

    /// Aufrufer ist kein Empfaenger dieser Nachricht
    #[error("Kein Wrapped Key fuer dieses Mitglied")]
    KeyMismatch,

    #[error("Wrapped Key oder Envelope beschaedigt: {0}")]
    Corrupt(String),

    /// Aufrufer ist nicht (mehr) im aktuellen Roster
    #[error("Mitglied {member} gehoert nicht zur Gruppe {group}")]
    StaleMembership { member: MemberId, group: GroupId },

    /// Fehlende Sequenznummern; per Backlog-Abruf behebbar
    #[error("Sequenzluecke: erwartet {expected}, erhalten {received}")]
    SequenceGap { expected: u64, received: u64 },

    /// Envelope wurde fuer eine inzwischen ueberholte Epoch versiegelt
    #[error("Veraltete Epoch: aktuell {current}, Envelope {received}")]
    StaleEpoch { current: u64, received: u64 },

    #[error("Ungueltige Operation: {0}")]
    InvalidOperation(String),

    /// Atomarer Envelope-Schreibvorgang nicht abgeschlossen
    #[error("Persistierung fehlgeschlagen: {0}")]
    PersistenceFailure(String),

    #[error("Zeitueberschreitung nach {0:?}")]
    Timeout(Duration),

    #[error("Gruppe nicht gefunden: {0}")]
    GroupNotFound(GroupId),

    #[error("Nachricht nicht gefunden: {0}")]
    MessageNotFound(MessageId),

    #[error("Unbekanntes Mitglied: {0}")]
    UnknownMember(MemberId),

    #[error("Gruppe {0} ist aufgeloest")]
    GroupDissolved(GroupId),

    #[error("Interner Fehler: {0}")]
    Intern(String),
}

impl ChatError {
    pub fn ungueltig(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    /// Ob ein erneuter Versuch sinnvoll ist
    pub fn ist_wiederholbar(&self) -> bool {
        matches!(
            self,
            Self::PersistenceFailure(_)
                | Self::Timeout(_)
                | Self::SequenceGap { .. }
                | Self::StaleEpoch { .. }
        )
    }

    /// Fehler-Code fuer das Control-Protokoll
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::AuthenticationFailure => ErrorCode::AuthenticationFailure,
            Self::KeyMismatch => ErrorCode::KeyMismatch,
            Self::Corrupt(_) => ErrorCode::Corrupt,
            Self::StaleMembership { .. } => ErrorCode::StaleMembership,
            Self::SequenceGap { .. } => ErrorCode::SequenceGap,
            Self::StaleEpoch { .. } => ErrorCode::StaleEpoch,
            Self::InvalidOperation(_) => ErrorCode::InvalidOperation,
            Self::PersistenceFailure(_) => ErrorCode::PersistenceFailure,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::GroupNotFound(_) | Self::MessageNotFound(_) | Self::UnknownMember(_) => {
                ErrorCode::NotFound
            }
            Self::GroupDissolved(_) => ErrorCode::GroupDissolved,
            Self::Intern(_) => ErrorCode::InternalError,
        }
    }
}

impl From<CryptoError> for ChatError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::AuthenticationFailure => Self::AuthenticationFailure,
            CryptoError::KeyMismatch => Self::KeyMismatch,
            CryptoError::Corrupt(msg) => Self::Corrupt(msg),
            andere => Self::Intern(andere.to_string()),
        }
    }
}

impl From<DbError> for ChatError {
    fn from(e: DbError) -> Self {
        Self::PersistenceFailure(e.to_string())
    }
}

impl From<ProtocolError> for ChatError {
    fn from(e: ProtocolError) -> Self {
        Self::Corrupt(e.to_string())
    }
}

pub type ChatResult<T> = Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn krypto_fehler_bleiben_unterscheidbar() {
        assert!(matches!(
            ChatError::from(CryptoError::AuthenticationFailure),
            ChatError::AuthenticationFailure
        ));
        assert!(matches!(
            ChatError::from(CryptoError::KeyMismatch),
            ChatError::KeyMismatch
        ));
        assert!(matches!(
            ChatError::from(CryptoError::Corrupt("x".into())),
            ChatError::Corrupt(_)
        ));
    }

    #[test]
    fn wiederholbare_fehler() {
        assert!(ChatError::PersistenceFailure("db".into()).ist_wiederholbar());
        assert!(ChatError::SequenceGap { expected: 2, received: 4 }.ist_wiederholbar());
        assert!(ChatError::StaleEpoch { current: 3, received: 2 }.ist_wiederholbar());
        assert!(!ChatError::AuthenticationFailure.ist_wiederholbar());
        assert!(!ChatError::ungueltig("letzter Admin").ist_wiederholbar());
    }

    #[test]
    fn error_codes() {
        assert_eq!(ChatError::KeyMismatch.error_code(), ErrorCode::KeyMismatch);
        assert_eq!(
            ChatError::GroupNotFound(GroupId::new()).error_code(),
            ErrorCode::NotFound
        );
    }
}
