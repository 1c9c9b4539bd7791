//! Fehlertypen fuer den Signaling-Service

use encore_chat::ChatError;
use encore_protocol::ErrorCode;
use thiserror::Error;

/// Fehlertyp fuer den Signaling-Service
#[derive(Debug, Error)]
pub enum SignalingError {
    /// IO-Fehler (TCP, Socket)
    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),

    /// Fehler aus dem Messaging-Kern
    #[error(transparent)]
    Chat(#[from] ChatError),

    /// Anfrage vor `Hello`
    #[error("Nicht angemeldet")]
    NichtAngemeldet,

    /// Protokollfehler (unerwartetes Frame, falscher Zustand)
    #[error("Protokollfehler: {0}")]
    Protokoll(String),

    /// Server ist voll
    #[error("Server ist voll")]
    ServerVoll,

    /// Timeout (Keepalive, Leerlauf)
    #[error("Timeout")]
    Timeout,

    /// Interner Fehler
    #[error("Interner Fehler: {0}")]
    Intern(String),
}

impl SignalingError {
    /// Erstellt einen internen Fehler
    pub fn intern(msg: impl Into<String>) -> Self {
        Self::Intern(msg.into())
    }

    /// Erstellt einen Protokollfehler
    pub fn protokoll(msg: impl Into<String>) -> Self {
        Self::Protokoll(msg.into())
    }

    /// Fehler-Code fuer die `Error`-Antwort
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Chat(e) => e.error_code(),
            Self::NichtAngemeldet => ErrorCode::NotAuthenticated,
            Self::Protokoll(_) => ErrorCode::InvalidRequest,
            Self::ServerVoll => ErrorCode::ServerFull,
            Self::Timeout => ErrorCode::Timeout,
            Self::Io(_) | Self::Intern(_) => ErrorCode::InternalError,
        }
    }
}

/// Result-Typ fuer den Signaling-Service
pub type SignalingResult<T> = Result<T, SignalingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_fehler_behalten_ihren_code() {
        let e = SignalingError::from(ChatError::AuthenticationFailure);
        assert_eq!(e.error_code(), ErrorCode::AuthenticationFailure);
        assert_eq!(
            SignalingError::NichtAngemeldet.error_code(),
            ErrorCode::NotAuthenticated
        );
    }
}
