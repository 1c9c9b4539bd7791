//! Fehlertypen fuer das Kryptografie-Subsystem

use thiserror::Error;

/// Fehler im Kryptografie-Subsystem
///
/// `AuthenticationFailure`, `KeyMismatch` und `Corrupt` sind bewusst getrennt:
/// der Aufrufer muss "manipuliert" von "nicht fuer mich" unterscheiden koennen.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Auth-Tag stimmt nicht (Ciphertext, Tag oder Associated Data veraendert)
    #[error("Authentifizierung fehlgeschlagen: Nachricht manipuliert oder falsche Associated Data")]
    AuthenticationFailure,

    /// Der Wrapped Key wurde nicht fuer diesen Schluessel erstellt
    #[error("Wrapped Key gehoert zu einem anderen Empfaenger")]
    KeyMismatch,

    /// Wrapped-Key-Blob beschaedigt oder Integritaetspruefung fehlgeschlagen
    #[error("Wrapped Key beschaedigt: {0}")]
    Corrupt(String),

    #[error("Verschluesselung fehlgeschlagen: {0}")]
    Verschluesselung(String),

    #[error("Ungueltige Schluessel-Laenge: erwartet {erwartet}, erhalten {erhalten}")]
    UngueltigeSchluesselLaenge { erwartet: usize, erhalten: usize },

    #[error("Ungueltige Nonce-Laenge: erwartet {erwartet}, erhalten {erhalten}")]
    UngueltigeNonce { erwartet: usize, erhalten: usize },

    #[error("Key Derivation fehlgeschlagen: {0}")]
    KeyDerivation(String),
}

pub type CryptoResult<T> = Result<T, CryptoError>;
