//! Fehlertypen fuer das Protokoll-Crate

use thiserror::Error;

/// Fehler beim Interpretieren eines Envelopes oder Frames
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Ungueltiges Feld '{feld}': {grund}")]
    UngueltigesFeld { feld: &'static str, grund: String },

    #[error("Doppelter Wrapped Key fuer Empfaenger {0}")]
    DoppelterEmpfaenger(String),

    #[error("JSON-Fehler: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    pub fn feld(feld: &'static str, grund: impl Into<String>) -> Self {
        Self::UngueltigesFeld {
            feld,
            grund: grund.into(),
        }
    }
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
