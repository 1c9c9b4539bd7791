//! Oeffentliche Typen fuer den Chat-Kern

use std::time::Duration;

use encore_core::MemberId;
use encore_crypto::PublicKey;
use encore_protocol::DeliveryRecord;
use serde::{Deserialize, Serialize};

pub use encore_protocol::control::BacklogResponse as Backlog;
pub use encore_protocol::{GroupInfo, Role, Visibility};

/// Ein registriertes Mitglied
///
/// Der private Schluessel gehoert nicht hierher; er bleibt beim Agenten
/// des Mitglieds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub display_handle: String,
    pub public_key: PublicKey,
}

/// Ergebnis einer Empfangs-/Lesebestaetigung
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckErgebnis {
    /// Zustand nach der Bestaetigung
    pub record: DeliveryRecord,
    /// Absender der bestaetigten Nachricht (Empfaenger der Quittung)
    pub sender_id: MemberId,
    /// `false` wenn die Bestaetigung nichts veraendert hat (Duplikat, veraltet)
    pub geaendert: bool,
}

/// Laufzeit-Konfiguration des Chat-Kerns
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Zeitlimit fuer einen einzelnen atomaren Schreibversuch
    pub persist_timeout: Duration,
    /// Zusaetzliche Versuche nach dem ersten fehlgeschlagenen
    pub persist_retries: u32,
    /// Obergrenze fuer eine Backlog-Seite
    pub backlog_limit: u32,
    /// Maximale Klartextgroesse in Bytes
    pub max_klartext: usize,
    /// Maximale Laenge eines Reaktions-Emojis in Bytes
    pub max_emoji: usize,
    /// Wie lange ein reservierter Sendeplatz auf sein Envelope wartet
    pub reservierung_gueltig: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            persist_timeout: Duration::from_secs(5),
            persist_retries: 2,
            backlog_limit: 500,
            max_klartext: 64 * 1024,
            max_emoji: 32,
            reservierung_gueltig: Duration::from_secs(10),
        }
    }
}
