//! Message Envelope – die uebertragbare Einheit einer Gruppennachricht
//!
//! Ein Envelope buendelt Ciphertext, Auth-Tag und die Wrapped Keys aller
//! Empfaenger, die zum Sendezeitpunkt Mitglied waren. Gruppe, Epoch,
//! Sequenz und Absender reisen als Klartext-Metadaten mit, damit Empfaenger
//! Luecken erkennen koennen ohne zu entschluesseln. Dieselben Felder sind
//! ueber die Associated Data an den Auth-Tag gebunden.
//!
//! ## JSON-Darstellung
//! ```text
//! {
//!   "message_id": "…", "group_id": "…", "epoch": 1, "sequence": 7,
//!   "sender_id": "…", "algorithm": "AES256_GCM",
//!   "nonce": "<b64>", "ciphertext": "<b64>", "auth_tag": "<b64>",
//!   "wrapped_keys": [{ "recipient_id": "…", "wrapped_key": "<b64>" }],
//!   "attachment": "blob-id" | null, "sent_at": "2024-…Z"
//! }
//! ```

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use encore_core::{GroupId, MemberId, MessageId};
use encore_crypto::{
    AssociatedData, CipherAlgorithm, Nonce, SealedMessage, WrappedKeyBlob,
    MAX_ATTACHMENT_REF_LEN, NONCE_LEN, TAG_LEN,
};
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};

// ---------------------------------------------------------------------------
// Wrapped Keys
// ---------------------------------------------------------------------------

/// Wrapped Key fuer genau einen Empfaenger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKeyEntry {
    pub recipient_id: MemberId,
    #[serde(with = "crate::b64")]
    pub wrapped_key: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Persistierte und uebertragene Einheit einer Nachricht
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: MessageId,
    pub group_id: GroupId,
    pub epoch: u64,
    pub sequence: u64,
    pub sender_id: MemberId,
    pub algorithm: CipherAlgorithm,
    #[serde(with = "crate::b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "crate::b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "crate::b64")]
    pub auth_tag: Vec<u8>,
    pub wrapped_keys: Vec<WrappedKeyEntry>,
    /// Opaque Referenz auf einen extern gehaltenen Anhang
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<String>,
    pub sent_at: DateTime<Utc>,
}

impl Envelope {
    /// Setzt ein Envelope aus den Bausteinen der Sende-Pipeline zusammen
    pub fn zusammensetzen(
        message_id: MessageId,
        ad: &AssociatedData,
        sealed: SealedMessage,
        wrapped: Vec<(MemberId, WrappedKeyBlob)>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id,
            group_id: ad.group_id,
            epoch: ad.epoch,
            sequence: ad.sequence,
            sender_id: ad.sender_id,
            algorithm: sealed.algorithm,
            nonce: sealed.nonce.as_bytes().to_vec(),
            ciphertext: sealed.ciphertext,
            auth_tag: sealed.tag.to_vec(),
            wrapped_keys: wrapped
                .into_iter()
                .map(|(recipient_id, blob)| WrappedKeyEntry {
                    recipient_id,
                    wrapped_key: blob.into_bytes(),
                })
                .collect(),
            attachment: ad.attachment.clone(),
            sent_at,
        }
    }

    /// Rekonstruiert die Associated Data aus den Klartext-Metadaten
    pub fn associated_data(&self) -> AssociatedData {
        AssociatedData {
            group_id: self.group_id,
            epoch: self.epoch,
            sequence: self.sequence,
            sender_id: self.sender_id,
            attachment: self.attachment.clone(),
        }
    }

    /// Ciphertext, Nonce und Tag fuer die Cipher Engine
    ///
    /// Prueft nur die festen Laengen; die Echtheit prueft erst der Auth-Tag.
    pub fn sealed(&self) -> ProtocolResult<SealedMessage> {
        let nonce = Nonce::from_slice(&self.nonce).map_err(|_| {
            ProtocolError::feld("nonce", format!("{} statt {NONCE_LEN} Bytes", self.nonce.len()))
        })?;
        let tag: [u8; TAG_LEN] = self.auth_tag.as_slice().try_into().map_err(|_| {
            ProtocolError::feld(
                "auth_tag",
                format!("{} statt {TAG_LEN} Bytes", self.auth_tag.len()),
            )
        })?;
        Ok(SealedMessage {
            algorithm: self.algorithm,
            nonce,
            ciphertext: self.ciphertext.clone(),
            tag,
        })
    }

    /// Wrapped Key fuer einen bestimmten Empfaenger
    pub fn wrapped_key_for(&self, member: &MemberId) -> Option<WrappedKeyBlob> {
        self.wrapped_keys
            .iter()
            .find(|e| e.recipient_id == *member)
            .map(|e| WrappedKeyBlob(e.wrapped_key.clone()))
    }

    /// Alle Empfaenger (Mitglieder zum Sendezeitpunkt)
    pub fn empfaenger(&self) -> impl Iterator<Item = MemberId> + '_ {
        self.wrapped_keys.iter().map(|e| e.recipient_id)
    }

    pub fn ist_empfaenger(&self, member: &MemberId) -> bool {
        self.wrapped_keys.iter().any(|e| e.recipient_id == *member)
    }

    /// Strukturelle Pruefung eines empfangenen Envelopes
    pub fn validieren(&self) -> ProtocolResult<()> {
        self.sealed()?;
        if let Some(anhang) = &self.attachment {
            if anhang.is_empty() || anhang.len() > MAX_ATTACHMENT_REF_LEN {
                return Err(ProtocolError::feld(
                    "attachment",
                    format!(
                        "{} Bytes, erlaubt sind 1 bis {MAX_ATTACHMENT_REF_LEN}",
                        anhang.len()
                    ),
                ));
            }
        }
        if self.wrapped_keys.is_empty() {
            return Err(ProtocolError::feld("wrapped_keys", "leer"));
        }
        let mut gesehen = HashSet::with_capacity(self.wrapped_keys.len());
        for entry in &self.wrapped_keys {
            if !gesehen.insert(entry.recipient_id) {
                return Err(ProtocolError::DoppelterEmpfaenger(
                    entry.recipient_id.to_string(),
                ));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Zustellstatus
// ---------------------------------------------------------------------------

/// Zustellstatus pro (Nachricht, Empfaenger)
///
/// Die Reihenfolge der Varianten ist die Reihenfolge der Zustaende:
/// `Queued < Delivered < Read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Queued,
    Delivered,
    Read,
}

impl DeliveryState {
    pub fn als_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }

    /// Alle Zustaende bis einschliesslich `self`, aufsteigend
    pub fn pfad(&self) -> &'static [DeliveryState] {
        match self {
            Self::Queued => &[Self::Queued],
            Self::Delivered => &[Self::Queued, Self::Delivered],
            Self::Read => &[Self::Queued, Self::Delivered, Self::Read],
        }
    }
}

impl std::str::FromStr for DeliveryState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            other => Err(format!("Unbekannter Zustellstatus: '{other}'")),
        }
    }
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.als_str())
    }
}

/// Zustell-Datensatz mit Zeitstempel je erreichtem Zustand
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub message_id: MessageId,
    pub recipient_id: MemberId,
    pub state: DeliveryState,
    pub queued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

impl DeliveryRecord {
    /// Neuer Datensatz im Zustand `Queued`
    pub fn queued(message_id: MessageId, recipient_id: MemberId, at: DateTime<Utc>) -> Self {
        Self {
            message_id,
            recipient_id,
            state: DeliveryState::Queued,
            queued_at: at,
            delivered_at: None,
            read_at: None,
        }
    }

    /// Zeitstempel eines Zustands, falls erreicht
    pub fn zeitpunkt(&self, state: DeliveryState) -> Option<DateTime<Utc>> {
        match state {
            DeliveryState::Queued => Some(self.queued_at),
            DeliveryState::Delivered => self.delivered_at,
            DeliveryState::Read => self.read_at,
        }
    }
}

/// Ein einzelner Zustandsuebergang, so wie er angehaengt wird
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTransition {
    pub message_id: MessageId,
    pub recipient_id: MemberId,
    pub state: DeliveryState,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Reaktionen
// ---------------------------------------------------------------------------

/// Eine Reaktion eines Mitglieds auf eine Nachricht
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionRecord {
    pub message_id: MessageId,
    pub member_id: MemberId,
    pub emoji: String,
    pub reacted_at: DateTime<Utc>,
}

/// Zusammenfassung: Mitglied -> aktuelles Emoji
pub type ReactionSummary = BTreeMap<MemberId, String>;

/// Verdichtet angehaengte Reaktionen; die spaeteste pro Mitglied gewinnt
pub fn reaktionen_zusammenfassen<'a>(
    records: impl IntoIterator<Item = &'a ReactionRecord>,
) -> ReactionSummary {
    let mut sortiert: Vec<&ReactionRecord> = records.into_iter().collect();
    sortiert.sort_by_key(|r| r.reacted_at);
    sortiert
        .into_iter()
        .map(|r| (r.member_id, r.emoji.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
