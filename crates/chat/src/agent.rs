//! MemberAgent – Empfangsseite eines Mitglieds
//!
//! Haelt den privaten Schluessel und pro Gruppe einen [`SequenceTracker`].
//! Entschluesselt wird nur, was der Tracker als neu erkennt. Versiegelt wird
//! ebenfalls hier: der Klartext verlaesst den Agent nie.

use std::collections::HashMap;

use chrono::Utc;
use encore_core::{GroupId, MemberId, MessageId};
use encore_crypto::{
    decrypt_message, encrypt_message, wrap_for_members, AssociatedData, KeyStore,
    PrivateKeyHandle, PublicKey,
};
use encore_protocol::{Envelope, SendReservation};
use tracing::{debug, warn};

use crate::delivery::SequenceTracker;
use crate::error::{ChatError, ChatResult};

/// Ergebnis von [`MemberAgent::ingest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eingang {
    Neu {
        message_id: MessageId,
        sequence: u64,
        sender_id: MemberId,
        klartext: Vec<u8>,
        /// `(expected, received)` wenn vor dieser Nachricht Sequenzen fehlen
        luecke: Option<(u64, u64)>,
    },
    Duplikat {
        message_id: MessageId,
        sequence: u64,
    },
}

pub struct MemberAgent {
    member_id: MemberId,
    keystore: KeyStore,
    tracker: HashMap<GroupId, SequenceTracker>,
}

impl MemberAgent {
    pub fn neu(member_id: MemberId, handle: PrivateKeyHandle) -> Self {
        Self {
            member_id,
            keystore: KeyStore::aus_handle(handle),
            tracker: HashMap::new(),
        }
    }

    /// Agent mit frisch erzeugtem Schluesselpaar
    pub fn generieren(member_id: MemberId) -> Self {
        Self {
            member_id,
            keystore: KeyStore::generieren(),
            tracker: HashMap::new(),
        }
    }

    pub fn member_id(&self) -> MemberId {
        self.member_id
    }

    pub fn public_key(&self) -> PublicKey {
        self.keystore.public_key()
    }

    /// Entschluesselt ein Envelope ohne den Tracker zu beruehren
    ///
    /// `KeyMismatch` wenn das Envelope keinen Wrapped Key fuer dieses
    /// Mitglied enthaelt (z.B. Nachrichten vor dem Beitritt).
    pub fn open(&self, envelope: &Envelope) -> ChatResult<Vec<u8>> {
        envelope.validieren()?;
        let blob = envelope
            .wrapped_key_for(&self.member_id)
            .ok_or(ChatError::KeyMismatch)?;
        let key = self.keystore.unwrap(&blob)?;
        let sealed = envelope.sealed()?;
        let klartext = decrypt_message(&sealed, &key, &envelope.associated_data())?;
        Ok(klartext)
    }

    /// Versiegelt einen Klartext fuer einen reservierten Sendeplatz
    ///
    /// Bindet Gruppe, Epoch, Sequenz, Absender und Anhang-Referenz ueber die
    /// Associated Data und wickelt den Nachrichten-Schluessel fuer jeden
    /// Empfaenger der Reservierung ein.
    pub fn versiegeln(
        &self,
        reservierung: &SendReservation,
        klartext: &[u8],
        attachment: Option<String>,
    ) -> ChatResult<Envelope> {
        let ad = AssociatedData {
            group_id: reservierung.group_id,
            epoch: reservierung.epoch,
            sequence: reservierung.sequence,
            sender_id: self.member_id,
            attachment,
        };
        let empfaenger: Vec<(MemberId, PublicKey)> = reservierung
            .recipients
            .iter()
            .map(|r| (r.member_id, r.public_key))
            .collect();
        let (sealed, key) = encrypt_message(klartext, &ad)?;
        let wrapped = wrap_for_members(&key, &empfaenger)?;
        let envelope = Envelope::zusammensetzen(MessageId::new(), &ad, sealed, wrapped, Utc::now());
        envelope.validieren()?;
        Ok(envelope)
    }

    /// Setzt den Ausgangspunkt der Lueckenerkennung (z.B. nach `Subscribed`)
    pub fn baseline(&mut self, group_id: GroupId, latest_sequence: u64) {
        self.tracker
            .insert(group_id, SequenceTracker::ab(latest_sequence));
    }

    /// Nimmt ein Envelope entgegen (Push oder Backlog)
    ///
    /// Duplikate werden nicht entschluesselt. Der Tracker wird erst nach
    /// erfolgreicher Authentifizierung fortgeschrieben: ein manipuliertes
    /// Envelope hinterlaesst weder Luecken noch eine gesehene Sequenz. Eine
    /// Luecke verhindert das Oeffnen nicht; sie wird im Ergebnis gemeldet.
    pub fn ingest(&mut self, envelope: &Envelope) -> ChatResult<Eingang> {
        let bereits_gesehen = self
            .tracker
            .get(&envelope.group_id)
            .is_some_and(|t| t.gesehen(envelope.sequence));
        if bereits_gesehen {
            debug!(message_id = %envelope.message_id, sequence = envelope.sequence, "Duplikat ignoriert");
            return Ok(Eingang::Duplikat {
                message_id: envelope.message_id,
                sequence: envelope.sequence,
            });
        }

        let klartext = self.open(envelope)?;

        let tracker = self.tracker.entry(envelope.group_id).or_default();
        let luecke = match tracker.beobachten(envelope.sequence) {
            Ok(_) => None,
            Err(ChatError::SequenceGap { expected, received }) => {
                warn!(group_id = %envelope.group_id, expected, received, "Sequenzluecke erkannt");
                Some((expected, received))
            }
            Err(e) => return Err(e),
        };
        Ok(Eingang::Neu {
            message_id: envelope.message_id,
            sequence: envelope.sequence,
            sender_id: envelope.sender_id,
            klartext,
            luecke,
        })
    }

    /// Fehlende Sequenzen einer Gruppe
    pub fn fehlende(&self, group_id: &GroupId) -> Vec<u64> {
        self.tracker
            .get(group_id)
            .map(|t| t.fehlend())
            .unwrap_or_default()
    }

    /// Ab hier lohnt ein Backlog-Abruf (`since`)
    pub fn backlog_ab(&self, group_id: &GroupId) -> u64 {
        self.tracker.get(group_id).map_or(0, |t| t.backlog_ab())
    }

    /// Gibt Luecken bis `bis` auf, nachdem der Backlog sie nicht liefern konnte
    pub fn luecken_abschliessen(&mut self, group_id: &GroupId, bis: u64) -> Vec<u64> {
        self.tracker
            .get_mut(group_id)
            .map(|t| t.aufgeben_bis(bis))
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for MemberAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemberAgent")
            .field("member_id", &self.member_id)
            .field("gruppen", &self.tracker.len())
            .finish_non_exhaustive()
    }
}
