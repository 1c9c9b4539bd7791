//! Delivery Tracker
//!
//! Zustand pro (Nachricht, Empfaenger): `queued -> delivered -> read`.
//! Uebergaenge werden nur angehaengt; der Zustand ist das Maximum aller
//! angehaengten Uebergaenge. Doppelte oder verspaetete Bestaetigungen
//! aendern daher nichts.
//!
//! Auf der Empfaengerseite erkennt der [`SequenceTracker`] Luecken in den
//! Sequenznummern einer Gruppe, ohne dass dafuer entschluesselt wird.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use encore_core::{MemberId, MessageId};
use encore_protocol::{DeliveryRecord, DeliveryState, DeliveryTransition};
use tracing::warn;

use crate::error::{ChatError, ChatResult};

/// Uebergaenge, die noetig sind um von `aktuell` nach `ziel` zu kommen
///
/// Leer, wenn `ziel` schon erreicht oder ueberholt ist. Ein Sprung von
/// `queued` nach `read` erzeugt auch den `delivered`-Uebergang mit
/// demselben Zeitstempel.
pub fn uebergaenge(
    message_id: MessageId,
    recipient_id: MemberId,
    aktuell: Option<DeliveryState>,
    ziel: DeliveryState,
    at: DateTime<Utc>,
) -> Vec<DeliveryTransition> {
    ziel.pfad()
        .iter()
        .filter(|s| aktuell.map_or(true, |a| **s > a))
        .map(|state| DeliveryTransition {
            message_id,
            recipient_id,
            state: *state,
            at,
        })
        .collect()
}

/// Wendet Uebergaenge auf einen Datensatz im Speicher an
///
/// Gibt `true` zurueck wenn sich der Zustand erhoeht hat.
pub fn anwenden(record: &mut DeliveryRecord, transitions: &[DeliveryTransition]) -> bool {
    let vorher = record.state;
    for t in transitions {
        match t.state {
            DeliveryState::Queued => {}
            DeliveryState::Delivered => {
                record.delivered_at.get_or_insert(t.at);
            }
            DeliveryState::Read => {
                record.read_at.get_or_insert(t.at);
            }
        }
        record.state = record.state.max(t.state);
    }
    record.state > vorher
}

// ---------------------------------------------------------------------------
// SequenceTracker
// ---------------------------------------------------------------------------

/// Hoechstzahl gemerkter fehlender Sequenzen pro Gruppe
const MAX_FEHLEND: usize = 4096;

/// Ergebnis von [`SequenceTracker::beobachten`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beobachtung {
    /// Noch nicht gesehen (auch: eine zuvor fehlende Sequenz ist eingetroffen)
    Fresh,
    /// Bereits gesehen
    Duplicate,
}

/// Lueckenerkennung fuer die Sequenznummern einer Gruppe
///
/// Gespeichert wird die hoechste gesehene Sequenz statt der naechsten
/// erwarteten, damit auch `u64::MAX` ohne Ueberlauf abbildbar bleibt.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    /// Hoechste gesehene Sequenz (0 = noch keine)
    letzte: u64,
    fehlend: BTreeSet<u64>,
}

impl SequenceTracker {
    /// Tracker, der `letzte` und alles davor als bekannt betrachtet
    pub fn ab(letzte: u64) -> Self {
        Self {
            letzte,
            fehlend: BTreeSet::new(),
        }
    }

    /// `true` wenn `seq` bereits beobachtet wurde (veraendert nichts)
    pub fn gesehen(&self, seq: u64) -> bool {
        seq <= self.letzte && !self.fehlend.contains(&seq)
    }

    /// Registriert eine empfangene Sequenz
    ///
    /// Eine Luecke liefert `Err(SequenceGap)`; die empfangene Sequenz gilt
    /// trotzdem als gesehen und die fehlenden werden vorgemerkt.
    pub fn beobachten(&mut self, seq: u64) -> ChatResult<Beobachtung> {
        if seq <= self.letzte {
            return Ok(if self.fehlend.remove(&seq) {
                Beobachtung::Fresh
            } else {
                Beobachtung::Duplicate
            });
        }

        // seq > letzte, also kein Ueberlauf
        let expected = self.letzte + 1;
        self.letzte = seq;
        if seq == expected {
            return Ok(Beobachtung::Fresh);
        }

        let mut vorgemerkt = 0u64;
        for fehlt in expected..seq {
            if self.fehlend.len() >= MAX_FEHLEND {
                break;
            }
            self.fehlend.insert(fehlt);
            vorgemerkt += 1;
        }
        if vorgemerkt < seq - expected {
            warn!(expected, received = seq, "Sequenzluecke zu gross, nicht alle Luecken vorgemerkt");
        }
        Err(ChatError::SequenceGap {
            expected,
            received: seq,
        })
    }

    /// Noch fehlende Sequenzen, aufsteigend
    pub fn fehlend(&self) -> Vec<u64> {
        self.fehlend.iter().copied().collect()
    }

    /// Kleinste fehlende Sequenz minus eins: ab hier lohnt ein Backlog-Abruf
    pub fn backlog_ab(&self) -> u64 {
        self.fehlend
            .iter()
            .next()
            .map_or(self.letzte, |erste| erste.saturating_sub(1))
    }

    /// Gibt fehlende Sequenzen bis einschliesslich `bis` auf
    ///
    /// Fuer Sequenzen, die auch der Backlog nicht liefert (verworfene
    /// Sendeversuche). Gibt die aufgegebenen Sequenzen zurueck.
    pub fn aufgeben_bis(&mut self, bis: u64) -> Vec<u64> {
        let rest = match bis.checked_add(1) {
            Some(grenze) => self.fehlend.split_off(&grenze),
            None => BTreeSet::new(),
        };
        let aufgegeben = std::mem::replace(&mut self.fehlend, rest);
        aufgegeben.into_iter().collect()
    }

    /// Hoechste gesehene Sequenz
    pub fn letzte(&self) -> u64 {
        self.letzte
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
