//! Event-Broadcaster – Push-Queues und Gruppen-Abonnements
//!
//! Jede angemeldete Verbindung bekommt eine begrenzte Queue. Eingereiht wird
//! nur mit `try_send`:
//! - Queue voll: Push wird verworfen, der Empfaenger holt ihn ueber den
//!   Backlog nach (der Zustell-Datensatz bleibt `queued`)
//! - Queue geschlossen: Verbindung ist weg, Registrierung wird entfernt
//!
//! Pro Mitglied ist hoechstens eine Verbindung registriert; eine neue
//! Anmeldung ersetzt die alte.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use encore_core::{GroupId, MemberId};
use encore_protocol::ControlMessage;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// ClientSender
// ---------------------------------------------------------------------------

/// Ergebnis eines Einreihungsversuchs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Einreihung {
    Eingereiht,
    /// Queue voll, Push verworfen
    Verworfen,
    /// Keine (offene) Verbindung
    NichtVerbunden,
}

/// Handle auf die Push-Queue einer Verbindung
#[derive(Clone, Debug)]
pub struct ClientSender {
    pub member_id: MemberId,
    /// Kennung der Verbindung, zu der die Queue gehoert
    pub verbindung: u64,
    pub tx: mpsc::Sender<ControlMessage>,
}

impl ClientSender {
    /// Reiht eine Nachricht nicht-blockierend ein
    pub fn senden(&self, nachricht: ControlMessage) -> Einreihung {
        match self.tx.try_send(nachricht) {
            Ok(()) => Einreihung::Eingereiht,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(member_id = %self.member_id, "Push-Queue voll – Nachricht verworfen");
                Einreihung::Verworfen
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(member_id = %self.member_id, "Push-Queue geschlossen (Verbindung getrennt)");
                Einreihung::NichtVerbunden
            }
        }
    }
}

// ---------------------------------------------------------------------------
// EventBroadcaster
// ---------------------------------------------------------------------------

/// Zentraler Broadcaster fuer alle angemeldeten Verbindungen
///
/// Thread-safe via Arc + DashMap. Clone teilt den inneren Zustand.
#[derive(Clone)]
pub struct EventBroadcaster {
    inner: Arc<EventBroadcasterInner>,
}

struct EventBroadcasterInner {
    queue_groesse: usize,
    naechste_verbindung: AtomicU64,
    /// Client-Sender, indiziert nach MemberId
    clients: DashMap<MemberId, ClientSender>,
    /// Abonnements: group_id -> Mitglieder mit Live-Feed
    abonnements: DashMap<GroupId, HashSet<MemberId>>,
}

impl EventBroadcaster {
    /// Erstellt einen neuen EventBroadcaster
    pub fn neu(queue_groesse: usize) -> Self {
        Self {
            inner: Arc::new(EventBroadcasterInner {
                queue_groesse: queue_groesse.max(1),
                naechste_verbindung: AtomicU64::new(1),
                clients: DashMap::new(),
                abonnements: DashMap::new(),
            }),
        }
    }

    /// Registriert eine Verbindung und gibt Kennung und Push-Queue zurueck
    ///
    /// Eine bestehende Registrierung desselben Mitglieds wird ersetzt; deren
    /// Abonnements verfallen.
    pub fn client_registrieren(&self, member_id: MemberId) -> (u64, mpsc::Receiver<ControlMessage>) {
        let (tx, rx) = mpsc::channel(self.inner.queue_groesse);
        let verbindung = self.inner.naechste_verbindung.fetch_add(1, Ordering::Relaxed);
        let sender = ClientSender {
            member_id,
            verbindung,
            tx,
        };
        if self.inner.clients.insert(member_id, sender).is_some() {
            self.abonnements_entfernen(&member_id);
            tracing::debug!(member_id = %member_id, "Vorherige Verbindung ersetzt");
        }
        tracing::debug!(member_id = %member_id, verbindung, "Client im Broadcaster registriert");
        (verbindung, rx)
    }

    /// Entfernt die Registrierung einer bestimmten Verbindung
    ///
    /// Hat sich das Mitglied inzwischen neu angemeldet, bleibt die neue
    /// Registrierung unberuehrt.
    pub fn client_entfernen(&self, member_id: &MemberId, verbindung: u64) {
        let entfernt = self
            .inner
            .clients
            .remove_if(member_id, |_, s| s.verbindung == verbindung)
            .is_some();
        if entfernt {
            self.abonnements_entfernen(member_id);
            tracing::debug!(member_id = %member_id, verbindung, "Client aus Broadcaster entfernt");
        }
    }

    fn abonnements_entfernen(&self, member_id: &MemberId) {
        self.inner.abonnements.iter_mut().for_each(|mut entry| {
            entry.value_mut().remove(member_id);
        });
        self.inner.abonnements.retain(|_, mitglieder| !mitglieder.is_empty());
    }

    /// Abonniert den Live-Feed einer Gruppe
    pub fn abonnieren(&self, member_id: MemberId, group_id: GroupId) {
        self.inner
            .abonnements
            .entry(group_id)
            .or_default()
            .insert(member_id);
    }

    /// Beendet ein Abonnement; `false` wenn keins bestand
    pub fn abbestellen(&self, member_id: &MemberId, group_id: &GroupId) -> bool {
        let entfernt = self
            .inner
            .abonnements
            .get_mut(group_id)
            .map(|mut m| m.remove(member_id))
            .unwrap_or(false);
        self.inner
            .abonnements
            .remove_if(group_id, |_, mitglieder| mitglieder.is_empty());
        entfernt
    }

    pub fn ist_abonniert(&self, member_id: &MemberId, group_id: &GroupId) -> bool {
        self.inner
            .abonnements
            .get(group_id)
            .map(|m| m.contains(member_id))
            .unwrap_or(false)
    }

    /// Sendet eine Nachricht an ein einzelnes Mitglied
    pub fn an_mitglied_senden(&self, member_id: &MemberId, nachricht: ControlMessage) -> Einreihung {
        let ergebnis = match self.inner.clients.get(member_id) {
            Some(sender) => sender.senden(nachricht),
            None => return Einreihung::NichtVerbunden,
        };
        if ergebnis == Einreihung::NichtVerbunden {
            // Queue geschlossen: Registrierung ist verwaist
            self.inner
                .clients
                .remove_if(member_id, |_, s| s.tx.is_closed());
            self.abonnements_entfernen(member_id);
        }
        ergebnis
    }

    /// Sendet an alle Abonnenten einer Gruppe aus `empfaenger`, ausser `ausgeschlossen`
    ///
    /// Gibt die Mitglieder zurueck, fuer die eingereiht wurde.
    pub fn an_abonnenten_senden(
        &self,
        group_id: &GroupId,
        empfaenger: impl IntoIterator<Item = MemberId>,
        ausgeschlossen: Option<&MemberId>,
        nachricht: &ControlMessage,
    ) -> Vec<MemberId> {
        let abonnenten = match self.inner.abonnements.get(group_id) {
            Some(m) => m.clone(),
            None => return Vec::new(),
        };

        empfaenger
            .into_iter()
            .filter(|m| Some(m) != ausgeschlossen && abonnenten.contains(m))
            .filter(|m| self.an_mitglied_senden(m, nachricht.clone()) == Einreihung::Eingereiht)
            .collect()
    }

    /// Gibt die Anzahl der registrierten Clients zurueck
    pub fn client_anzahl(&self) -> usize {
        self.inner.clients.len()
    }

    /// Prueft ob ein Mitglied eine registrierte Verbindung hat
    pub fn ist_registriert(&self, member_id: &MemberId) -> bool {
        self.inner.clients.contains_key(member_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
