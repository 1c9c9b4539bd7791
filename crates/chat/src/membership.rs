//! Group Membership Manager
//!
//! Zustandsmaschine pro Gruppe:
//!
//! ```text
//!   Active --add/remove/promote/demote--> Active
//!   Active --dissolve / letztes Mitglied geht--> Dissolved (terminal)
//! ```
//!
//! Jede Roster- oder Rollen-Aenderung erhoeht die Epoch. Eine `Group` wird
//! nur ueber den Mutex ihrer Registry erreicht; dieselbe Sperre schuetzt die
//! Sequenzvergabe, damit kein Versand einen veralteten Roster sieht.
//!
//! Sequenzen werden als Reservierungen vergeben: der Absender versiegelt
//! beim Client und reicht das Envelope fuer seine reservierte Sequenz ein.
//! Eine Epoch-Aenderung verwirft alle offenen Reservierungen.
//!
//! Invarianten:
//! - Admins sind eine Teilmenge der Mitglieder
//! - eine nicht-leere Gruppe hat mindestens einen Admin

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use encore_core::{GroupId, MemberId};
use encore_db::{GroupAction, GroupEvent, GroupRecord};
use encore_protocol::{GroupInfo, Visibility};
use tracing::{debug, info};

use crate::error::{ChatError, ChatResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Active,
    Dissolved,
}

/// Offener Sendeplatz
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservierung {
    pub sender: MemberId,
    pub epoch: u64,
    pub laeuft_ab: DateTime<Utc>,
}

/// Zustand einer einzelnen Gruppe
#[derive(Debug, Clone)]
pub struct Group {
    id: GroupId,
    visibility: Visibility,
    created_at: DateTime<Utc>,
    /// Mitglieder in Beitrittsreihenfolge
    members: Vec<MemberId>,
    admins: Vec<MemberId>,
    epoch: u64,
    state: GroupState,
    /// Zuletzt vergebene Sequenz (0 = noch keine)
    letzte_sequenz: u64,
    reservierungen: BTreeMap<u64, Reservierung>,
}

impl Group {
    /// Neue Gruppe; der Ersteller ist erster Admin, Epoch startet bei 0
    pub fn neu(
        id: GroupId,
        creator: MemberId,
        visibility: Visibility,
        weitere: &[MemberId],
        created_at: DateTime<Utc>,
    ) -> Self {
        let mut members = vec![creator];
        for m in weitere {
            if !members.contains(m) {
                members.push(*m);
            }
        }
        Self {
            id,
            visibility,
            created_at,
            members,
            admins: vec![creator],
            epoch: 0,
            state: GroupState::Active,
            letzte_sequenz: 0,
            reservierungen: BTreeMap::new(),
        }
    }

    /// Anfangszustand aus dem Speicher (Epoch 0, noch ohne Ereignisse)
    pub fn aus_record(record: &GroupRecord) -> Self {
        Self::neu(
            record.id,
            record.creator,
            record.visibility,
            &record.initial_members,
            record.created_at,
        )
    }

    /// Spielt ein gespeichertes Ereignis erneut ab
    ///
    /// Das Ergebnis muss genau die gespeicherte Epoch treffen, sonst passt
    /// das Log nicht zum Anfangszustand.
    pub fn ereignis_anwenden(&mut self, event: &GroupEvent) -> ChatResult<()> {
        let caller = &event.caller;
        let epoch = match event.action {
            GroupAction::Add(m) => self.add_member(caller, m)?,
            GroupAction::Remove(m) => self.remove_member(caller, m)?,
            GroupAction::Promote(m) => self.promote_admin(caller, m)?,
            GroupAction::Demote(m) => self.demote_admin(caller, m)?,
            GroupAction::Dissolve => self.dissolve(caller)?,
        };
        if epoch != event.epoch {
            return Err(ChatError::Corrupt(format!(
                "Ereignis-Log von {} passt nicht: Epoch {epoch} statt {}",
                self.id, event.epoch
            )));
        }
        Ok(())
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn members(&self) -> &[MemberId] {
        &self.members
    }

    pub fn ist_mitglied(&self, member: &MemberId) -> bool {
        self.members.contains(member)
    }

    pub fn ist_admin(&self, member: &MemberId) -> bool {
        self.admins.contains(member)
    }

    /// Fehler wenn die Gruppe aufgeloest ist
    pub fn aktiv_pruefen(&self) -> ChatResult<()> {
        match self.state {
            GroupState::Active => Ok(()),
            GroupState::Dissolved => Err(ChatError::GroupDissolved(self.id)),
        }
    }

    /// Fehler wenn `member` nicht im aktuellen Roster ist
    pub fn mitglied_pruefen(&self, member: &MemberId) -> ChatResult<()> {
        if self.ist_mitglied(member) {
            Ok(())
        } else {
            Err(ChatError::StaleMembership {
                member: *member,
                group: self.id,
            })
        }
    }

    fn admin_pruefen(&self, caller: &MemberId) -> ChatResult<()> {
        self.mitglied_pruefen(caller)?;
        if self.ist_admin(caller) {
            Ok(())
        } else {
            Err(ChatError::ungueltig(format!(
                "{caller} ist kein Admin der Gruppe {}",
                self.id
            )))
        }
    }

    fn epoch_erhoehen(&mut self, grund: &str) -> u64 {
        self.epoch += 1;
        if !self.reservierungen.is_empty() {
            debug!(group_id = %self.id, verworfen = self.reservierungen.len(), "Offene Reservierungen verworfen");
            self.reservierungen.clear();
        }
        info!(group_id = %self.id, epoch = self.epoch, grund, "Epoch erhoeht");
        self.epoch
    }

    /// Mitglied hinzufuegen (nur Admins)
    ///
    /// Das neue Mitglied erhaelt nur Wrapped Keys fuer Nachrichten ab der
    /// neuen Epoch.
    pub fn add_member(&mut self, caller: &MemberId, member: MemberId) -> ChatResult<u64> {
        self.aktiv_pruefen()?;
        self.admin_pruefen(caller)?;
        if self.ist_mitglied(&member) {
            return Err(ChatError::ungueltig(format!("{member} ist bereits Mitglied")));
        }
        self.members.push(member);
        Ok(self.epoch_erhoehen("mitglied_hinzugefuegt"))
    }

    /// Mitglied entfernen (Admin oder Selbst-Austritt)
    ///
    /// Der letzte Admin kann nicht gehen, solange noch andere Mitglieder
    /// da sind. Verlaesst das letzte Mitglied die Gruppe, wird sie aufgeloest.
    pub fn remove_member(&mut self, caller: &MemberId, member: MemberId) -> ChatResult<u64> {
        self.aktiv_pruefen()?;
        if *caller == member {
            self.mitglied_pruefen(caller)?;
        } else {
            self.admin_pruefen(caller)?;
        }
        if !self.ist_mitglied(&member) {
            return Err(ChatError::ungueltig(format!("{member} ist kein Mitglied")));
        }

        if self.members.len() == 1 {
            return self.aufloesen_intern();
        }
        if self.ist_admin(&member) && self.admins.len() == 1 {
            return Err(ChatError::ungueltig(
                "Der letzte Admin kann nicht entfernt werden",
            ));
        }

        self.members.retain(|m| *m != member);
        self.admins.retain(|m| *m != member);
        Ok(self.epoch_erhoehen("mitglied_entfernt"))
    }

    /// Mitglied zum Admin befoerdern (nur Admins)
    pub fn promote_admin(&mut self, caller: &MemberId, member: MemberId) -> ChatResult<u64> {
        self.aktiv_pruefen()?;
        self.admin_pruefen(caller)?;
        self.mitglied_pruefen(&member)?;
        if self.ist_admin(&member) {
            return Err(ChatError::ungueltig(format!("{member} ist bereits Admin")));
        }
        self.admins.push(member);
        Ok(self.epoch_erhoehen("admin_befoerdert"))
    }

    /// Admin-Rolle entziehen (nur Admins, nicht dem letzten)
    pub fn demote_admin(&mut self, caller: &MemberId, member: MemberId) -> ChatResult<u64> {
        self.aktiv_pruefen()?;
        self.admin_pruefen(caller)?;
        if !self.ist_admin(&member) {
            return Err(ChatError::ungueltig(format!("{member} ist kein Admin")));
        }
        if self.admins.len() == 1 {
            return Err(ChatError::ungueltig(
                "Dem letzten Admin kann die Rolle nicht entzogen werden",
            ));
        }
        self.admins.retain(|m| *m != member);
        Ok(self.epoch_erhoehen("admin_zurueckgestuft"))
    }

    /// Gruppe aufloesen (nur Admins, irreversibel)
    pub fn dissolve(&mut self, caller: &MemberId) -> ChatResult<u64> {
        self.aktiv_pruefen()?;
        self.admin_pruefen(caller)?;
        self.aufloesen_intern()
    }

    fn aufloesen_intern(&mut self) -> ChatResult<u64> {
        self.members.clear();
        self.admins.clear();
        self.state = GroupState::Dissolved;
        Ok(self.epoch_erhoehen("aufgeloest"))
    }

    /// Sequenz, die der naechste Versand bekommt (`None` wenn erschoepft)
    pub fn naechste_sequenz(&self) -> Option<u64> {
        self.letzte_sequenz.checked_add(1)
    }

    /// Vergibt die naechste Sequenz als Reservierung fuer `sender`
    ///
    /// Die Sequenz gilt ab hier als verbraucht, auch wenn nie ein Envelope
    /// eintrifft.
    pub fn reservieren(&mut self, sender: MemberId, laeuft_ab: DateTime<Utc>) -> ChatResult<u64> {
        self.aktiv_pruefen()?;
        self.mitglied_pruefen(&sender)?;
        let sequenz = self.naechste_sequenz().ok_or_else(|| {
            ChatError::ungueltig(format!("Sequenzraum der Gruppe {} erschoepft", self.id))
        })?;
        self.letzte_sequenz = sequenz;
        self.reservierungen.insert(
            sequenz,
            Reservierung {
                sender,
                epoch: self.epoch,
                laeuft_ab,
            },
        );
        Ok(sequenz)
    }

    pub fn reservierung(&self, sequenz: u64) -> Option<&Reservierung> {
        self.reservierungen.get(&sequenz)
    }

    pub fn reservierung_entfernen(&mut self, sequenz: u64) -> Option<Reservierung> {
        self.reservierungen.remove(&sequenz)
    }

    /// Entfernt abgelaufene Reservierungen; ihre Sequenzen bleiben Luecken
    pub fn abgelaufene_entfernen(&mut self, jetzt: DateTime<Utc>) -> usize {
        let vorher = self.reservierungen.len();
        self.reservierungen.retain(|_, r| r.laeuft_ab > jetzt);
        vorher - self.reservierungen.len()
    }

    /// Ablauf der aeltesten offenen Reservierung vor `sequenz`
    ///
    /// Solange es eine gibt, muss ein spaeteres Envelope warten, damit
    /// Pushes in Sequenzreihenfolge hinausgehen.
    pub fn offen_vor(&self, sequenz: u64) -> Option<DateTime<Utc>> {
        self.reservierungen
            .range(..sequenz)
            .next()
            .map(|(_, r)| r.laeuft_ab)
    }

    pub fn offene_reservierungen(&self) -> usize {
        self.reservierungen.len()
    }

    /// Markiert eine Sequenz als verbraucht (gespeichert oder verworfen)
    pub fn sequenz_vergeben(&mut self, sequenz: u64) {
        self.letzte_sequenz = self.letzte_sequenz.max(sequenz);
    }

    pub fn letzte_sequenz(&self) -> u64 {
        self.letzte_sequenz
    }

    pub fn info(&self) -> GroupInfo {
        GroupInfo {
            group_id: self.id,
            visibility: self.visibility,
            members: self.members.clone(),
            admins: self.admins.clone(),
            epoch: self.epoch,
            created_at: self.created_at,
            dissolved: self.state == GroupState::Dissolved,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
