//! Persistenz-Schnittstellen
//!
//! Der Speicher ist strikt append-only: Nachrichten und Wrapped Keys werden
//! genau einmal geschrieben, Zustell-Uebergaenge und Reaktionen werden nur
//! angehaengt. Gelesen wird nach Gruppe und Sequenzbereich.
//!
//! Neben dem [`EnvelopeStore`] haelt der [`GroupStore`] das
//! Mitglieder-Verzeichnis und die Gruppen-Roster, damit beides einen
//! Neustart uebersteht.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use encore_core::{GroupId, MemberId, MessageId};
use encore_crypto::PublicKey;
use encore_protocol::{
    DeliveryRecord, DeliveryTransition, Envelope, ReactionRecord, Visibility, WrappedKeyEntry,
};

use crate::error::DbResult;

/// Ergebnis eines `append_envelope`-Aufrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Envelope wurde neu geschrieben
    Neu,
    /// Envelope mit dieser Message-ID existierte bereits (Wiederholung)
    BereitsVorhanden,
}

/// Append-only Envelope-Speicher
///
/// Alle Futures sind `Send`, damit der Speicher aus beliebigen
/// Verbindungs-Tasks heraus benutzt werden kann.
#[async_trait]
pub trait EnvelopeStore: Send + Sync + 'static {
    /// Schreibt Envelope, alle Wrapped Keys und die `queued`-Uebergaenge
    /// in einer einzigen Transaktion
    ///
    /// Idempotent ueber die Message-ID: ein zweiter Aufruf mit derselben
    /// Nachricht liefert `BereitsVorhanden` und schreibt nichts.
    async fn append_envelope(
        &self,
        envelope: &Envelope,
        zustellungen: &[DeliveryTransition],
    ) -> DbResult<AppendOutcome>;

    /// Envelopes einer Gruppe mit `sequence > since`, aufsteigend
    ///
    /// Mit `empfaenger` nur Nachrichten, fuer die dieses Mitglied einen
    /// Wrapped Key besitzt.
    async fn envelopes_since(
        &self,
        group_id: GroupId,
        since: u64,
        limit: u32,
        empfaenger: Option<MemberId>,
    ) -> DbResult<Vec<Envelope>>;

    async fn get_envelope(&self, message_id: MessageId) -> DbResult<Option<Envelope>>;

    /// Wrapped Keys einer Nachricht in Sende-Reihenfolge
    async fn wrapped_keys(&self, message_id: MessageId) -> DbResult<Vec<WrappedKeyEntry>>;

    /// Haengt Zustell-Uebergaenge an; bereits vorhandene werden ignoriert
    async fn append_transitions(&self, transitions: &[DeliveryTransition]) -> DbResult<()>;

    /// Zustell-Datensaetze einer Nachricht (alle Empfaenger)
    async fn delivery_records(&self, message_id: MessageId) -> DbResult<Vec<DeliveryRecord>>;

    /// Zustell-Datensaetze eines Empfaengers in einer Gruppe ab `since`
    async fn delivery_records_fuer(
        &self,
        group_id: GroupId,
        recipient: MemberId,
        since: u64,
    ) -> DbResult<Vec<DeliveryRecord>>;

    async fn append_reaction(&self, reaction: &ReactionRecord) -> DbResult<()>;

    /// Reaktionen einer Nachricht in Einfuege-Reihenfolge
    async fn reactions(&self, message_id: MessageId) -> DbResult<Vec<ReactionRecord>>;

    /// Hoechste vergebene Sequenz einer Gruppe (0 wenn leer)
    async fn hoechste_sequenz(&self, group_id: GroupId) -> DbResult<u64>;
}

/// Gespeichertes Mitglied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRecord {
    pub id: MemberId,
    pub display_handle: String,
    pub public_key: PublicKey,
}

/// Anfangszustand einer Gruppe (Epoch 0)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub id: GroupId,
    pub creator: MemberId,
    pub visibility: Visibility,
    /// Weitere Mitglieder neben dem Ersteller, in Beitrittsreihenfolge
    pub initial_members: Vec<MemberId>,
    pub created_at: DateTime<Utc>,
}

/// Roster- oder Rollen-Aenderung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupAction {
    Add(MemberId),
    Remove(MemberId),
    Promote(MemberId),
    Demote(MemberId),
    Dissolve,
}

impl GroupAction {
    pub fn als_str(&self) -> &'static str {
        match self {
            Self::Add(_) => "add",
            Self::Remove(_) => "remove",
            Self::Promote(_) => "promote",
            Self::Demote(_) => "demote",
            Self::Dissolve => "dissolve",
        }
    }

    pub fn member(&self) -> Option<MemberId> {
        match self {
            Self::Add(m) | Self::Remove(m) | Self::Promote(m) | Self::Demote(m) => Some(*m),
            Self::Dissolve => None,
        }
    }
}

/// Ein Eintrag im Ereignis-Log einer Gruppe
///
/// `epoch` ist die Epoch *nach* dem Ereignis und eindeutig pro Gruppe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEvent {
    pub group_id: GroupId,
    pub epoch: u64,
    pub caller: MemberId,
    pub action: GroupAction,
    pub at: DateTime<Utc>,
}

/// Mitglieder und Gruppen-Roster
#[async_trait]
pub trait GroupStore: Send + Sync + 'static {
    /// Legt ein Mitglied an oder aktualisiert dessen Anzeigenamen
    ///
    /// Der oeffentliche Schluessel ist nach dem ersten Speichern fest.
    async fn mitglied_speichern(&self, member: &MemberRecord) -> DbResult<()>;

    async fn alle_mitglieder(&self) -> DbResult<Vec<MemberRecord>>;

    async fn gruppe_anlegen(&self, group: &GroupRecord) -> DbResult<()>;

    /// Haengt ein Ereignis an; eine bereits belegte Epoch ist ein Fehler
    async fn ereignis_anhaengen(&self, event: &GroupEvent) -> DbResult<()>;

    /// Alle Gruppen in Anlage-Reihenfolge
    async fn alle_gruppen(&self) -> DbResult<Vec<GroupRecord>>;

    /// Ereignisse einer Gruppe, aufsteigend nach Epoch
    async fn ereignisse(&self, group_id: GroupId) -> DbResult<Vec<GroupEvent>>;
}

/// Alles, was der Chat-Kern vom Speicher braucht
pub trait ChatStore: EnvelopeStore + GroupStore {}

impl<T: EnvelopeStore + GroupStore> ChatStore for T {}

/// Konfiguration fuer die Datenbankverbindung
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Verbindungs-URL (z.B. "sqlite://encore.db")
    pub url: String,
    /// Maximale Anzahl gleichzeitiger Verbindungen im Pool
    pub max_verbindungen: u32,
    /// Ob WAL-Modus aktiviert werden soll
    pub sqlite_wal: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://encore.db".into(),
            max_verbindungen: 5,
            sqlite_wal: true,
        }
    }
}
