//! Test-Hilfen fuer den Chat-Kern

mod agent_tests;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use encore_core::{GroupId, MemberId, MessageId};
use encore_db::{
    AppendOutcome, ChatStore, DbError, DbResult, EnvelopeStore, GroupEvent, GroupRecord,
    GroupStore, MemberRecord, SqliteDb,
};
use encore_protocol::{
    DeliveryRecord, DeliveryTransition, Envelope, ReactionRecord, WrappedKeyEntry,
};

use crate::{ChatConfig, ChatResult, ChatService, Member, MemberAgent};

pub(crate) async fn test_db() -> SqliteDb {
    SqliteDb::in_memory()
        .await
        .expect("In-Memory-DB konnte nicht geoeffnet werden")
}

pub(crate) async fn test_service() -> Arc<ChatService<SqliteDb>> {
    ChatService::neu(Arc::new(test_db().await), ChatConfig::default())
}

/// Erzeugt einen Agenten und registriert dessen Identitaet beim Service
pub(crate) async fn mitglied<S: ChatStore>(
    service: &Arc<ChatService<S>>,
    handle: &str,
) -> MemberAgent {
    let agent = MemberAgent::generieren(MemberId::new());
    service
        .register_member(Member {
            id: agent.member_id(),
            display_handle: handle.into(),
            public_key: agent.public_key(),
        })
        .await
        .expect("Registrierung fehlgeschlagen");
    agent
}

/// Reservieren, beim Absender versiegeln, einreichen
pub(crate) async fn senden<S: ChatStore>(
    service: &Arc<ChatService<S>>,
    group_id: GroupId,
    absender: &MemberAgent,
    klartext: &[u8],
    attachment: Option<String>,
) -> ChatResult<Envelope> {
    let platz = service.reserve_send(group_id, absender.member_id()).await?;
    let envelope = absender.versiegeln(&platz, klartext, attachment)?;
    service.send_message(absender.member_id(), envelope).await
}

/// Store-Wrapper, der Schreibfehler und langsame Schreibvorgaenge simuliert
pub(crate) struct AusfallStore {
    pub inner: SqliteDb,
    /// Anzahl der naechsten `append_envelope`-Aufrufe, die fehlschlagen
    pub fehlschlaege: AtomicU32,
    /// Verzoegerung vor jedem `append_envelope`
    pub verzoegerung: Option<Duration>,
    /// Verzoegerung nach einem erfolgreichen Schreibvorgang (Commit ist
    /// schon durch, nur die Antwort kommt zu spaet)
    pub verzoegerung_danach: Option<Duration>,
    pub aufrufe: AtomicU32,
}

impl AusfallStore {
    pub async fn neu(fehlschlaege: u32, verzoegerung: Option<Duration>) -> Self {
        Self {
            inner: test_db().await,
            fehlschlaege: AtomicU32::new(fehlschlaege),
            verzoegerung,
            verzoegerung_danach: None,
            aufrufe: AtomicU32::new(0),
        }
    }

    pub async fn langsame_antwort(verzoegerung_danach: Duration) -> Self {
        Self {
            verzoegerung_danach: Some(verzoegerung_danach),
            ..Self::neu(0, None).await
        }
    }
}

#[async_trait]
impl EnvelopeStore for AusfallStore {
    async fn append_envelope(
        &self,
        envelope: &Envelope,
        zustellungen: &[DeliveryTransition],
    ) -> DbResult<AppendOutcome> {
        self.aufrufe.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.verzoegerung {
            tokio::time::sleep(d).await;
        }
        let rest = self.fehlschlaege.load(Ordering::SeqCst);
        if rest > 0 {
            self.fehlschlaege.store(rest - 1, Ordering::SeqCst);
            return Err(DbError::intern("simulierter Schreibfehler"));
        }
        let ergebnis = self.inner.append_envelope(envelope, zustellungen).await;
        if let Some(d) = self.verzoegerung_danach {
            tokio::time::sleep(d).await;
        }
        ergebnis
    }

    async fn envelopes_since(
        &self,
        group_id: GroupId,
        since: u64,
        limit: u32,
        empfaenger: Option<MemberId>,
    ) -> DbResult<Vec<Envelope>> {
        self.inner
            .envelopes_since(group_id, since, limit, empfaenger)
            .await
    }

    async fn get_envelope(&self, message_id: MessageId) -> DbResult<Option<Envelope>> {
        self.inner.get_envelope(message_id).await
    }

    async fn wrapped_keys(&self, message_id: MessageId) -> DbResult<Vec<WrappedKeyEntry>> {
        self.inner.wrapped_keys(message_id).await
    }

    async fn append_transitions(&self, transitions: &[DeliveryTransition]) -> DbResult<()> {
        self.inner.append_transitions(transitions).await
    }

    async fn delivery_records(&self, message_id: MessageId) -> DbResult<Vec<DeliveryRecord>> {
        self.inner.delivery_records(message_id).await
    }

    async fn delivery_records_fuer(
        &self,
        group_id: GroupId,
        recipient: MemberId,
        since: u64,
    ) -> DbResult<Vec<DeliveryRecord>> {
        self.inner
            .delivery_records_fuer(group_id, recipient, since)
            .await
    }

    async fn append_reaction(&self, reaction: &ReactionRecord) -> DbResult<()> {
        self.inner.append_reaction(reaction).await
    }

    async fn reactions(&self, message_id: MessageId) -> DbResult<Vec<ReactionRecord>> {
        self.inner.reactions(message_id).await
    }

    async fn hoechste_sequenz(&self, group_id: GroupId) -> DbResult<u64> {
        self.inner.hoechste_sequenz(group_id).await
    }
}

#[async_trait]
impl GroupStore for AusfallStore {
    async fn mitglied_speichern(&self, member: &MemberRecord) -> DbResult<()> {
        self.inner.mitglied_speichern(member).await
    }

    async fn alle_mitglieder(&self) -> DbResult<Vec<MemberRecord>> {
        self.inner.alle_mitglieder().await
    }

    async fn gruppe_anlegen(&self, group: &GroupRecord) -> DbResult<()> {
        self.inner.gruppe_anlegen(group).await
    }

    async fn ereignis_anhaengen(&self, event: &GroupEvent) -> DbResult<()> {
        self.inner.ereignis_anhaengen(event).await
    }

    async fn alle_gruppen(&self) -> DbResult<Vec<GroupRecord>> {
        self.inner.alle_gruppen().await
    }

    async fn ereignisse(&self, group_id: GroupId) -> DbResult<Vec<GroupEvent>> {
        self.inner.ereignisse(group_id).await
    }
}
