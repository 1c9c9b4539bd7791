//! ChatService – Gruppen verwalten, Envelopes annehmen, Zustellung verfolgen
//!
//! ## Sende-Pipeline
//! Der Server sieht nie Klartext. Versiegelt wird beim Absender:
//!
//! 1. `reserve_send`: Gruppen-Mutex sperren, naechste Sequenz reservieren,
//!    Epoch und Roster (mit oeffentlichen Schluesseln) zurueckgeben
//! 2. Client verschluesselt mit frischem Schluessel (Associated Data:
//!    Gruppe, Epoch, Sequenz, Absender, Anhang) und wickelt ihn fuer jeden
//!    Empfaenger der Reservierung ein
//! 3. `send_message`: Gruppen-Mutex sperren, Reservierung, Epoch und
//!    Empfaengermenge gegen den aktuellen Roster pruefen
//! 4. Envelope + Wrapped Keys + `queued`-Datensaetze atomar speichern
//! 5. Live-Zustellung noch unter der Sperre, dann freigeben
//!
//! Eine reservierte Sequenz ist in jedem Fall verbraucht. Laeuft die
//! Reservierung ab oder scheitert Schritt 3/4, sehen Empfaenger eine Luecke
//! statt einer wiederverwendeten Nummer. Ein Envelope mit hoeherer Sequenz
//! wartet, bis alle frueheren Reservierungen eingereicht oder abgelaufen
//! sind, damit Pushes in Sequenzreihenfolge hinausgehen.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use encore_core::{GroupId, MemberId, MessageId};
use encore_db::{AppendOutcome, ChatStore, GroupAction, GroupEvent, GroupRecord, MemberRecord};
use encore_protocol::{
    reaktionen_zusammenfassen, DeliveryRecord, DeliveryState, DeliveryTransition, Envelope,
    GroupInfo, ReactionRecord, ReactionSummary, RecipientKey, SendReservation, Visibility,
};
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::delivery;
use crate::directory::MemberDirectory;
use crate::error::{ChatError, ChatResult};
use crate::membership::{Group, Reservierung};
use crate::registry::GroupRegistry;
use crate::types::{AckErgebnis, Backlog, ChatConfig, Member};

/// Zentraler Einstiegspunkt des Gruppen-Messaging-Kerns
pub struct ChatService<S: ChatStore> {
    store: Arc<S>,
    verzeichnis: MemberDirectory,
    gruppen: GroupRegistry,
    config: ChatConfig,
    /// Weckt Einreichungen, die auf eine fruehere Sequenz warten
    versand_fertig: Notify,
}

impl<S: ChatStore> ChatService<S> {
    /// Erstellt einen leeren ChatService
    pub fn neu(store: Arc<S>, config: ChatConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            verzeichnis: MemberDirectory::neu(),
            gruppen: GroupRegistry::neu(),
            config,
            versand_fertig: Notify::new(),
        })
    }

    /// Erstellt einen ChatService mit dem gespeicherten Zustand
    ///
    /// Mitglieder werden neu registriert, Gruppen aus Anfangszustand und
    /// Ereignis-Log rekonstruiert. Der Sequenzzaehler jeder Gruppe beginnt
    /// hinter der hoechsten gespeicherten Sequenz.
    pub async fn laden(store: Arc<S>, config: ChatConfig) -> ChatResult<Arc<Self>> {
        let service = Self::neu(store, config);

        for record in service.store.alle_mitglieder().await? {
            service.verzeichnis.registrieren(Member {
                id: record.id,
                display_handle: record.display_handle,
                public_key: record.public_key,
            })?;
        }

        for record in service.store.alle_gruppen().await? {
            let mut gruppe = Group::aus_record(&record);
            for ereignis in service.store.ereignisse(record.id).await? {
                gruppe.ereignis_anwenden(&ereignis)?;
            }
            gruppe.sequenz_vergeben(service.store.hoechste_sequenz(record.id).await?);
            service.gruppen.einfuegen(gruppe);
        }

        info!(
            mitglieder = service.verzeichnis.anzahl(),
            gruppen = service.gruppen.anzahl(),
            "Zustand aus dem Speicher geladen"
        );
        Ok(service)
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Mitglieder
    // -----------------------------------------------------------------------

    /// Registriert eine bereits authentifizierte Identitaet
    ///
    /// Erst gespeichert, dann im Verzeichnis sichtbar.
    pub async fn register_member(&self, member: Member) -> ChatResult<()> {
        self.verzeichnis.registrierbar(&member)?;
        self.store
            .mitglied_speichern(&MemberRecord {
                id: member.id,
                display_handle: member.display_handle.clone(),
                public_key: member.public_key,
            })
            .await?;
        self.verzeichnis.registrieren(member)
    }

    pub fn member(&self, id: &MemberId) -> Option<Member> {
        self.verzeichnis.get(id)
    }

    fn bekannt_pruefen(&self, id: &MemberId) -> ChatResult<()> {
        if self.verzeichnis.ist_bekannt(id) {
            Ok(())
        } else {
            Err(ChatError::UnknownMember(*id))
        }
    }

    // -----------------------------------------------------------------------
    // Gruppen
    // -----------------------------------------------------------------------

    /// Legt eine Gruppe an; der Ersteller wird erster Admin
    pub async fn create_group(
        &self,
        creator: MemberId,
        visibility: Visibility,
        initial_members: &[MemberId],
    ) -> ChatResult<GroupInfo> {
        self.bekannt_pruefen(&creator)?;
        for m in initial_members {
            self.bekannt_pruefen(m)?;
        }

        let gruppe = Group::neu(GroupId::new(), creator, visibility, initial_members, Utc::now());
        let info = gruppe.info();
        self.store
            .gruppe_anlegen(&GroupRecord {
                id: info.group_id,
                creator,
                visibility,
                initial_members: info.members[1..].to_vec(),
                created_at: info.created_at,
            })
            .await?;
        self.gruppen.einfuegen(gruppe);

        info!(
            group_id = %info.group_id,
            creator = %creator,
            mitglieder = info.members.len(),
            "Gruppe angelegt"
        );
        Ok(info)
    }

    pub async fn group_info(&self, group_id: GroupId) -> ChatResult<GroupInfo> {
        let gruppe = self.gruppen.get(&group_id)?;
        let info = gruppe.lock().await.info();
        Ok(info)
    }

    /// Zuletzt vergebene Sequenz (auch verworfene Sendeversuche zaehlen)
    pub async fn letzte_sequenz(&self, group_id: GroupId) -> ChatResult<u64> {
        let gruppe = self.gruppen.get(&group_id)?;
        let stand = gruppe.lock().await.letzte_sequenz();
        Ok(stand)
    }

    pub async fn add_member(
        &self,
        group_id: GroupId,
        caller: MemberId,
        member: MemberId,
    ) -> ChatResult<GroupInfo> {
        self.bekannt_pruefen(&member)?;
        self.membership_aendern(group_id, caller, GroupAction::Add(member))
            .await
    }

    pub async fn remove_member(
        &self,
        group_id: GroupId,
        caller: MemberId,
        member: MemberId,
    ) -> ChatResult<GroupInfo> {
        self.membership_aendern(group_id, caller, GroupAction::Remove(member))
            .await
    }

    pub async fn promote_admin(
        &self,
        group_id: GroupId,
        caller: MemberId,
        member: MemberId,
    ) -> ChatResult<GroupInfo> {
        self.membership_aendern(group_id, caller, GroupAction::Promote(member))
            .await
    }

    pub async fn demote_admin(
        &self,
        group_id: GroupId,
        caller: MemberId,
        member: MemberId,
    ) -> ChatResult<GroupInfo> {
        self.membership_aendern(group_id, caller, GroupAction::Demote(member))
            .await
    }

    /// Loest eine Gruppe auf (irreversibel)
    pub async fn dissolve_group(&self, group_id: GroupId, caller: MemberId) -> ChatResult<GroupInfo> {
        self.membership_aendern(group_id, caller, GroupAction::Dissolve)
            .await
    }

    /// Wendet eine Aenderung auf eine Kopie an, speichert das Ereignis und
    /// uebernimmt erst dann den neuen Zustand
    async fn membership_aendern(
        &self,
        group_id: GroupId,
        caller: MemberId,
        action: GroupAction,
    ) -> ChatResult<GroupInfo> {
        let gruppe = self.gruppen.get(&group_id)?;
        let mut g = gruppe.lock().await;

        let ereignis = GroupEvent {
            group_id,
            epoch: g.epoch() + 1,
            caller,
            action,
            at: Utc::now(),
        };
        let mut neu = g.clone();
        neu.ereignis_anwenden(&ereignis)?;
        self.store.ereignis_anhaengen(&ereignis).await?;
        *g = neu;
        let info = g.info();
        drop(g);

        // Offene Reservierungen sind mit der alten Epoch verfallen
        self.versand_fertig.notify_waiters();
        Ok(info)
    }

    // -----------------------------------------------------------------------
    // Versand
    // -----------------------------------------------------------------------

    /// Reserviert die naechste Sequenz einer Gruppe fuer `sender`
    ///
    /// Die Antwort enthaelt alles, was der Client zum Versiegeln braucht.
    pub async fn reserve_send(
        &self,
        group_id: GroupId,
        sender: MemberId,
    ) -> ChatResult<SendReservation> {
        self.bekannt_pruefen(&sender)?;
        let dauer = chrono::Duration::from_std(self.config.reservierung_gueltig)
            .map_err(|e| ChatError::Intern(format!("Reservierungsdauer ungueltig: {e}")))?;

        let gruppe = self.gruppen.get(&group_id)?;
        let mut g = gruppe.lock().await;
        let jetzt = Utc::now();
        if g.abgelaufene_entfernen(jetzt) > 0 {
            self.versand_fertig.notify_waiters();
        }
        g.aktiv_pruefen()?;
        g.mitglied_pruefen(&sender)?;

        let recipients = g
            .members()
            .iter()
            .map(|m| {
                Ok(RecipientKey {
                    member_id: *m,
                    public_key: self.verzeichnis.public_key(m)?,
                })
            })
            .collect::<ChatResult<Vec<_>>>()?;
        let expires_at = jetzt + dauer;
        let sequence = g.reservieren(sender, expires_at)?;

        debug!(group_id = %group_id, sender = %sender, epoch = g.epoch(), sequence, "Sequenz reserviert");
        Ok(SendReservation {
            group_id,
            epoch: g.epoch(),
            sequence,
            recipients,
            expires_at,
        })
    }

    /// Nimmt ein beim Client versiegeltes Envelope an und speichert es
    ///
    /// Live-Zustellung ist Sache des Dispatchers; siehe
    /// [`send_message_verteilt`](Self::send_message_verteilt).
    pub async fn send_message(&self, sender: MemberId, envelope: Envelope) -> ChatResult<Envelope> {
        self.send_message_verteilt(sender, envelope, |_| ())
            .await
            .map(|(envelope, _)| envelope)
    }

    /// Wie [`send_message`](Self::send_message), ruft aber `verteilen` noch
    /// unter der Gruppensperre auf
    ///
    /// Damit erreicht kein Push mit hoeherer Sequenz die Verbindungen vor
    /// einem mit niedrigerer. `None` statt eines Verteil-Ergebnisses, wenn
    /// das Envelope schon frueher angenommen wurde (Wiederholung).
    pub async fn send_message_verteilt<R, F>(
        &self,
        sender: MemberId,
        envelope: Envelope,
        verteilen: F,
    ) -> ChatResult<(Envelope, Option<R>)>
    where
        F: FnOnce(&Envelope) -> R,
    {
        if envelope.sender_id != sender {
            return Err(ChatError::ungueltig(format!(
                "Envelope-Absender {} ist nicht {sender}",
                envelope.sender_id
            )));
        }

        let gruppe = self.gruppen.get(&envelope.group_id)?;
        loop {
            let mut g = gruppe.lock().await;
            let jetzt = Utc::now();
            if g.abgelaufene_entfernen(jetzt) > 0 {
                self.versand_fertig.notify_waiters();
            }

            let Some(reservierung) = g.reservierung(envelope.sequence).cloned() else {
                let gespeichert = self.ohne_reservierung(&g, &envelope).await?;
                return Ok((gespeichert, None));
            };
            if reservierung.sender != sender {
                return Err(ChatError::ungueltig(format!(
                    "Sequenz {} ist fuer ein anderes Mitglied reserviert",
                    envelope.sequence
                )));
            }

            if let Some(frist) = g.offen_vor(envelope.sequence) {
                // Fruehere Sequenz noch offen: warten bis sie eingereicht wird oder ablaeuft
                let geweckt = self.versand_fertig.notified();
                tokio::pin!(geweckt);
                geweckt.as_mut().enable();
                drop(g);
                let warten = (frist - jetzt).to_std().unwrap_or_default();
                debug!(sequence = envelope.sequence, warten_ms = warten.as_millis() as u64, "Warte auf fruehere Sequenz");
                let _ = timeout(warten, geweckt).await;
                continue;
            }

            g.reservierung_entfernen(envelope.sequence);
            let ergebnis = self.einreichen(&g, &envelope, &reservierung).await;
            let verteilt = ergebnis.map(|()| verteilen(&envelope));
            drop(g);
            self.versand_fertig.notify_waiters();

            let verteilt = verteilt?;
            info!(
                message_id = %envelope.message_id,
                group_id = %envelope.group_id,
                epoch = envelope.epoch,
                sequence = envelope.sequence,
                empfaenger = envelope.wrapped_keys.len(),
                "Nachricht gespeichert"
            );
            return Ok((envelope, Some(verteilt)));
        }
    }

    /// Prueft ein Envelope gegen Roster und Epoch und speichert es
    ///
    /// Die Reservierung ist zu diesem Zeitpunkt schon verbraucht: auch ein
    /// abgelehntes Envelope hinterlaesst nur eine Luecke.
    async fn einreichen(
        &self,
        g: &Group,
        envelope: &Envelope,
        reservierung: &Reservierung,
    ) -> ChatResult<()> {
        envelope.validieren()?;
        if envelope.ciphertext.len() > self.config.max_klartext {
            return Err(ChatError::ungueltig(format!(
                "Nachricht zu gross: {} Bytes (Maximum: {} Bytes)",
                envelope.ciphertext.len(),
                self.config.max_klartext
            )));
        }
        g.aktiv_pruefen()?;
        g.mitglied_pruefen(&envelope.sender_id)?;
        if envelope.epoch != g.epoch() || reservierung.epoch != g.epoch() {
            return Err(ChatError::StaleEpoch {
                current: g.epoch(),
                received: envelope.epoch,
            });
        }
        let roster: HashSet<MemberId> = g.members().iter().copied().collect();
        let empfaenger: HashSet<MemberId> = envelope.empfaenger().collect();
        if roster != empfaenger {
            return Err(ChatError::ungueltig(format!(
                "Wrapped Keys passen nicht zum Roster der Epoch {}",
                g.epoch()
            )));
        }

        let queued: Vec<DeliveryTransition> = envelope
            .empfaenger()
            .filter(|r| *r != envelope.sender_id)
            .map(|recipient_id| DeliveryTransition {
                message_id: envelope.message_id,
                recipient_id,
                state: DeliveryState::Queued,
                at: envelope.sent_at,
            })
            .collect();
        self.persistieren(envelope, &queued).await
    }

    /// Einreichung ohne offene Reservierung
    ///
    /// Eine Wiederholung eines bereits gespeicherten Envelopes wird
    /// idempotent beantwortet; alles andere ist veraltet oder ungueltig.
    async fn ohne_reservierung(&self, g: &Group, envelope: &Envelope) -> ChatResult<Envelope> {
        if let Some(gespeichert) = self.store.get_envelope(envelope.message_id).await? {
            if gespeichert.group_id == envelope.group_id
                && gespeichert.sequence == envelope.sequence
                && gespeichert.ciphertext == envelope.ciphertext
            {
                debug!(message_id = %envelope.message_id, "Einreichung war bereits gespeichert");
                return Ok(gespeichert);
            }
            return Err(ChatError::ungueltig(format!(
                "Message-ID {} ist bereits vergeben",
                envelope.message_id
            )));
        }
        g.aktiv_pruefen()?;
        if envelope.epoch < g.epoch() {
            return Err(ChatError::StaleEpoch {
                current: g.epoch(),
                received: envelope.epoch,
            });
        }
        Err(ChatError::ungueltig(format!(
            "Keine offene Reservierung fuer Sequenz {} (abgelaufen oder nie vergeben)",
            envelope.sequence
        )))
    }

    /// Atomarer Schreibvorgang mit Zeitlimit und Wiederholung
    ///
    /// Wiederholt wird mit demselben Envelope; der Speicher erkennt die
    /// Message-ID und schreibt nichts doppelt. Ein abgebrochener Versuch
    /// kann trotzdem committet haben, deshalb wird vor dem Fehlschlag noch
    /// einmal nachgelesen.
    async fn persistieren(
        &self,
        envelope: &Envelope,
        queued: &[DeliveryTransition],
    ) -> ChatResult<()> {
        let versuche = self.config.persist_retries + 1;
        let mut letzter = ChatError::PersistenceFailure("kein Versuch".into());

        for versuch in 1..=versuche {
            match timeout(
                self.config.persist_timeout,
                self.store.append_envelope(envelope, queued),
            )
            .await
            {
                Ok(Ok(AppendOutcome::Neu)) => return Ok(()),
                Ok(Ok(AppendOutcome::BereitsVorhanden)) => {
                    debug!(message_id = %envelope.message_id, versuch, "Envelope war bereits gespeichert");
                    return Ok(());
                }
                Ok(Err(e)) if e.ist_sequenz_konflikt() => {
                    warn!(
                        group_id = %envelope.group_id,
                        sequence = envelope.sequence,
                        "Sequenz bereits belegt"
                    );
                    return Err(ChatError::PersistenceFailure(e.to_string()));
                }
                Ok(Err(e)) => {
                    warn!(message_id = %envelope.message_id, versuch, fehler = %e, "Speichern fehlgeschlagen");
                    letzter = ChatError::PersistenceFailure(e.to_string());
                }
                Err(_) => {
                    warn!(
                        message_id = %envelope.message_id,
                        versuch,
                        timeout_ms = self.config.persist_timeout.as_millis() as u64,
                        "Speichern abgebrochen (Zeitlimit)"
                    );
                    letzter = ChatError::Timeout(self.config.persist_timeout);
                }
            }
        }

        match timeout(
            self.config.persist_timeout,
            self.store.get_envelope(envelope.message_id),
        )
        .await
        {
            Ok(Ok(Some(_))) => {
                info!(message_id = %envelope.message_id, "Envelope trotz Zeitueberschreitung gespeichert");
                return Ok(());
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => {
                warn!(message_id = %envelope.message_id, fehler = %e, "Nachlesen fehlgeschlagen")
            }
            Err(_) => warn!(message_id = %envelope.message_id, "Nachlesen abgebrochen (Zeitlimit)"),
        }
        Err(letzter)
    }

    // -----------------------------------------------------------------------
    // Backlog und Zustellung
    // -----------------------------------------------------------------------

    /// Envelopes mit `sequence > since` fuer einen Empfaenger, plus dessen
    /// Zustell-Datensaetze
    ///
    /// Auch ehemalige Mitglieder bekommen die Nachrichten, fuer die sie
    /// Wrapped Keys besitzen.
    pub async fn fetch_backlog(
        &self,
        group_id: GroupId,
        requester: MemberId,
        since: u64,
        limit: Option<u32>,
    ) -> ChatResult<Backlog> {
        self.bekannt_pruefen(&requester)?;
        self.gruppen.get(&group_id)?;

        let limit = limit
            .unwrap_or(self.config.backlog_limit)
            .clamp(1, self.config.backlog_limit.max(1));
        let mut envelopes = self
            .store
            .envelopes_since(group_id, since, limit.saturating_add(1), Some(requester))
            .await?;
        let has_more = envelopes.len() > limit as usize;
        envelopes.truncate(limit as usize);

        let delivery_records = if envelopes.is_empty() {
            Vec::new()
        } else {
            let seite: HashSet<MessageId> = envelopes.iter().map(|e| e.message_id).collect();
            self.store
                .delivery_records_fuer(group_id, requester, since)
                .await?
                .into_iter()
                .filter(|r| seite.contains(&r.message_id))
                .collect()
        };

        debug!(
            group_id = %group_id,
            requester = %requester,
            since,
            anzahl = envelopes.len(),
            has_more,
            "Backlog geliefert"
        );
        Ok(Backlog {
            group_id,
            envelopes,
            delivery_records,
            has_more,
        })
    }

    /// Empfangs- oder Lesebestaetigung anwenden
    ///
    /// Idempotent und monoton: eine Bestaetigung unterhalb des aktuellen
    /// Zustands aendert nichts und ist kein Fehler.
    pub async fn acknowledge(
        &self,
        message_id: MessageId,
        recipient: MemberId,
        state: DeliveryState,
        at: DateTime<Utc>,
    ) -> ChatResult<AckErgebnis> {
        let envelope = self
            .store
            .get_envelope(message_id)
            .await?
            .ok_or(ChatError::MessageNotFound(message_id))?;
        if envelope.sender_id == recipient || !envelope.ist_empfaenger(&recipient) {
            return Err(ChatError::ungueltig(format!(
                "{recipient} ist kein Empfaenger von {message_id}"
            )));
        }

        let mut record = self
            .store
            .delivery_records(message_id)
            .await?
            .into_iter()
            .find(|r| r.recipient_id == recipient)
            .unwrap_or_else(|| DeliveryRecord::queued(message_id, recipient, envelope.sent_at));

        let neu = delivery::uebergaenge(message_id, recipient, Some(record.state), state, at);
        if neu.is_empty() {
            debug!(message_id = %message_id, recipient = %recipient, %state, "Bestaetigung ohne Wirkung");
            return Ok(AckErgebnis {
                record,
                sender_id: envelope.sender_id,
                geaendert: false,
            });
        }

        self.store.append_transitions(&neu).await?;
        let geaendert = delivery::anwenden(&mut record, &neu);
        debug!(message_id = %message_id, recipient = %recipient, state = %record.state, "Zustellstatus aktualisiert");
        Ok(AckErgebnis {
            record,
            sender_id: envelope.sender_id,
            geaendert,
        })
    }

    pub async fn delivery_records(&self, message_id: MessageId) -> ChatResult<Vec<DeliveryRecord>> {
        Ok(self.store.delivery_records(message_id).await?)
    }

    // -----------------------------------------------------------------------
    // Reaktionen
    // -----------------------------------------------------------------------

    /// Haengt eine Reaktion an; nur Empfaenger der Nachricht duerfen reagieren
    pub async fn react(
        &self,
        message_id: MessageId,
        member: MemberId,
        emoji: &str,
    ) -> ChatResult<(ReactionRecord, ReactionSummary)> {
        if emoji.is_empty() || emoji.len() > self.config.max_emoji {
            return Err(ChatError::ungueltig(format!(
                "Emoji muss 1 bis {} Bytes lang sein",
                self.config.max_emoji
            )));
        }

        let envelope = self
            .store
            .get_envelope(message_id)
            .await?
            .ok_or(ChatError::MessageNotFound(message_id))?;
        self.gruppen
            .get(&envelope.group_id)?
            .lock()
            .await
            .aktiv_pruefen()?;
        if !envelope.ist_empfaenger(&member) {
            return Err(ChatError::StaleMembership {
                member,
                group: envelope.group_id,
            });
        }

        let record = ReactionRecord {
            message_id,
            member_id: member,
            emoji: emoji.to_string(),
            reacted_at: Utc::now(),
        };
        self.store.append_reaction(&record).await?;
        let summary = self.reactions(message_id).await?;
        Ok((record, summary))
    }

    /// Aktuelle Reaktions-Zusammenfassung einer Nachricht
    pub async fn reactions(&self, message_id: MessageId) -> ChatResult<ReactionSummary> {
        let records = self.store.reactions(message_id).await?;
        Ok(reaktionen_zusammenfassen(&records))
    }

    /// Envelope einer Nachricht (z.B. fuer Empfaengerlisten)
    pub async fn envelope(&self, message_id: MessageId) -> ChatResult<Envelope> {
        self.store
            .get_envelope(message_id)
            .await?
            .ok_or(ChatError::MessageNotFound(message_id))
    }
}
