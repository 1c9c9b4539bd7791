//! Realtime Dispatcher – einzige Stelle, die Envelopes an Verbindungen gibt
//!
//! Ablauf eines Versands:
//! 1. Der Client reserviert eine Sequenz und versiegelt beim Absender
//! 2. `ChatService::send_message_verteilt` speichert Envelope und
//!    `queued`-Datensaetze
//! 3. Push an jeden Empfaenger mit offener Verbindung und Abonnement, noch
//!    unter der Gruppensperre (Pushes bleiben in Sequenzreihenfolge)
//! 4. Nach erfolgreichem Schreiben auf den Transport meldet die Verbindung
//!    [`RealtimeDispatcher::zustellung_bestaetigt`]; erst dann wird der
//!    Datensatz `delivered` und der Absender bekommt eine Quittung
//!
//! Kein Empfaenger online ist kein Fehler: die Nachricht liegt im Speicher
//! und wird per Backlog abgeholt.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use encore_chat::{AckErgebnis, ChatResult, ChatService, GroupInfo};
use encore_core::{GroupId, MemberId, MessageId};
use encore_db::ChatStore;
use encore_protocol::control::{MessageAccepted, SendReservation};
use encore_protocol::{
    ControlMessage, ControlPayload, DeliveryState, Envelope, ReactionRecord, ReactionSummary,
};

use crate::broadcast::{EventBroadcaster, Einreihung};

pub struct RealtimeDispatcher<S: ChatStore> {
    chat: Arc<ChatService<S>>,
    broadcaster: EventBroadcaster,
}

impl<S: ChatStore> RealtimeDispatcher<S> {
    pub fn neu(chat: Arc<ChatService<S>>, broadcaster: EventBroadcaster) -> Self {
        Self { chat, broadcaster }
    }

    /// Reserviert eine Sequenz fuer den naechsten Versand von `sender`
    pub async fn reservieren(
        &self,
        group_id: GroupId,
        sender: MemberId,
    ) -> ChatResult<SendReservation> {
        self.chat.reserve_send(group_id, sender).await
    }

    /// Speichert ein versiegeltes Envelope und stellt es sofort an alle
    /// Live-Empfaenger zu
    ///
    /// Eine wiederholte Einreichung wird bestaetigt, aber nicht erneut
    /// gepusht.
    pub async fn senden(&self, sender: MemberId, envelope: Envelope) -> ChatResult<MessageAccepted> {
        let (envelope, live) = self
            .chat
            .send_message_verteilt(sender, envelope, |e| self.verteilen(e))
            .await?;
        let live = live.unwrap_or(0);

        tracing::debug!(
            message_id = %envelope.message_id,
            group_id = %envelope.group_id,
            sequence = envelope.sequence,
            live,
            offline = envelope.wrapped_keys.len().saturating_sub(live + 1),
            "Envelope verteilt"
        );

        Ok(MessageAccepted {
            message_id: envelope.message_id,
            group_id: envelope.group_id,
            epoch: envelope.epoch,
            sequence: envelope.sequence,
            live_recipients: u32::try_from(live).unwrap_or(u32::MAX),
        })
    }

    /// Reiht ein gespeichertes Envelope bei allen Live-Empfaengern ein
    ///
    /// Empfaenger sind ausschliesslich die Inhaber eines Wrapped Keys, nie
    /// der aktuelle Roster.
    fn verteilen(&self, envelope: &Envelope) -> usize {
        let push = ControlMessage::push(ControlPayload::Envelope(envelope.clone()));
        self.broadcaster
            .an_abonnenten_senden(
                &envelope.group_id,
                envelope.empfaenger(),
                Some(&envelope.sender_id),
                &push,
            )
            .len()
    }

    /// Die Verbindung von `recipient` hat das Envelope auf den Transport geschrieben
    pub async fn zustellung_bestaetigt(
        &self,
        message_id: MessageId,
        recipient: MemberId,
    ) -> ChatResult<AckErgebnis> {
        self.bestaetigen(message_id, recipient, DeliveryState::Delivered, Utc::now())
            .await
    }

    /// Wendet eine Bestaetigung an und quittiert sie dem Absender
    ///
    /// Duplikate und veraltete Bestaetigungen erzeugen keine Quittung.
    pub async fn bestaetigen(
        &self,
        message_id: MessageId,
        recipient: MemberId,
        state: DeliveryState,
        at: DateTime<Utc>,
    ) -> ChatResult<AckErgebnis> {
        let ergebnis = self.chat.acknowledge(message_id, recipient, state, at).await?;
        if ergebnis.geaendert {
            let quittung = ControlMessage::push(ControlPayload::Receipt(ergebnis.record.clone()));
            let einreihung = self
                .broadcaster
                .an_mitglied_senden(&ergebnis.sender_id, quittung);
            tracing::trace!(
                message_id = %message_id,
                state = %ergebnis.record.state,
                zugestellt = einreihung == Einreihung::Eingereiht,
                "Quittung an Absender"
            );
        }
        Ok(ergebnis)
    }

    /// Reaktion speichern und an die abonnierten Empfaenger der Nachricht pushen
    pub async fn reagieren(
        &self,
        message_id: MessageId,
        member: MemberId,
        emoji: &str,
    ) -> ChatResult<(ReactionRecord, ReactionSummary)> {
        let (record, summary) = self.chat.react(message_id, member, emoji).await?;
        let envelope = self.chat.envelope(message_id).await?;
        let push = ControlMessage::push(ControlPayload::Reaction(record.clone()));
        self.broadcaster.an_abonnenten_senden(
            &envelope.group_id,
            envelope.empfaenger(),
            Some(&member),
            &push,
        );
        Ok((record, summary))
    }

    /// Meldet eine Roster- oder Rollen-Aenderung an alle Betroffenen
    pub fn gruppe_geaendert(&self, info: &GroupInfo, betroffen: Option<MemberId>) -> usize {
        let push = ControlMessage::push(ControlPayload::GroupChanged(info.clone()));
        info.members
            .iter()
            .copied()
            .chain(betroffen.filter(|b| !info.members.contains(b)))
            .filter(|m| self.broadcaster.an_mitglied_senden(m, push.clone()) == Einreihung::Eingereiht)
            .count()
    }
}
