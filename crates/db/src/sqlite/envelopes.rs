//! SQLite-Implementierung des EnvelopeStore

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use encore_core::{GroupId, MemberId, MessageId};
use encore_crypto::CipherAlgorithm;
use encore_protocol::{
    DeliveryRecord, DeliveryState, DeliveryTransition, Envelope, ReactionRecord, WrappedKeyEntry,
};
use sqlx::sqlite::SqliteRow;
use sqlx::Row as _;
use tracing::debug;

use crate::error::{DbError, DbResult};
use crate::sqlite::pool::SqliteDb;
use crate::store::{AppendOutcome, EnvelopeStore};

const MESSAGE_SPALTEN: &str = "id, group_id, epoch, sequence, sender_id, algorithm, nonce, \
                               ciphertext, auth_tag, attachment, sent_at";

#[async_trait]
impl EnvelopeStore for SqliteDb {
    async fn append_envelope(
        &self,
        envelope: &Envelope,
        zustellungen: &[DeliveryTransition],
    ) -> DbResult<AppendOutcome> {
        let id_str = envelope.message_id.inner().to_string();
        let mut tx = self.pool.begin().await?;

        let vorhanden = sqlx::query("SELECT 1 FROM messages WHERE id = ?")
            .bind(&id_str)
            .fetch_optional(&mut *tx)
            .await?;
        if vorhanden.is_some() {
            debug!(message_id = %envelope.message_id, "Envelope bereits gespeichert");
            return Ok(AppendOutcome::BereitsVorhanden);
        }

        let insert = sqlx::query(
            "INSERT INTO messages
             (id, group_id, epoch, sequence, sender_id, algorithm, nonce,
              ciphertext, auth_tag, attachment, sent_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id_str)
        .bind(envelope.group_id.inner().to_string())
        .bind(zu_i64(envelope.epoch)?)
        .bind(zu_i64(envelope.sequence)?)
        .bind(envelope.sender_id.inner().to_string())
        .bind(algorithmus_als_str(envelope.algorithm))
        .bind(&envelope.nonce)
        .bind(&envelope.ciphertext)
        .bind(&envelope.auth_tag)
        .bind(&envelope.attachment)
        .bind(envelope.sent_at.timestamp_millis())
        .execute(&mut *tx)
        .await;

        if let Err(e) = insert {
            let e = DbError::from(e);
            if e.ist_sequenz_konflikt() {
                return Err(DbError::SequenzVergeben {
                    group_id: envelope.group_id,
                    sequence: envelope.sequence,
                });
            }
            return Err(e);
        }

        for (position, entry) in envelope.wrapped_keys.iter().enumerate() {
            sqlx::query(
                "INSERT INTO wrapped_keys (message_id, recipient_id, position, wrapped_key)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&id_str)
            .bind(entry.recipient_id.inner().to_string())
            .bind(position as i64)
            .bind(&entry.wrapped_key)
            .execute(&mut *tx)
            .await?;
        }

        for t in zustellungen {
            sqlx::query(
                "INSERT OR IGNORE INTO delivery_transitions (message_id, recipient_id, state, at)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(t.message_id.inner().to_string())
            .bind(t.recipient_id.inner().to_string())
            .bind(t.state.als_str())
            .bind(t.at.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(
            message_id = %envelope.message_id,
            group_id = %envelope.group_id,
            sequence = envelope.sequence,
            wrapped_keys = envelope.wrapped_keys.len(),
            "Envelope gespeichert"
        );
        Ok(AppendOutcome::Neu)
    }

    async fn envelopes_since(
        &self,
        group_id: GroupId,
        since: u64,
        limit: u32,
        empfaenger: Option<MemberId>,
    ) -> DbResult<Vec<Envelope>> {
        let group_str = group_id.inner().to_string();
        let since = zu_i64(since)?;

        let rows = match empfaenger {
            Some(member) => {
                let sql = format!(
                    "SELECT {MESSAGE_SPALTEN} FROM messages m
                     WHERE m.group_id = ? AND m.sequence > ?
                       AND EXISTS (SELECT 1 FROM wrapped_keys w
                                   WHERE w.message_id = m.id AND w.recipient_id = ?)
                     ORDER BY m.sequence ASC
                     LIMIT ?"
                );
                sqlx::query(&sql)
                    .bind(&group_str)
                    .bind(since)
                    .bind(member.inner().to_string())
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {MESSAGE_SPALTEN} FROM messages
                     WHERE group_id = ? AND sequence > ?
                     ORDER BY sequence ASC
                     LIMIT ?"
                );
                sqlx::query(&sql)
                    .bind(&group_str)
                    .bind(since)
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut envelopes: Vec<Envelope> = rows.iter().map(row_to_envelope).collect::<DbResult<_>>()?;
        if envelopes.is_empty() {
            return Ok(envelopes);
        }

        // Wrapped Keys fuer den gesamten Bereich in einer Abfrage laden
        let (erste, letzte) = (envelopes[0].sequence, envelopes[envelopes.len() - 1].sequence);
        let key_rows = sqlx::query(
            "SELECT w.message_id, w.recipient_id, w.wrapped_key
             FROM wrapped_keys w JOIN messages m ON m.id = w.message_id
             WHERE m.group_id = ? AND m.sequence BETWEEN ? AND ?
             ORDER BY w.message_id, w.position",
        )
        .bind(&group_str)
        .bind(zu_i64(erste)?)
        .bind(zu_i64(letzte)?)
        .fetch_all(&self.pool)
        .await?;

        let mut keys: HashMap<MessageId, Vec<WrappedKeyEntry>> = HashMap::new();
        for row in &key_rows {
            let message_id: MessageId = parse_id(row, "message_id")?;
            keys.entry(message_id).or_default().push(row_to_wrapped_key(row)?);
        }
        for env in &mut envelopes {
            env.wrapped_keys = keys.remove(&env.message_id).unwrap_or_default();
        }
        Ok(envelopes)
    }

    async fn get_envelope(&self, message_id: MessageId) -> DbResult<Option<Envelope>> {
        let sql = format!("SELECT {MESSAGE_SPALTEN} FROM messages WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(message_id.inner().to_string())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut envelope = row_to_envelope(&row)?;
        envelope.wrapped_keys = self.wrapped_keys(message_id).await?;
        Ok(Some(envelope))
    }

    async fn wrapped_keys(&self, message_id: MessageId) -> DbResult<Vec<WrappedKeyEntry>> {
        let rows = sqlx::query(
            "SELECT recipient_id, wrapped_key FROM wrapped_keys
             WHERE message_id = ? ORDER BY position",
        )
        .bind(message_id.inner().to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_wrapped_key).collect()
    }

    async fn append_transitions(&self, transitions: &[DeliveryTransition]) -> DbResult<()> {
        if transitions.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for t in transitions {
            sqlx::query(
                "INSERT OR IGNORE INTO delivery_transitions (message_id, recipient_id, state, at)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(t.message_id.inner().to_string())
            .bind(t.recipient_id.inner().to_string())
            .bind(t.state.als_str())
            .bind(t.at.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delivery_records(&self, message_id: MessageId) -> DbResult<Vec<DeliveryRecord>> {
        let rows = sqlx::query(
            "SELECT message_id, recipient_id, state, at FROM delivery_transitions
             WHERE message_id = ?
             ORDER BY recipient_id, at",
        )
        .bind(message_id.inner().to_string())
        .fetch_all(&self.pool)
        .await?;

        uebergaenge_falten(&rows)
    }

    async fn delivery_records_fuer(
        &self,
        group_id: GroupId,
        recipient: MemberId,
        since: u64,
    ) -> DbResult<Vec<DeliveryRecord>> {
        let rows = sqlx::query(
            "SELECT t.message_id, t.recipient_id, t.state, t.at
             FROM delivery_transitions t JOIN messages m ON m.id = t.message_id
             WHERE m.group_id = ? AND t.recipient_id = ? AND m.sequence > ?
             ORDER BY m.sequence, t.at",
        )
        .bind(group_id.inner().to_string())
        .bind(recipient.inner().to_string())
        .bind(zu_i64(since)?)
        .fetch_all(&self.pool)
        .await?;

        uebergaenge_falten(&rows)
    }

    async fn append_reaction(&self, reaction: &ReactionRecord) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO reactions (message_id, member_id, emoji, reacted_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(reaction.message_id.inner().to_string())
        .bind(reaction.member_id.inner().to_string())
        .bind(&reaction.emoji)
        .bind(reaction.reacted_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reactions(&self, message_id: MessageId) -> DbResult<Vec<ReactionRecord>> {
        let rows = sqlx::query(
            "SELECT message_id, member_id, emoji, reacted_at FROM reactions
             WHERE message_id = ? ORDER BY id",
        )
        .bind(message_id.inner().to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ReactionRecord {
                    message_id: parse_id(row, "message_id")?,
                    member_id: parse_id(row, "member_id")?,
                    emoji: row.try_get("emoji")?,
                    reacted_at: millis_zu_zeit(row.try_get("reacted_at")?)?,
                })
            })
            .collect()
    }

    async fn hoechste_sequenz(&self, group_id: GroupId) -> DbResult<u64> {
        let row = sqlx::query("SELECT COALESCE(MAX(sequence), 0) AS seq FROM messages WHERE group_id = ?")
            .bind(group_id.inner().to_string())
            .fetch_one(&self.pool)
            .await?;
        zu_u64(row.try_get("seq")?)
    }
}

// ---------------------------------------------------------------------------
// Hilfsfunktionen
// ---------------------------------------------------------------------------

fn row_to_envelope(row: &SqliteRow) -> DbResult<Envelope> {
    let algorithmus: String = row.try_get("algorithm")?;
    Ok(Envelope {
        message_id: parse_id(row, "id")?,
        group_id: parse_id(row, "group_id")?,
        epoch: zu_u64(row.try_get("epoch")?)?,
        sequence: zu_u64(row.try_get("sequence")?)?,
        sender_id: parse_id(row, "sender_id")?,
        algorithm: algorithmus
            .parse::<CipherAlgorithm>()
            .map_err(DbError::ungueltig)?,
        nonce: row.try_get("nonce")?,
        ciphertext: row.try_get("ciphertext")?,
        auth_tag: row.try_get("auth_tag")?,
        wrapped_keys: Vec::new(),
        attachment: row.try_get("attachment")?,
        sent_at: millis_zu_zeit(row.try_get("sent_at")?)?,
    })
}

fn row_to_wrapped_key(row: &SqliteRow) -> DbResult<WrappedKeyEntry> {
    Ok(WrappedKeyEntry {
        recipient_id: parse_id(row, "recipient_id")?,
        wrapped_key: row.try_get("wrapped_key")?,
    })
}

/// Faltet Uebergangszeilen (sortiert nach Schluessel) zu Datensaetzen
///
/// Der Zustand ist das Maximum aller Uebergaenge; ein spaet eintreffendes
/// `delivered` nach `read` aendert daran nichts.
fn uebergaenge_falten(rows: &[SqliteRow]) -> DbResult<Vec<DeliveryRecord>> {
    let mut records: Vec<DeliveryRecord> = Vec::new();
    let mut index: HashMap<(MessageId, MemberId), usize> = HashMap::new();

    for row in rows {
        let message_id: MessageId = parse_id(row, "message_id")?;
        let recipient_id: MemberId = parse_id(row, "recipient_id")?;
        let state_str: String = row.try_get("state")?;
        let state = state_str
            .parse::<DeliveryState>()
            .map_err(DbError::ungueltig)?;
        let at = millis_zu_zeit(row.try_get("at")?)?;

        let i = *index.entry((message_id, recipient_id)).or_insert_with(|| {
            records.push(DeliveryRecord::queued(message_id, recipient_id, at));
            records.len() - 1
        });
        let record = &mut records[i];
        match state {
            DeliveryState::Queued => record.queued_at = at,
            DeliveryState::Delivered => record.delivered_at = Some(at),
            DeliveryState::Read => record.read_at = Some(at),
        }
        record.state = record.state.max(state);
    }
    Ok(records)
}

pub(crate) fn parse_id<T>(row: &SqliteRow, spalte: &str) -> DbResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let s: String = row.try_get(spalte)?;
    s.parse::<T>()
        .map_err(|e| DbError::ungueltig(format!("Ungueltige {spalte} '{s}': {e}")))
}

pub(crate) fn millis_zu_zeit(ms: i64) -> DbResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| DbError::ungueltig(format!("Zeitstempel ausserhalb des Bereichs: {ms}")))
}

pub(crate) fn zu_i64(wert: u64) -> DbResult<i64> {
    i64::try_from(wert).map_err(|_| DbError::ungueltig(format!("Wert zu gross: {wert}")))
}

pub(crate) fn zu_u64(wert: i64) -> DbResult<u64> {
    u64::try_from(wert).map_err(|_| DbError::ungueltig(format!("Negativer Wert: {wert}")))
}

fn algorithmus_als_str(algorithm: CipherAlgorithm) -> &'static str {
    match algorithm {
        CipherAlgorithm::Aes256Gcm => "aes256gcm",
        CipherAlgorithm::ChaCha20Poly1305 => "chacha20poly1305",
    }
}
