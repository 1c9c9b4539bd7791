//! Integration-Tests fuer den EnvelopeStore (In-Memory SQLite)

use chrono::{Duration, Utc};
use encore_core::{GroupId, MemberId, MessageId};
use encore_crypto::{encrypt_message, generate_member_keypair, wrap_for_members, AssociatedData};
use encore_db::{AppendOutcome, DatabaseConfig, EnvelopeStore, SqliteDb};
use encore_protocol::{DeliveryState, DeliveryTransition, Envelope, ReactionRecord};

async fn db() -> SqliteDb {
    SqliteDb::in_memory()
        .await
        .expect("In-Memory DB konnte nicht erstellt werden")
}

fn envelope(group_id: GroupId, sequence: u64, sender: MemberId, empfaenger: &[MemberId]) -> Envelope {
    let ad = AssociatedData {
        group_id,
        epoch: 0,
        sequence,
        sender_id: sender,
        attachment: None,
    };
    let (sealed, key) = encrypt_message(format!("nachricht {sequence}").as_bytes(), &ad).unwrap();
    let liste: Vec<_> = empfaenger
        .iter()
        .map(|m| (*m, generate_member_keypair().0))
        .collect();
    let wrapped = wrap_for_members(&key, &liste).unwrap();
    Envelope::zusammensetzen(MessageId::new(), &ad, sealed, wrapped, Utc::now())
}

fn queued(env: &Envelope, empfaenger: &[MemberId]) -> Vec<DeliveryTransition> {
    empfaenger
        .iter()
        .map(|r| DeliveryTransition {
            message_id: env.message_id,
            recipient_id: *r,
            state: DeliveryState::Queued,
            at: env.sent_at,
        })
        .collect()
}

#[tokio::test]
async fn envelope_speichern_und_laden() {
    let db = db().await;
    let gruppe = GroupId::new();
    let (a, b) = (MemberId::new(), MemberId::new());

    let env = envelope(gruppe, 1, a, &[a, b]);
    let outcome = db.append_envelope(&env, &queued(&env, &[b])).await.unwrap();
    assert_eq!(outcome, AppendOutcome::Neu);

    let geladen = db.get_envelope(env.message_id).await.unwrap().unwrap();
    // Zeitstempel werden in Millisekunden gespeichert
    assert_eq!(geladen.sent_at.timestamp_millis(), env.sent_at.timestamp_millis());
    assert_eq!(geladen.ciphertext, env.ciphertext);
    assert_eq!(geladen.auth_tag, env.auth_tag);
    assert_eq!(geladen.wrapped_keys, env.wrapped_keys);
    assert_eq!(geladen.sequence, 1);
}

#[tokio::test]
async fn append_ist_idempotent() {
    let db = db().await;
    let a = MemberId::new();
    let env = envelope(GroupId::new(), 1, a, &[a]);

    assert_eq!(db.append_envelope(&env, &[]).await.unwrap(), AppendOutcome::Neu);
    assert_eq!(
        db.append_envelope(&env, &[]).await.unwrap(),
        AppendOutcome::BereitsVorhanden
    );
    assert_eq!(db.wrapped_keys(env.message_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn doppelte_sequenz_wird_abgelehnt_ohne_reste() {
    let db = db().await;
    let gruppe = GroupId::new();
    let a = MemberId::new();

    let erste = envelope(gruppe, 1, a, &[a]);
    db.append_envelope(&erste, &[]).await.unwrap();

    let zweite = envelope(gruppe, 1, a, &[a]);
    let err = db.append_envelope(&zweite, &queued(&zweite, &[a])).await.unwrap_err();
    assert!(err.ist_sequenz_konflikt());

    // Nichts von der abgelehnten Nachricht ist sichtbar
    assert!(db.get_envelope(zweite.message_id).await.unwrap().is_none());
    assert!(db.wrapped_keys(zweite.message_id).await.unwrap().is_empty());
    assert!(db.delivery_records(zweite.message_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn envelopes_since_aufsteigend_mit_limit() {
    let db = db().await;
    let gruppe = GroupId::new();
    let a = MemberId::new();

    for seq in [3u64, 1, 2, 5, 4] {
        let env = envelope(gruppe, seq, a, &[a]);
        db.append_envelope(&env, &[]).await.unwrap();
    }
    // Andere Gruppe darf nicht auftauchen
    db.append_envelope(&envelope(GroupId::new(), 9, a, &[a]), &[]).await.unwrap();

    let seqs: Vec<u64> = db
        .envelopes_since(gruppe, 1, 3, None)
        .await
        .unwrap()
        .iter()
        .map(|e| e.sequence)
        .collect();
    assert_eq!(seqs, vec![2, 3, 4]);

    let alle = db.envelopes_since(gruppe, 0, 500, None).await.unwrap();
    assert_eq!(alle.len(), 5);
    assert!(alle.iter().all(|e| e.wrapped_keys.len() == 1));
    assert_eq!(db.hoechste_sequenz(gruppe).await.unwrap(), 5);
    assert_eq!(db.hoechste_sequenz(GroupId::new()).await.unwrap(), 0);
}

#[tokio::test]
async fn envelopes_since_filtert_nach_empfaenger() {
    let db = db().await;
    let gruppe = GroupId::new();
    let (a, b, c) = (MemberId::new(), MemberId::new(), MemberId::new());

    db.append_envelope(&envelope(gruppe, 1, a, &[a, b, c]), &[]).await.unwrap();
    db.append_envelope(&envelope(gruppe, 2, a, &[a, b]), &[]).await.unwrap();

    let fuer_c = db.envelopes_since(gruppe, 0, 500, Some(c)).await.unwrap();
    assert_eq!(fuer_c.len(), 1);
    assert_eq!(fuer_c[0].sequence, 1);
    assert_eq!(fuer_c[0].wrapped_keys.len(), 3);

    let fuer_b = db.envelopes_since(gruppe, 0, 500, Some(b)).await.unwrap();
    assert_eq!(fuer_b.len(), 2);
}

#[tokio::test]
async fn zustellung_wird_monoton_gefaltet() {
    let db = db().await;
    let gruppe = GroupId::new();
    let (a, b) = (MemberId::new(), MemberId::new());
    let env = envelope(gruppe, 1, a, &[a, b]);
    db.append_envelope(&env, &queued(&env, &[b])).await.unwrap();

    let t = env.sent_at;
    let uebergang = |state, offset| DeliveryTransition {
        message_id: env.message_id,
        recipient_id: b,
        state,
        at: t + Duration::seconds(offset),
    };

    // Read zuerst, dann ein verspaetetes Delivered, dann ein Duplikat
    db.append_transitions(&[uebergang(DeliveryState::Read, 10)]).await.unwrap();
    db.append_transitions(&[uebergang(DeliveryState::Delivered, 5)]).await.unwrap();
    db.append_transitions(&[uebergang(DeliveryState::Read, 20)]).await.unwrap();

    let records = db.delivery_records(env.message_id).await.unwrap();
    assert_eq!(records.len(), 1);
    let r = &records[0];
    assert_eq!(r.state, DeliveryState::Read);
    assert!(r.delivered_at.is_some());
    // Das Duplikat ueberschreibt den ersten Zeitstempel nicht
    assert_eq!(
        r.read_at.map(|x| x.timestamp_millis()),
        Some((t + Duration::seconds(10)).timestamp_millis())
    );

    let fuer_b = db.delivery_records_fuer(gruppe, b, 0).await.unwrap();
    assert_eq!(fuer_b.len(), 1);
    assert!(db.delivery_records_fuer(gruppe, a, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn reaktionen_werden_angehaengt() {
    let db = db().await;
    let a = MemberId::new();
    let env = envelope(GroupId::new(), 1, a, &[a]);
    db.append_envelope(&env, &[]).await.unwrap();

    for emoji in ["👍", "🎸"] {
        db.append_reaction(&ReactionRecord {
            message_id: env.message_id,
            member_id: a,
            emoji: emoji.into(),
            reacted_at: Utc::now(),
        })
        .await
        .unwrap();
    }

    let reaktionen = db.reactions(env.message_id).await.unwrap();
    assert_eq!(reaktionen.len(), 2);
    assert_eq!(reaktionen[1].emoji, "🎸");
}

#[tokio::test]
async fn ciphertext_ist_append_only() {
    let db = db().await;
    let a = MemberId::new();
    let env = envelope(GroupId::new(), 1, a, &[a]);
    db.append_envelope(&env, &[]).await.unwrap();

    let update = sqlx::query("UPDATE messages SET ciphertext = x'00' WHERE id = ?")
        .bind(env.message_id.inner().to_string())
        .execute(db.pool())
        .await;
    assert!(update.is_err());

    let delete = sqlx::query("DELETE FROM wrapped_keys WHERE message_id = ?")
        .bind(env.message_id.inner().to_string())
        .execute(db.pool())
        .await;
    assert!(delete.is_err());
}

#[tokio::test]
async fn datei_datenbank_ueberlebt_neustart() {
    let dir = tempfile::tempdir().unwrap();
    let config = DatabaseConfig {
        url: format!("sqlite://{}", dir.path().join("encore.db").display()),
        max_verbindungen: 2,
        sqlite_wal: true,
    };
    let gruppe = GroupId::new();
    let a = MemberId::new();
    let env = envelope(gruppe, 1, a, &[a]);

    {
        let db = SqliteDb::oeffnen(&config).await.unwrap();
        db.append_envelope(&env, &[]).await.unwrap();
        db.schliessen().await;
    }

    let db = SqliteDb::oeffnen(&config).await.unwrap();
    assert_eq!(db.hoechste_sequenz(gruppe).await.unwrap(), 1);
    assert!(db.get_envelope(env.message_id).await.unwrap().is_some());
}
