//! Tests fuer die Empfangsseite (MemberAgent)

use encore_protocol::Visibility;

use super::{mitglied, senden, test_service};
use crate::{ChatError, Eingang};

#[tokio::test]
async fn test_ingest_erkennt_duplikate_und_luecken() {
    let service = test_service().await;
    let a = mitglied(&service, "a").await;
    let mut b = mitglied(&service, "b").await;
    let gruppe = service
        .create_group(a.member_id(), Visibility::Private, &[b.member_id()])
        .await
        .unwrap();

    let mut envelopes = Vec::new();
    for i in 1..=4 {
        envelopes.push(
            senden(&service, gruppe.group_id, &a, format!("n{i}").as_bytes(), None)
                .await
                .unwrap(),
        );
    }
    b.baseline(gruppe.group_id, 0);

    match b.ingest(&envelopes[0]).unwrap() {
        Eingang::Neu { klartext, luecke, sender_id, .. } => {
            assert_eq!(klartext, b"n1");
            assert_eq!(luecke, None);
            assert_eq!(sender_id, a.member_id());
        }
        andere => panic!("erwartet Neu, bekommen {andere:?}"),
    }
    assert!(matches!(
        b.ingest(&envelopes[0]).unwrap(),
        Eingang::Duplikat { sequence: 1, .. }
    ));

    // 2 und 3 fehlen: 4 wird trotzdem geoeffnet, die Luecke gemeldet
    match b.ingest(&envelopes[3]).unwrap() {
        Eingang::Neu { klartext, luecke, .. } => {
            assert_eq!(klartext, b"n4");
            assert_eq!(luecke, Some((2, 4)));
        }
        andere => panic!("erwartet Neu, bekommen {andere:?}"),
    }
    assert_eq!(b.fehlende(&gruppe.group_id), vec![2, 3]);

    // Backlog ab der ersten Luecke fuellt auf
    let since = b.backlog_ab(&gruppe.group_id);
    assert_eq!(since, 1);
    let backlog = service
        .fetch_backlog(gruppe.group_id, b.member_id(), since, None)
        .await
        .unwrap();
    let mut neu = 0;
    for e in &backlog.envelopes {
        if matches!(b.ingest(e).unwrap(), Eingang::Neu { .. }) {
            neu += 1;
        }
    }
    assert_eq!(neu, 2);
    assert!(b.fehlende(&gruppe.group_id).is_empty());
}

#[tokio::test]
async fn test_verworfene_sequenz_bleibt_luecke() {
    let service = test_service().await;
    let a = mitglied(&service, "a").await;
    let mut b = mitglied(&service, "b").await;
    let gruppe = service
        .create_group(a.member_id(), Visibility::Private, &[b.member_id()])
        .await
        .unwrap();

    // Sequenz 1 wird reserviert, aber nie eingereicht
    service
        .reserve_send(gruppe.group_id, a.member_id())
        .await
        .unwrap();
    let platz = service
        .reserve_send(gruppe.group_id, a.member_id())
        .await
        .unwrap();
    let e = a.versiegeln(&platz, b"zweite", None).unwrap();
    b.baseline(gruppe.group_id, 0);

    // Sequenz 2 wartet auf die offene 1
    let s = service.clone();
    let sender = a.member_id();
    let einreichen = tokio::spawn(async move { s.send_message(sender, e).await });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(!einreichen.is_finished());
    einreichen.abort();

    let backlog = service
        .fetch_backlog(gruppe.group_id, b.member_id(), 0, None)
        .await
        .unwrap();
    assert!(backlog.envelopes.is_empty());

    // Eine echte Luecke: 3 kommt an, 2 nie
    let platz = service
        .reserve_send(gruppe.group_id, a.member_id())
        .await
        .unwrap();
    assert_eq!(platz.sequence, 3);
    let drei = a.versiegeln(&platz, b"dritte", None).unwrap();
    assert!(matches!(
        b.ingest(&drei).unwrap(),
        Eingang::Neu { luecke: Some((1, 3)), .. }
    ));
    assert_eq!(b.fehlende(&gruppe.group_id), vec![1, 2]);
    assert_eq!(b.luecken_abschliessen(&gruppe.group_id, 2), vec![1, 2]);
    assert!(b.fehlende(&gruppe.group_id).is_empty());
}

#[tokio::test]
async fn test_manipuliertes_envelope_beruehrt_den_tracker_nicht() {
    let service = test_service().await;
    let a = mitglied(&service, "a").await;
    let mut b = mitglied(&service, "b").await;
    let gruppe = service
        .create_group(a.member_id(), Visibility::Private, &[b.member_id()])
        .await
        .unwrap();
    let mut envelopes = Vec::new();
    for text in [b"eins".as_slice(), b"zwei"] {
        envelopes.push(
            senden(&service, gruppe.group_id, &a, text, None)
                .await
                .unwrap(),
        );
    }
    b.baseline(gruppe.group_id, 0);

    // Gefaelschte hohe Sequenz: keine Luecken, keine gesehene Sequenz
    let mut gefaelscht = envelopes[0].clone();
    gefaelscht.sequence = 5_000;
    assert!(matches!(
        b.ingest(&gefaelscht),
        Err(ChatError::AuthenticationFailure)
    ));
    assert!(b.fehlende(&gruppe.group_id).is_empty());
    assert_eq!(b.backlog_ab(&gruppe.group_id), 0);

    // Manipulierte Kopie der naechsten Sequenz verdraengt das Original nicht
    let mut kaputt = envelopes[1].clone();
    kaputt.ciphertext[0] ^= 0xff;
    assert!(matches!(
        b.ingest(&kaputt),
        Err(ChatError::AuthenticationFailure)
    ));

    assert!(matches!(b.ingest(&envelopes[0]).unwrap(), Eingang::Neu { luecke: None, .. }));
    match b.ingest(&envelopes[1]).unwrap() {
        Eingang::Neu { klartext, luecke, .. } => {
            assert_eq!(klartext, b"zwei");
            assert_eq!(luecke, None);
        }
        andere => panic!("erwartet Neu, bekommen {andere:?}"),
    }
}

#[tokio::test]
async fn test_versiegeln_bindet_reservierung() {
    let service = test_service().await;
    let a = mitglied(&service, "a").await;
    let b = mitglied(&service, "b").await;
    let gruppe = service
        .create_group(a.member_id(), Visibility::Private, &[b.member_id()])
        .await
        .unwrap();

    let platz = service
        .reserve_send(gruppe.group_id, a.member_id())
        .await
        .unwrap();
    assert_eq!(platz.recipients.len(), 2);
    assert!(platz
        .recipients
        .iter()
        .any(|r| r.member_id == b.member_id() && r.public_key == b.public_key()));

    let e = a
        .versiegeln(&platz, b"hallo", Some("media://1".into()))
        .unwrap();
    assert_eq!((e.group_id, e.epoch, e.sequence), (gruppe.group_id, 0, 1));
    assert_eq!(e.sender_id, a.member_id());
    assert_ne!(e.ciphertext, b"hallo");
    assert_eq!(b.open(&e).unwrap(), b"hallo");

    // Ungueltige Anhang-Referenz scheitert schon beim Absender
    let zu_lang = "m".repeat(encore_crypto::MAX_ATTACHMENT_REF_LEN + 1);
    assert!(a.versiegeln(&platz, b"x", Some(zu_lang)).is_err());
}

#[tokio::test]
async fn test_open_ohne_wrapped_key() {
    let service = test_service().await;
    let a = mitglied(&service, "a").await;
    let fremd = mitglied(&service, "fremd").await;
    let gruppe = service
        .create_group(a.member_id(), Visibility::Private, &[])
        .await
        .unwrap();
    let e = senden(&service, gruppe.group_id, &a, b"privat", None)
        .await
        .unwrap();

    assert!(matches!(fremd.open(&e), Err(ChatError::KeyMismatch)));
}

#[tokio::test]
async fn test_beschaedigter_wrapped_key() {
    let service = test_service().await;
    let a = mitglied(&service, "a").await;
    let b = mitglied(&service, "b").await;
    let gruppe = service
        .create_group(a.member_id(), Visibility::Private, &[b.member_id()])
        .await
        .unwrap();
    let mut e = senden(&service, gruppe.group_id, &a, b"x", None)
        .await
        .unwrap();

    for eintrag in e.wrapped_keys.iter_mut() {
        if eintrag.recipient_id == b.member_id() {
            eintrag.wrapped_key.truncate(20);
        }
    }
    assert!(matches!(b.open(&e), Err(ChatError::Corrupt(_))));
    assert_eq!(a.open(&e).unwrap(), b"x");
}
