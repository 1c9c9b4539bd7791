//! Integration-Tests fuer Verbindung, Dispatcher und Push-Zustellung
//!
//! Clients sprechen ueber `tokio::io::duplex` mit echten `ClientConnection`s
//! auf einer In-Memory-Datenbank.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use encore_chat::{ChatConfig, ChatService, Eingang, Member, MemberAgent};
use encore_core::{GroupId, MemberId};
use encore_db::SqliteDb;
use encore_protocol::control::{
    AcknowledgeRequest, CreateGroupRequest, FetchBacklogRequest, HelloRequest, MembershipAction,
    MembershipRequest, SendMessageRequest,
};
use encore_protocol::{
    ControlMessage, ControlPayload, DeliveryState, ErrorCode, FrameCodec, GroupInfo, Visibility,
};
use encore_signaling::{ClientConnection, DispatcherConfig, SignalingServer, SignalingState};
use futures_util::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::sync::watch;
use tokio_util::codec::Framed;

const WARTEZEIT: Duration = Duration::from_secs(5);

async fn state_mit(config: DispatcherConfig) -> Arc<SignalingState<SqliteDb>> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let db = SqliteDb::in_memory()
        .await
        .expect("In-Memory DB konnte nicht erstellt werden");
    let chat = ChatService::neu(Arc::new(db), ChatConfig::default());
    SignalingState::neu(config, chat)
}

async fn state() -> Arc<SignalingState<SqliteDb>> {
    state_mit(DispatcherConfig {
        keepalive_sek: 3600,
        verbindungs_timeout_sek: 7200,
        ..Default::default()
    })
    .await
}

/// Test-Client: trennt Antworten (per request_id) von Pushes
struct TestClient<T = DuplexStream> {
    framed: Framed<T, FrameCodec<ControlMessage>>,
    naechste_id: u32,
    pushes: VecDeque<ControlMessage>,
}

impl<T> TestClient<T>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    fn neu(stream: T) -> Self {
        Self {
            framed: Framed::new(stream, FrameCodec::new()),
            naechste_id: 100,
            pushes: VecDeque::new(),
        }
    }

    async fn lesen(&mut self) -> ControlMessage {
        tokio::time::timeout(WARTEZEIT, self.framed.next())
            .await
            .expect("Timeout beim Lesen")
            .expect("Verbindung geschlossen")
            .expect("Frame-Fehler")
    }

    async fn anfrage(&mut self, payload: ControlPayload) -> ControlPayload {
        self.naechste_id += 1;
        let id = self.naechste_id;
        self.framed
            .send(ControlMessage::new(id, payload))
            .await
            .expect("Senden fehlgeschlagen");
        loop {
            let nachricht = self.lesen().await;
            if nachricht.request_id == id && !nachricht.ist_push() {
                return nachricht.payload;
            }
            self.pushes.push_back(nachricht);
        }
    }

    /// Naechster Push, der `filter` erfuellt; andere Pushes bleiben liegen
    async fn push_erwarten<F>(&mut self, filter: F) -> ControlPayload
    where
        F: Fn(&ControlPayload) -> bool,
    {
        if let Some(pos) = self.pushes.iter().position(|m| filter(&m.payload)) {
            return self.pushes.remove(pos).map(|m| m.payload).unwrap();
        }
        loop {
            let nachricht = self.lesen().await;
            if filter(&nachricht.payload) {
                return nachricht.payload;
            }
            self.pushes.push_back(nachricht);
        }
    }

    /// Reservieren, lokal versiegeln, einreichen; liefert die letzte Antwort
    async fn senden(
        &mut self,
        agent: &MemberAgent,
        group_id: GroupId,
        klartext: &[u8],
        attachment: Option<String>,
    ) -> ControlPayload {
        let reservierung = match self.anfrage(ControlPayload::ReserveSend { group_id }).await {
            ControlPayload::SendReserved(r) => r,
            andere => return andere,
        };
        let envelope = agent
            .versiegeln(&reservierung, klartext, attachment)
            .expect("Versiegeln fehlgeschlagen");
        self.anfrage(ControlPayload::SendMessage(SendMessageRequest { envelope }))
            .await
    }

    async fn hello(&mut self, agent: &MemberAgent, handle: &str) {
        let antwort = self
            .anfrage(ControlPayload::Hello(HelloRequest {
                member_id: agent.member_id(),
                public_key: agent.public_key(),
                display_handle: handle.to_string(),
                client_version: "test".to_string(),
            }))
            .await;
        match antwort {
            ControlPayload::HelloOk(ok) => assert_eq!(ok.member_id, agent.member_id()),
            andere => panic!("HelloOk erwartet, bekommen: {andere:?}"),
        }
    }
}

fn verbinden(
    state: &Arc<SignalingState<SqliteDb>>,
    name: &str,
    shutdown_rx: &watch::Receiver<bool>,
) -> TestClient {
    let (client, server) = tokio::io::duplex(256 * 1024);
    let verbindung = ClientConnection::neu(Arc::clone(state), name);
    tokio::spawn(verbindung.verarbeiten(server, shutdown_rx.clone()));
    TestClient::neu(client)
}

fn fehler_code(payload: &ControlPayload) -> ErrorCode {
    match payload {
        ControlPayload::Error(e) => e.code,
        andere => panic!("Error erwartet, bekommen: {andere:?}"),
    }
}

fn gruppe(payload: ControlPayload) -> GroupInfo {
    match payload {
        ControlPayload::Group(info) => info,
        andere => panic!("Group erwartet, bekommen: {andere:?}"),
    }
}

#[tokio::test]
async fn nachricht_live_zustellen_und_quittieren() {
    let state = state().await;
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let alice = MemberAgent::generieren(MemberId::new());
    let mut bob = MemberAgent::generieren(MemberId::new());
    let mut a = verbinden(&state, "alice", &shutdown_rx);
    let mut b = verbinden(&state, "bob", &shutdown_rx);
    a.hello(&alice, "alice").await;
    b.hello(&bob, "bob").await;

    let info = gruppe(
        a.anfrage(ControlPayload::CreateGroup(CreateGroupRequest {
            visibility: Visibility::Private,
            members: vec![bob.member_id()],
        }))
        .await,
    );
    assert_eq!(info.members, vec![alice.member_id(), bob.member_id()]);
    assert_eq!(info.admins, vec![alice.member_id()]);

    // Bob erfaehrt von der neuen Gruppe per Push
    let geaendert = b
        .push_erwarten(|p| matches!(p, ControlPayload::GroupChanged(_)))
        .await;
    assert!(matches!(geaendert, ControlPayload::GroupChanged(g) if g.group_id == info.group_id));

    match b
        .anfrage(ControlPayload::Subscribe {
            group_id: info.group_id,
        })
        .await
    {
        ControlPayload::Subscribed(s) => {
            assert_eq!(s.latest_sequence, 0);
            bob.baseline(info.group_id, s.latest_sequence);
        }
        andere => panic!("Subscribed erwartet, bekommen: {andere:?}"),
    }

    let angenommen = match a
        .senden(&alice, info.group_id, b"hallo bob", None)
        .await
    {
        ControlPayload::MessageAccepted(m) => m,
        andere => panic!("MessageAccepted erwartet, bekommen: {andere:?}"),
    };
    assert_eq!(angenommen.sequence, 1);
    assert_eq!(angenommen.live_recipients, 1);

    let envelope = match b
        .push_erwarten(|p| matches!(p, ControlPayload::Envelope(_)))
        .await
    {
        ControlPayload::Envelope(e) => e,
        _ => unreachable!(),
    };
    assert_eq!(envelope.message_id, angenommen.message_id);
    match bob.ingest(&envelope).expect("Envelope muss sich oeffnen lassen") {
        Eingang::Neu {
            klartext, luecke, ..
        } => {
            assert_eq!(klartext, b"hallo bob");
            assert_eq!(luecke, None);
        }
        andere => panic!("Neue Nachricht erwartet, bekommen: {andere:?}"),
    }

    // Zustellung erst nach dem Schreiben auf Bobs Transport
    match a
        .push_erwarten(|p| matches!(p, ControlPayload::Receipt(r) if r.state == DeliveryState::Delivered))
        .await
    {
        ControlPayload::Receipt(r) => {
            assert_eq!(r.recipient_id, bob.member_id());
            assert!(r.delivered_at.is_some());
        }
        _ => unreachable!(),
    }

    match b
        .anfrage(ControlPayload::Acknowledge(AcknowledgeRequest {
            message_id: envelope.message_id,
            state: DeliveryState::Read,
            timestamp: None,
        }))
        .await
    {
        ControlPayload::AckOk(r) => assert_eq!(r.state, DeliveryState::Read),
        andere => panic!("AckOk erwartet, bekommen: {andere:?}"),
    }

    match a
        .push_erwarten(|p| matches!(p, ControlPayload::Receipt(r) if r.state == DeliveryState::Read))
        .await
    {
        ControlPayload::Receipt(r) => assert!(r.read_at.is_some()),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn offline_empfaenger_holt_backlog() {
    let state = state().await;
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let alice = MemberAgent::generieren(MemberId::new());
    let bob = MemberAgent::generieren(MemberId::new());
    state
        .chat
        .register_member(Member {
            id: bob.member_id(),
            display_handle: "bob".to_string(),
            public_key: bob.public_key(),
        })
        .await
        .unwrap();

    let mut a = verbinden(&state, "alice", &shutdown_rx);
    a.hello(&alice, "alice").await;
    let info = gruppe(
        a.anfrage(ControlPayload::CreateGroup(CreateGroupRequest {
            visibility: Visibility::Private,
            members: vec![bob.member_id()],
        }))
        .await,
    );

    match a
        .senden(
            &alice,
            info.group_id,
            b"spaeter lesen",
            Some("blob://anhang-1".to_string()),
        )
        .await
    {
        ControlPayload::MessageAccepted(m) => assert_eq!(m.live_recipients, 0),
        andere => panic!("MessageAccepted erwartet, bekommen: {andere:?}"),
    }

    let mut b = verbinden(&state, "bob", &shutdown_rx);
    b.hello(&bob, "bob").await;
    let backlog = match b
        .anfrage(ControlPayload::FetchBacklog(FetchBacklogRequest {
            group_id: info.group_id,
            since_sequence: 0,
            limit: None,
        }))
        .await
    {
        ControlPayload::Backlog(bl) => bl,
        andere => panic!("Backlog erwartet, bekommen: {andere:?}"),
    };
    assert_eq!(backlog.envelopes.len(), 1);
    assert!(!backlog.has_more);
    assert_eq!(backlog.delivery_records.len(), 1);
    assert_eq!(backlog.delivery_records[0].state, DeliveryState::Queued);

    let envelope = &backlog.envelopes[0];
    assert_eq!(envelope.attachment.as_deref(), Some("blob://anhang-1"));
    assert_eq!(bob.open(envelope).unwrap(), b"spaeter lesen");
}

#[tokio::test]
async fn entferntes_mitglied_kann_nicht_mehr_senden() {
    let state = state().await;
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let alice = MemberAgent::generieren(MemberId::new());
    let bob = MemberAgent::generieren(MemberId::new());
    let mut a = verbinden(&state, "alice", &shutdown_rx);
    let mut b = verbinden(&state, "bob", &shutdown_rx);
    a.hello(&alice, "alice").await;
    b.hello(&bob, "bob").await;

    let info = gruppe(
        a.anfrage(ControlPayload::CreateGroup(CreateGroupRequest {
            visibility: Visibility::Private,
            members: vec![bob.member_id()],
        }))
        .await,
    );
    b.anfrage(ControlPayload::Subscribe {
        group_id: info.group_id,
    })
    .await;

    let nachher = gruppe(
        a.anfrage(ControlPayload::Membership(MembershipRequest {
            group_id: info.group_id,
            action: MembershipAction::Remove,
            member_id: bob.member_id(),
        }))
        .await,
    );
    assert_eq!(nachher.epoch, info.epoch + 1);
    assert!(!state.broadcaster.ist_abonniert(&bob.member_id(), &info.group_id));

    // Der Betroffene bekommt den neuen Roster ohne sich selbst
    match b
        .push_erwarten(|p| matches!(p, ControlPayload::GroupChanged(g) if g.epoch == nachher.epoch))
        .await
    {
        ControlPayload::GroupChanged(g) => assert!(!g.members.contains(&bob.member_id())),
        _ => unreachable!(),
    }

    let antwort = b.senden(&bob, info.group_id, b"noch da?", None).await;
    assert_eq!(fehler_code(&antwort), ErrorCode::StaleMembership);

    // Ehemalige Mitglieder duerfen den Roster nicht mehr aendern
    let antwort = b
        .anfrage(ControlPayload::Membership(MembershipRequest {
            group_id: info.group_id,
            action: MembershipAction::Remove,
            member_id: alice.member_id(),
        }))
        .await;
    assert_eq!(fehler_code(&antwort), ErrorCode::StaleMembership);
}

#[tokio::test]
async fn anfragen_vor_hello_werden_abgelehnt() {
    let state = state().await;
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut c = verbinden(&state, "anonym", &shutdown_rx);

    let antwort = c
        .anfrage(ControlPayload::Subscribe {
            group_id: GroupId::new(),
        })
        .await;
    assert_eq!(fehler_code(&antwort), ErrorCode::NotAuthenticated);

    match c.anfrage(ControlPayload::Ping(encore_protocol::control::PingMessage { timestamp_ms: 42 })).await {
        ControlPayload::Pong(p) => {
            assert_eq!(p.echo_timestamp_ms, 42);
            assert!(p.server_timestamp_ms > 0);
        }
        andere => panic!("Pong erwartet, bekommen: {andere:?}"),
    }

    let agent = MemberAgent::generieren(MemberId::new());
    c.hello(&agent, "spaet").await;

    // Zweites Hello auf derselben Verbindung
    let antwort = c
        .anfrage(ControlPayload::Hello(HelloRequest {
            member_id: agent.member_id(),
            public_key: agent.public_key(),
            display_handle: "nochmal".to_string(),
            client_version: "test".to_string(),
        }))
        .await;
    assert_eq!(fehler_code(&antwort), ErrorCode::InvalidRequest);
}

#[tokio::test]
async fn shutdown_trennt_verbindung() {
    let state = state().await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut c = verbinden(&state, "alice", &shutdown_rx);
    c.hello(&MemberAgent::generieren(MemberId::new()), "alice").await;
    assert_eq!(state.broadcaster.client_anzahl(), 1);

    shutdown_tx.send(true).unwrap();
    let abschied = c.lesen().await;
    assert_eq!(fehler_code(&abschied.payload), ErrorCode::InternalError);

    let ende = tokio::time::timeout(WARTEZEIT, c.framed.next()).await.unwrap();
    assert!(ende.is_none());
    assert_eq!(state.broadcaster.client_anzahl(), 0);
}

#[tokio::test]
async fn voller_server_lehnt_ab() {
    let state = state_mit(DispatcherConfig {
        max_clients: 1,
        keepalive_sek: 3600,
        verbindungs_timeout_sek: 7200,
        ..Default::default()
    })
    .await;
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = SignalingServer::neu(Arc::clone(&state), addr);
    tokio::spawn(server.bedienen(listener, shutdown_rx));

    let mut erster = TestClient::neu(tokio::net::TcpStream::connect(addr).await.unwrap());
    erster
        .hello(&MemberAgent::generieren(MemberId::new()), "erster")
        .await;
    assert_eq!(state.verbindungen(), 1);

    let mut zweiter = TestClient::neu(tokio::net::TcpStream::connect(addr).await.unwrap());
    let abgelehnt = zweiter.lesen().await;
    assert_eq!(fehler_code(&abgelehnt.payload), ErrorCode::ServerFull);
}

#[tokio::test]
async fn roster_wechsel_zwischen_reservierung_und_versand() {
    let state = state().await;
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let alice = MemberAgent::generieren(MemberId::new());
    let bob = MemberAgent::generieren(MemberId::new());
    let mut carol = MemberAgent::generieren(MemberId::new());
    let mut a = verbinden(&state, "alice", &shutdown_rx);
    let mut c = verbinden(&state, "carol", &shutdown_rx);
    a.hello(&alice, "alice").await;
    c.hello(&carol, "carol").await;
    state
        .chat
        .register_member(Member {
            id: bob.member_id(),
            display_handle: "bob".to_string(),
            public_key: bob.public_key(),
        })
        .await
        .unwrap();

    let info = gruppe(
        a.anfrage(ControlPayload::CreateGroup(CreateGroupRequest {
            visibility: Visibility::Private,
            members: vec![bob.member_id()],
        }))
        .await,
    );
    let reservierung = match a
        .anfrage(ControlPayload::ReserveSend {
            group_id: info.group_id,
        })
        .await
    {
        ControlPayload::SendReserved(r) => r,
        andere => panic!("SendReserved erwartet, bekommen: {andere:?}"),
    };
    assert_eq!(reservierung.epoch, 0);
    assert_eq!(reservierung.recipients.len(), 2);

    gruppe(
        a.anfrage(ControlPayload::Membership(MembershipRequest {
            group_id: info.group_id,
            action: MembershipAction::Add,
            member_id: carol.member_id(),
        }))
        .await,
    );

    // Carol hat keinen Wrapped Key: Envelope der alten Epoch wird abgelehnt
    let envelope = alice.versiegeln(&reservierung, b"veraltet", None).unwrap();
    let antwort = a
        .anfrage(ControlPayload::SendMessage(SendMessageRequest { envelope }))
        .await;
    assert_eq!(fehler_code(&antwort), ErrorCode::StaleEpoch);

    match c
        .anfrage(ControlPayload::Subscribe {
            group_id: info.group_id,
        })
        .await
    {
        ControlPayload::Subscribed(s) => carol.baseline(info.group_id, s.latest_sequence),
        andere => panic!("Subscribed erwartet, bekommen: {andere:?}"),
    }

    match a.senden(&alice, info.group_id, b"neu", None).await {
        ControlPayload::MessageAccepted(m) => {
            assert_eq!((m.epoch, m.sequence), (1, 2));
            assert_eq!(m.live_recipients, 1);
        }
        andere => panic!("MessageAccepted erwartet, bekommen: {andere:?}"),
    }
    let envelope = match c
        .push_erwarten(|p| matches!(p, ControlPayload::Envelope(_)))
        .await
    {
        ControlPayload::Envelope(e) => e,
        _ => unreachable!(),
    };
    assert!(matches!(
        carol.ingest(&envelope).unwrap(),
        Eingang::Neu { ref klartext, .. } if klartext == b"neu"
    ));
}
