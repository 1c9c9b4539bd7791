//! Control-Protokoll
//!
//! Definiert alle Nachrichten die ueber die Duplex-Verbindung zwischen
//! Mitglieds-Client und Encore-Server ausgetauscht werden.
//!
//! ## Design
//! - Request/Response Pattern: jede Anfrage hat eine `request_id: u32`
//! - Push-Nachrichten (Envelope, Receipt, Reaction, GroupChanged) tragen `request_id = 0`
//! - JSON-Serialisierung via serde, Tagged Enums fuer typsichere Nachrichtentypen

use chrono::{DateTime, Utc};
use encore_core::{GroupId, MemberId, MessageId};
use encore_crypto::PublicKey;
use serde::{Deserialize, Serialize};

use crate::envelope::{DeliveryRecord, DeliveryState, Envelope, ReactionRecord, ReactionSummary};

/// request_id fuer unaufgeforderte Server-Nachrichten
pub const PUSH_REQUEST_ID: u32 = 0;

// ---------------------------------------------------------------------------
// Fehler-Codes
// ---------------------------------------------------------------------------

/// Standardisierte Fehler-Codes fuer Error-Responses
///
/// Jede Fehlerklasse des Kerns hat einen eigenen Code, damit ein Client
/// "manipuliert" von "leer" unterscheiden kann.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Allgemein
    InternalError,
    InvalidRequest,
    NotFound,
    NotAuthenticated,
    ServerFull,
    // Kern-Taxonomie
    AuthenticationFailure,
    KeyMismatch,
    Corrupt,
    StaleMembership,
    SequenceGap,
    StaleEpoch,
    InvalidOperation,
    PersistenceFailure,
    GroupDissolved,
    Timeout,
}

/// Standardisierte Fehler-Antwort
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    /// Optionale maschinenlesbare Details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Gruppen
// ---------------------------------------------------------------------------

/// Sichtbarkeit einer Gruppe
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Private,
    Public,
}

/// Rolle eines Mitglieds innerhalb einer Gruppe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Regular,
}

/// Momentaufnahme einer Gruppe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub group_id: GroupId,
    pub visibility: Visibility,
    /// Mitglieder in Beitrittsreihenfolge
    pub members: Vec<MemberId>,
    pub admins: Vec<MemberId>,
    pub epoch: u64,
    pub created_at: DateTime<Utc>,
    pub dissolved: bool,
}

impl GroupInfo {
    pub fn rolle(&self, member: &MemberId) -> Option<Role> {
        if self.admins.contains(member) {
            Some(Role::Admin)
        } else if self.members.contains(member) {
            Some(Role::Regular)
        } else {
            None
        }
    }
}

/// Art einer Mitgliedschaftsaenderung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipAction {
    Add,
    Remove,
    Promote,
    Demote,
}

// ---------------------------------------------------------------------------
// Client -> Server
// ---------------------------------------------------------------------------

/// Anmeldung einer bereits authentifizierten Mitglieds-Identitaet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloRequest {
    pub member_id: MemberId,
    pub public_key: PublicKey,
    pub display_handle: String,
    pub client_version: String,
}

/// Gruppe anlegen (Ersteller wird erster Admin)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateGroupRequest {
    #[serde(default)]
    pub visibility: Visibility,
    /// Weitere Gruppenmitglieder neben dem Ersteller
    #[serde(default)]
    pub members: Vec<MemberId>,
}

/// Mitgliedschaft aendern
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipRequest {
    pub group_id: GroupId,
    pub action: MembershipAction,
    pub member_id: MemberId,
}

/// Beim Client versiegeltes Envelope einreichen
///
/// Gruppe, Epoch und Sequenz stammen aus einer vorherigen
/// [`SendReservation`]. Der Server sieht nie den Klartext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub envelope: Envelope,
}

/// Backlog ab einer Sequenznummer anfordern
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchBacklogRequest {
    pub group_id: GroupId,
    /// Nur Nachrichten mit `sequence > since_sequence`
    pub since_sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// Empfangs- oder Lesebestaetigung
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcknowledgeRequest {
    pub message_id: MessageId,
    pub state: DeliveryState,
    /// Zeitpunkt beim Client; fehlt er, gilt die Server-Zeit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Reaktion setzen
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactRequest {
    pub message_id: MessageId,
    pub emoji: String,
}

/// Ping-Nachricht fuer Keepalive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingMessage {
    /// Unix-Timestamp in Millisekunden fuer RTT-Messung
    pub timestamp_ms: u64,
}

// ---------------------------------------------------------------------------
// Server -> Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResponse {
    pub member_id: MemberId,
    pub server_version: String,
}

/// Bestaetigung einer persistierten Nachricht
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageAccepted {
    pub message_id: MessageId,
    pub group_id: GroupId,
    pub epoch: u64,
    pub sequence: u64,
    /// Anzahl der Empfaenger, an die sofort zugestellt werden konnte
    pub live_recipients: u32,
}

/// Oeffentlicher Schluessel eines Empfaengers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientKey {
    pub member_id: MemberId,
    pub public_key: PublicKey,
}

/// Vom Server reservierter Sendeplatz
///
/// Der Client verschluesselt mit genau dieser Epoch und Sequenz und wickelt
/// den Nachrichten-Schluessel fuer genau diese Empfaenger ein.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReservation {
    pub group_id: GroupId,
    pub epoch: u64,
    pub sequence: u64,
    /// Mitglieder zum Reservierungszeitpunkt (Beitrittsreihenfolge)
    pub recipients: Vec<RecipientKey>,
    /// Nach diesem Zeitpunkt verfaellt der Platz und die Sequenz bleibt leer
    pub expires_at: DateTime<Utc>,
}

/// Backlog-Antwort (aufsteigend nach Sequenz)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogResponse {
    pub group_id: GroupId,
    pub envelopes: Vec<Envelope>,
    pub delivery_records: Vec<DeliveryRecord>,
    /// `true` wenn das Limit erreicht wurde und weitere Nachrichten folgen koennen
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribedResponse {
    pub group_id: GroupId,
    pub epoch: u64,
    /// Hoechste bereits vergebene Sequenz (0 = noch keine Nachricht)
    pub latest_sequence: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactResponse {
    pub message_id: MessageId,
    pub summary: ReactionSummary,
}

/// Pong-Antwort (spiegelt Timestamp zurueck)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PongMessage {
    /// Originaler Timestamp aus dem Ping
    pub echo_timestamp_ms: u64,
    /// Server-eigener Timestamp
    pub server_timestamp_ms: u64,
}

// ---------------------------------------------------------------------------
// Haupt-Enum
// ---------------------------------------------------------------------------

/// Alle moeglichen Control-Nachrichten (typsicher via Tagged Enum)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlPayload {
    // Sitzung
    Hello(HelloRequest),
    HelloOk(HelloResponse),

    // Gruppen
    CreateGroup(CreateGroupRequest),
    Membership(MembershipRequest),
    DissolveGroup { group_id: GroupId },
    GroupInfoRequest { group_id: GroupId },
    Group(GroupInfo),

    // Nachrichten
    ReserveSend { group_id: GroupId },
    SendReserved(SendReservation),
    SendMessage(SendMessageRequest),
    MessageAccepted(MessageAccepted),
    FetchBacklog(FetchBacklogRequest),
    Backlog(BacklogResponse),
    Acknowledge(AcknowledgeRequest),
    AckOk(DeliveryRecord),
    React(ReactRequest),
    ReactOk(ReactResponse),

    // Abonnements
    Subscribe { group_id: GroupId },
    Subscribed(SubscribedResponse),
    Unsubscribe { group_id: GroupId },
    Unsubscribed { group_id: GroupId },

    // Push
    Envelope(Envelope),
    Receipt(DeliveryRecord),
    Reaction(ReactionRecord),
    GroupChanged(GroupInfo),

    // Keepalive
    Ping(PingMessage),
    Pong(PongMessage),

    // Fehler
    Error(ErrorResponse),
}

// ---------------------------------------------------------------------------
// Control-Frame
// ---------------------------------------------------------------------------

/// Ein Frame des Control-Protokolls
///
/// Der Client vergibt die `request_id`, der Server kopiert sie in die
/// Antwort. Push-Nachrichten nutzen [`PUSH_REQUEST_ID`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessage {
    pub request_id: u32,
    pub payload: ControlPayload,
}

impl ControlMessage {
    pub fn new(request_id: u32, payload: ControlPayload) -> Self {
        Self {
            request_id,
            payload,
        }
    }

    /// Unaufgeforderte Server-Nachricht
    pub fn push(payload: ControlPayload) -> Self {
        Self::new(PUSH_REQUEST_ID, payload)
    }

    pub fn ping(request_id: u32, timestamp_ms: u64) -> Self {
        Self::new(request_id, ControlPayload::Ping(PingMessage { timestamp_ms }))
    }

    pub fn pong(request_id: u32, echo_timestamp_ms: u64, server_timestamp_ms: u64) -> Self {
        Self::new(
            request_id,
            ControlPayload::Pong(PongMessage {
                echo_timestamp_ms,
                server_timestamp_ms,
            }),
        )
    }

    /// Erstellt eine Fehler-Antwort
    pub fn error(request_id: u32, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(
            request_id,
            ControlPayload::Error(ErrorResponse {
                code,
                message: message.into(),
                details: None,
            }),
        )
    }

    pub fn ist_push(&self) -> bool {
        matches!(
            self.payload,
            ControlPayload::Envelope(_)
                | ControlPayload::Receipt(_)
                | ControlPayload::Reaction(_)
                | ControlPayload::GroupChanged(_)
        )
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
