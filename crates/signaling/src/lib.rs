//! encore-signaling – Verbindungen, Push-Zustellung und Control-Protokoll
//!
//! Dieser Crate stellt den Messaging-Kern (`encore-chat`) ueber eine
//! Frame-basierte Verbindung bereit. Er verwaltet Verbindungen,
//! Gruppen-Abonnements und die Echtzeit-Zustellung von Envelopes,
//! Quittungen und Reaktionen.
//!
//! ## Architektur
//!
//! ```text
//! TCP Listener (SignalingServer)
//!     |
//!     v
//! ClientConnection (pro Verbindung ein Task)
//!     |  Verbunden -> Angemeldet (nach Hello)
//!     |
//!     v
//! MessageDispatcher
//!     |
//!     +-- SessionHandler  (Hello)
//!     +-- GroupHandler    (Anlegen, Mitgliedschaft, Aufloesen, Abonnements)
//!     +-- MessageHandler  (Senden, Backlog, Bestaetigen, Reagieren)
//!
//! RealtimeDispatcher – Envelopes, Quittungen, Reaktionen an Live-Empfaenger
//! EventBroadcaster   – Push-Queues pro Verbindung, Abonnements pro Gruppe
//! ```

pub mod broadcast;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod realtime;
pub mod server_state;
pub mod tcp;

// Bequeme Re-Exporte
pub use broadcast::{Einreihung, EventBroadcaster};
pub use connection::ClientConnection;
pub use dispatcher::{DispatcherContext, MessageDispatcher};
pub use error::{SignalingError, SignalingResult};
pub use realtime::RealtimeDispatcher;
pub use server_state::{DispatcherConfig, SignalingState};
pub use tcp::SignalingServer;
