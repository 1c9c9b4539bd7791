//! encore-chat – Gruppen-Messaging-Kern
//!
//! Dieses Crate implementiert:
//! - Group Membership Manager: Roster, Rollen, Epochs, Aufloesung
//! - ChatService: Sequenzen reservieren, versiegelte Envelopes pruefen und
//!   atomar speichern, Roster und Verzeichnis persistent halten
//! - Delivery Tracker: monotone Zustellstatus und Lueckenerkennung
//! - MemberAgent: Versiegeln beim Absender, Entschluesselung und
//!   Duplikat-/Lueckenerkennung beim Empfaenger
//!
//! # Beispiel
//!
//! ```no_run
//! use std::sync::Arc;
//! use encore_chat::{ChatConfig, ChatService, Member, MemberAgent, Visibility};
//! use encore_core::MemberId;
//! use encore_db::SqliteDb;
//!
//! #[tokio::main]
//! async fn main() {
//!     let db = Arc::new(SqliteDb::in_memory().await.unwrap());
//!     let chat = ChatService::laden(db, ChatConfig::default()).await.unwrap();
//!
//!     let alice = MemberAgent::generieren(MemberId::new());
//!     chat.register_member(Member {
//!         id: alice.member_id(),
//!         display_handle: "alice".into(),
//!         public_key: alice.public_key(),
//!     })
//!     .await
//!     .unwrap();
//!
//!     let gruppe = chat
//!         .create_group(alice.member_id(), Visibility::Private, &[])
//!         .await
//!         .unwrap();
//!     let platz = chat
//!         .reserve_send(gruppe.group_id, alice.member_id())
//!         .await
//!         .unwrap();
//!     let envelope = alice.versiegeln(&platz, b"hallo", None).unwrap();
//!     let envelope = chat.send_message(alice.member_id(), envelope).await.unwrap();
//!     assert_eq!(alice.open(&envelope).unwrap(), b"hallo");
//! }
//! ```

pub mod agent;
pub mod delivery;
pub mod directory;
pub mod error;
pub mod membership;
pub mod registry;
pub mod service;
pub mod types;

#[cfg(test)]
mod tests;

// Bequeme Re-Exporte
pub use agent::{Eingang, MemberAgent};
pub use delivery::{Beobachtung, SequenceTracker};
pub use error::{ChatError, ChatResult};
pub use membership::{Group, GroupState, Reservierung};
pub use service::ChatService;
pub use types::{AckErgebnis, Backlog, ChatConfig, GroupInfo, Member, Role, Visibility};
