//! encore-db – Persistenz fuer Encore
//!
//! Stellt den append-only [`EnvelopeStore`], den [`GroupStore`] fuer
//! Mitglieder und Roster und eine SQLite-Implementierung mit sqlx bereit.
//! Geschrieben werden nur Ciphertexte, Wrapped Keys und Metadaten; Klartext
//! erreicht diese Schicht nie.

pub mod error;
pub mod sqlite;
pub mod store;

pub use error::{DbError, DbResult};
pub use sqlite::SqliteDb;
pub use store::{
    AppendOutcome, ChatStore, DatabaseConfig, EnvelopeStore, GroupAction, GroupEvent, GroupRecord,
    GroupStore, MemberRecord,
};
