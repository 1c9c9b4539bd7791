//! Fehlertypen fuer den Envelope-Speicher

use encore_core::GroupId;
use thiserror::Error;

/// Fehler beim Lesen oder Anhaengen
#[derive(Debug, Error)]
pub enum DbError {
    /// Die Sequenz ist in der Gruppe bereits von einer anderen Nachricht belegt
    #[error("Sequenz {sequence} in Gruppe {group_id} bereits vergeben")]
    SequenzVergeben { group_id: GroupId, sequence: u64 },

    /// Gespeicherte Zeile laesst sich nicht zurueck in den Domaenentyp wandeln
    #[error("Ungueltige Daten: {0}")]
    UngueltigeDaten(String),

    #[error("SQLx-Fehler: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration-Fehler: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Interner DB-Fehler: {0}")]
    Intern(String),
}

impl DbError {
    pub fn ungueltig(msg: impl Into<String>) -> Self {
        Self::UngueltigeDaten(msg.into())
    }

    pub fn intern(msg: impl Into<String>) -> Self {
        Self::Intern(msg.into())
    }

    /// Konflikt, den ein erneuter Versuch nicht aufloesen kann
    pub fn ist_sequenz_konflikt(&self) -> bool {
        match self {
            Self::SequenzVergeben { .. } => true,
            Self::Sqlx(e) => e
                .as_database_error()
                .is_some_and(|d| d.is_unique_violation()),
            _ => false,
        }
    }
}

pub type DbResult<T> = Result<T, DbError>;
