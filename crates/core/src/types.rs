//! Gemeinsame Identifikationstypen fuer Encore
//!
//! Alle IDs verwenden das Newtype-Pattern um Verwechslungen zwischen
//! Mitglieds-, Gruppen- und Nachrichten-IDs zur Compilezeit auszuschliessen.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident, $praefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Erstellt eine neue zufaellige ID
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Gibt die innere UUID zurueck
            pub fn inner(&self) -> Uuid {
                self.0
            }

            /// Die 16 Rohbytes (fuer Associated Data)
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($praefix, ":{}"), self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            /// Akzeptiert sowohl `praefix:<uuid>` als auch die nackte UUID
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let roh = s
                    .strip_prefix(concat!($praefix, ":"))
                    .unwrap_or(s);
                Uuid::parse_str(roh).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_id!(
    /// Eindeutige Mitglieds-ID (bereits authentifiziert geliefert)
    MemberId,
    "member"
);

uuid_id!(
    /// Eindeutige Gruppen-ID
    GroupId,
    "group"
);

uuid_id!(
    /// Eindeutige Nachrichten-ID
    MessageId,
    "message"
);
