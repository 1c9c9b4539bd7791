//! Mitglieder-Verzeichnis
//!
//! Haelt die oeffentlichen Schluessel aller bekannten Mitglieder. Die
//! Identitaet ist bereits authentifiziert, wenn sie hier ankommt.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use encore_core::MemberId;
use encore_crypto::PublicKey;
use tracing::{debug, warn};

use crate::error::{ChatError, ChatResult};
use crate::types::Member;

#[derive(Debug, Default)]
pub struct MemberDirectory {
    mitglieder: DashMap<MemberId, Member>,
}

impl MemberDirectory {
    pub fn neu() -> Self {
        Self::default()
    }

    /// Registriert ein Mitglied
    ///
    /// Erneutes Registrieren mit demselben Schluessel ist erlaubt (der
    /// Anzeigename wird aktualisiert). Ein anderer Schluessel fuer dieselbe
    /// Identitaet wird abgelehnt.
    pub fn registrieren(&self, member: Member) -> ChatResult<()> {
        match self.mitglieder.entry(member.id) {
            Entry::Occupied(mut eintrag) => {
                if eintrag.get().public_key != member.public_key {
                    warn!(member_id = %member.id, "Registrierung mit abweichendem Schluessel abgelehnt");
                    return Err(ChatError::ungueltig(format!(
                        "Mitglied {} ist bereits mit einem anderen Schluessel registriert",
                        member.id
                    )));
                }
                eintrag.get_mut().display_handle = member.display_handle;
            }
            Entry::Vacant(eintrag) => {
                debug!(member_id = %member.id, handle = %member.display_handle, "Mitglied registriert");
                eintrag.insert(member);
            }
        }
        Ok(())
    }

    /// Prueft, ob `registrieren` fuer dieses Mitglied gelingen wuerde
    pub fn registrierbar(&self, member: &Member) -> ChatResult<()> {
        match self.mitglieder.get(&member.id) {
            Some(vorhanden) if vorhanden.public_key != member.public_key => {
                Err(ChatError::ungueltig(format!(
                    "Mitglied {} ist bereits mit einem anderen Schluessel registriert",
                    member.id
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn get(&self, id: &MemberId) -> Option<Member> {
        self.mitglieder.get(id).map(|m| m.clone())
    }

    pub fn ist_bekannt(&self, id: &MemberId) -> bool {
        self.mitglieder.contains_key(id)
    }

    pub fn public_key(&self, id: &MemberId) -> ChatResult<PublicKey> {
        self.mitglieder
            .get(id)
            .map(|m| m.public_key)
            .ok_or(ChatError::UnknownMember(*id))
    }

    pub fn anzahl(&self) -> usize {
        self.mitglieder.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encore_crypto::generate_member_keypair;

    fn mitglied(handle: &str) -> Member {
        Member {
            id: MemberId::new(),
            display_handle: handle.into(),
            public_key: generate_member_keypair().0,
        }
    }

    #[test]
    fn registrieren_und_nachschlagen() {
        let dir = MemberDirectory::neu();
        let m = mitglied("alice");
        dir.registrieren(m.clone()).unwrap();
        assert_eq!(dir.public_key(&m.id).unwrap(), m.public_key);
        assert_eq!(dir.anzahl(), 1);
    }

    #[test]
    fn erneut_registrieren_aktualisiert_handle() {
        let dir = MemberDirectory::neu();
        let mut m = mitglied("alice");
        dir.registrieren(m.clone()).unwrap();
        m.display_handle = "ali".into();
        dir.registrieren(m.clone()).unwrap();
        assert_eq!(dir.get(&m.id).unwrap().display_handle, "ali");
    }

    #[test]
    fn anderer_schluessel_wird_abgelehnt() {
        let dir = MemberDirectory::neu();
        let mut m = mitglied("alice");
        dir.registrieren(m.clone()).unwrap();
        m.public_key = generate_member_keypair().0;
        assert!(matches!(
            dir.registrierbar(&m),
            Err(ChatError::InvalidOperation(_))
        ));
        assert!(matches!(
            dir.registrieren(m),
            Err(ChatError::InvalidOperation(_))
        ));
    }

    #[test]
    fn unbekanntes_mitglied() {
        let dir = MemberDirectory::neu();
        let id = MemberId::new();
        assert!(matches!(dir.public_key(&id), Err(ChatError::UnknownMember(x)) if x == id));
    }
}
