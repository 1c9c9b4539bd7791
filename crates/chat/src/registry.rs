//! Gruppen-Registry – ein Serialisierungspunkt pro Gruppe
//!
//! Jede Gruppe steckt hinter ihrem eigenen `tokio::sync::Mutex`. Versand
//! und Mitgliedschaftsaenderungen derselben Gruppe laufen damit strikt
//! nacheinander, verschiedene Gruppen blockieren sich nie gegenseitig.

use std::sync::Arc;

use dashmap::DashMap;
use encore_core::GroupId;
use tokio::sync::Mutex;

use crate::error::{ChatError, ChatResult};
use crate::membership::Group;

#[derive(Debug, Default)]
pub struct GroupRegistry {
    gruppen: DashMap<GroupId, Arc<Mutex<Group>>>,
}

impl GroupRegistry {
    pub fn neu() -> Self {
        Self::default()
    }

    pub fn einfuegen(&self, gruppe: Group) -> Arc<Mutex<Group>> {
        let id = gruppe.id();
        let eintrag = Arc::new(Mutex::new(gruppe));
        self.gruppen.insert(id, Arc::clone(&eintrag));
        eintrag
    }

    /// Serialisierungspunkt einer Gruppe
    ///
    /// Der DashMap-Shard wird sofort wieder freigegeben; gesperrt wird nur
    /// der Gruppen-Mutex.
    pub fn get(&self, id: &GroupId) -> ChatResult<Arc<Mutex<Group>>> {
        self.gruppen
            .get(id)
            .map(|g| Arc::clone(g.value()))
            .ok_or(ChatError::GroupNotFound(*id))
    }

    pub fn anzahl(&self) -> usize {
        self.gruppen.len()
    }
}
