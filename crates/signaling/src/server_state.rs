//! Gemeinsamer Server-Zustand fuer den Signaling-Service
//!
//! Haelt alle geteilten Services als Arc-Referenzen, die sicher zwischen
//! tokio-Tasks geteilt werden koennen.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use encore_chat::ChatService;
use encore_db::ChatStore;

use crate::broadcast::EventBroadcaster;
use crate::realtime::RealtimeDispatcher;

/// Konfiguration fuer den Signaling-Service
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Anzeigename des Servers
    pub server_name: String,
    /// Maximale gleichzeitige Verbindungen
    pub max_clients: u32,
    /// Groesse der Push-Queue pro Verbindung
    pub queue_groesse: usize,
    /// Keepalive-Intervall in Sekunden
    pub keepalive_sek: u64,
    /// Timeout fuer inaktive Verbindungen in Sekunden
    pub verbindungs_timeout_sek: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            server_name: "Encore Server".to_string(),
            max_clients: 512,
            queue_groesse: 64,
            keepalive_sek: 30,
            verbindungs_timeout_sek: 90,
        }
    }
}

/// Gemeinsamer Server-Zustand (thread-safe, Arc-geteilt)
pub struct SignalingState<S: ChatStore> {
    /// Server-Konfiguration
    pub config: Arc<DispatcherConfig>,
    /// Messaging-Kern (Gruppen, Versand, Zustellstatus)
    pub chat: Arc<ChatService<S>>,
    /// Push-Queues und Abonnements
    pub broadcaster: EventBroadcaster,
    /// Einzige Stelle, die Envelopes an Verbindungen uebergibt
    pub realtime: RealtimeDispatcher<S>,
    /// Startzeitpunkt des Servers (fuer Uptime-Berechnung)
    pub start_time: Instant,
    verbindungen: AtomicUsize,
}

impl<S: ChatStore> SignalingState<S> {
    /// Erstellt einen neuen SignalingState
    pub fn neu(config: DispatcherConfig, chat: Arc<ChatService<S>>) -> Arc<Self> {
        let broadcaster = EventBroadcaster::neu(config.queue_groesse);
        let realtime = RealtimeDispatcher::neu(Arc::clone(&chat), broadcaster.clone());
        Arc::new(Self {
            config: Arc::new(config),
            chat,
            broadcaster,
            realtime,
            start_time: Instant::now(),
            verbindungen: AtomicUsize::new(0),
        })
    }

    /// Gibt die Uptime in Sekunden zurueck
    pub fn uptime_sek(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Anzahl offener Verbindungen
    pub fn verbindungen(&self) -> usize {
        self.verbindungen.load(Ordering::Relaxed)
    }

    /// Belegt einen Verbindungsplatz; `None` wenn der Server voll ist
    pub fn verbindung_belegen(self: &Arc<Self>) -> Option<VerbindungsPlatz<S>> {
        let max = self.config.max_clients as usize;
        let mut aktuell = self.verbindungen.load(Ordering::Relaxed);
        loop {
            if aktuell >= max {
                return None;
            }
            match self.verbindungen.compare_exchange_weak(
                aktuell,
                aktuell + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(VerbindungsPlatz {
                        state: Arc::clone(self),
                    })
                }
                Err(neu) => aktuell = neu,
            }
        }
    }
}

/// Belegter Verbindungsplatz; wird beim Drop wieder freigegeben
pub struct VerbindungsPlatz<S: ChatStore> {
    state: Arc<SignalingState<S>>,
}

impl<S: ChatStore> Drop for VerbindungsPlatz<S> {
    fn drop(&mut self) {
        self.state.verbindungen.fetch_sub(1, Ordering::AcqRel);
    }
}
