//! Server-Konfiguration
//!
//! Wird beim Start aus einer TOML-Datei geladen. Alle Felder haben
//! sinnvolle Standardwerte, sodass der Server ohne Konfigurationsdatei
//! lauffaehig ist.

use std::time::Duration;

use encore_chat::ChatConfig;
use encore_db::DatabaseConfig;
use encore_signaling::DispatcherConfig;
use serde::{Deserialize, Serialize};

use crate::logging::{log_format_gueltig, log_level_gueltig};

/// Obergrenze fuer Envelopes pro Backlog-Seite
pub const MAX_BACKLOG_LIMIT: u32 = 10_000;

/// Vollstaendige Server-Konfiguration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Allgemeine Server-Einstellungen
    pub server: ServerEinstellungen,
    /// Netzwerk-Einstellungen
    pub netzwerk: NetzwerkEinstellungen,
    /// Datenbank-Einstellungen
    pub datenbank: DatenbankEinstellungen,
    /// Persistenz, Backlog und Nachrichtengrenzen
    pub zustellung: ZustellungsEinstellungen,
    /// Logging-Einstellungen
    pub logging: LoggingEinstellungen,
}

/// Allgemeine Server-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerEinstellungen {
    /// Anzeigename des Servers
    pub name: String,
    /// Maximale Anzahl gleichzeitiger Verbindungen
    pub max_clients: u32,
}

impl Default for ServerEinstellungen {
    fn default() -> Self {
        Self {
            name: "Encore Server".into(),
            max_clients: 512,
        }
    }
}

/// Netzwerk-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetzwerkEinstellungen {
    /// Bind-Adresse fuer das Control-Protokoll
    pub bind_adresse: String,
    /// TCP-Port
    pub tcp_port: u16,
    /// Intervall fuer Server-Pings in Sekunden
    pub keepalive_sek: u64,
    /// Leerlauf bis zur Trennung in Sekunden
    pub verbindungs_timeout_sek: u64,
    /// Push-Queue pro Verbindung (volle Queue verwirft, Backlog holt nach)
    pub queue_groesse: usize,
}

impl Default for NetzwerkEinstellungen {
    fn default() -> Self {
        Self {
            bind_adresse: "0.0.0.0".into(),
            tcp_port: 7443,
            keepalive_sek: 30,
            verbindungs_timeout_sek: 90,
            queue_groesse: 64,
        }
    }
}

/// Datenbank-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatenbankEinstellungen {
    /// Verbindungs-URL
    pub url: String,
    /// Maximale Verbindungspool-Groesse
    pub max_verbindungen: u32,
    /// WAL-Journal (sonst Rollback-Journal mit `synchronous = FULL`)
    pub sqlite_wal: bool,
}

impl Default for DatenbankEinstellungen {
    fn default() -> Self {
        Self {
            url: "sqlite://encore.db".into(),
            max_verbindungen: 5,
            sqlite_wal: true,
        }
    }
}

/// Persistenz- und Zustellungs-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZustellungsEinstellungen {
    /// Zeitlimit pro Schreibversuch in Millisekunden
    pub persist_timeout_ms: u64,
    /// Wiederholungen nach dem ersten fehlgeschlagenen Schreibversuch
    pub persist_retries: u32,
    /// Maximale Envelopes pro Backlog-Seite
    pub backlog_limit: u32,
    /// Maximale Klartextgroesse in Bytes
    pub max_klartext: usize,
    /// Maximale Laenge eines Reaktions-Emojis in Bytes
    pub max_emoji: usize,
    /// Gueltigkeit einer Sende-Reservierung in Millisekunden
    pub reservierung_ms: u64,
}

impl Default for ZustellungsEinstellungen {
    fn default() -> Self {
        let chat = ChatConfig::default();
        Self {
            persist_timeout_ms: chat.persist_timeout.as_millis() as u64,
            persist_retries: chat.persist_retries,
            backlog_limit: chat.backlog_limit,
            max_klartext: chat.max_klartext,
            max_emoji: chat.max_emoji,
            reservierung_ms: chat.reservierung_gueltig.as_millis() as u64,
        }
    }
}

/// Logging-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingEinstellungen {
    /// Log-Level: "trace", "debug", "info", "warn", "error"
    pub level: String,
    /// Format: "json" oder "text"
    pub format: String,
}

impl Default for LoggingEinstellungen {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl ServerConfig {
    /// Laedt die Konfiguration aus einer TOML-Datei.
    /// Gibt die Standardkonfiguration zurueck wenn die Datei nicht existiert.
    pub fn laden(pfad: &str) -> anyhow::Result<Self> {
        match std::fs::read_to_string(pfad) {
            Ok(inhalt) => {
                let config: Self = toml::from_str(&inhalt)
                    .map_err(|e| anyhow::anyhow!("Konfigurationsfehler in '{pfad}': {e}"))?;
                config.pruefen()?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    pfad = pfad,
                    "Konfigurationsdatei nicht gefunden, verwende Standardwerte"
                );
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "Konfigurationsdatei '{pfad}' nicht lesbar: {e}"
            )),
        }
    }

    /// Weist Werte zurueck, mit denen der Server nicht sinnvoll laeuft
    pub fn pruefen(&self) -> anyhow::Result<()> {
        if !log_level_gueltig(&self.logging.level) {
            anyhow::bail!("Ungueltiges Log-Level '{}'", self.logging.level);
        }
        if !log_format_gueltig(&self.logging.format) {
            anyhow::bail!("Ungueltiges Log-Format '{}'", self.logging.format);
        }
        if self.zustellung.backlog_limit == 0 || self.zustellung.backlog_limit > MAX_BACKLOG_LIMIT {
            anyhow::bail!("zustellung.backlog_limit muss zwischen 1 und {MAX_BACKLOG_LIMIT} liegen");
        }
        if self.zustellung.reservierung_ms == 0 {
            anyhow::bail!("zustellung.reservierung_ms muss groesser 0 sein");
        }
        if self.zustellung.persist_timeout_ms == 0 {
            anyhow::bail!("zustellung.persist_timeout_ms muss groesser 0 sein");
        }
        if self.netzwerk.queue_groesse == 0 {
            anyhow::bail!("netzwerk.queue_groesse muss groesser 0 sein");
        }
        if self.netzwerk.verbindungs_timeout_sek <= self.netzwerk.keepalive_sek {
            anyhow::bail!("netzwerk.verbindungs_timeout_sek muss groesser als keepalive_sek sein");
        }
        Ok(())
    }

    /// Gibt die vollstaendige Bind-Adresse fuer TCP zurueck
    pub fn tcp_bind_adresse(&self) -> String {
        format!("{}:{}", self.netzwerk.bind_adresse, self.netzwerk.tcp_port)
    }

    pub fn chat_config(&self) -> ChatConfig {
        let z = &self.zustellung;
        ChatConfig {
            persist_timeout: Duration::from_millis(z.persist_timeout_ms),
            persist_retries: z.persist_retries,
            backlog_limit: z.backlog_limit,
            max_klartext: z.max_klartext,
            max_emoji: z.max_emoji,
            reservierung_gueltig: Duration::from_millis(z.reservierung_ms),
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            server_name: self.server.name.clone(),
            max_clients: self.server.max_clients,
            queue_groesse: self.netzwerk.queue_groesse,
            keepalive_sek: self.netzwerk.keepalive_sek,
            verbindungs_timeout_sek: self.netzwerk.verbindungs_timeout_sek,
        }
    }

    pub fn datenbank_config(&self) -> DatabaseConfig {
        DatabaseConfig {
            url: self.datenbank.url.clone(),
            max_verbindungen: self.datenbank.max_verbindungen,
            sqlite_wal: self.datenbank.sqlite_wal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_config_ist_valide() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.server.max_clients, 512);
        assert_eq!(cfg.netzwerk.tcp_port, 7443);
        assert_eq!(cfg.datenbank.url, "sqlite://encore.db");
        assert_eq!(cfg.logging.level, "info");
        assert!(cfg.pruefen().is_ok());
    }

    #[test]
    fn bind_adresse() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.tcp_bind_adresse(), "0.0.0.0:7443");
    }

    #[test]
    fn config_aus_toml_string() {
        let toml = r#"
            [server]
            name = "Mein Server"
            max_clients = 100

            [netzwerk]
            tcp_port = 10000

            [zustellung]
            persist_timeout_ms = 1500
            backlog_limit = 50
        "#;
        let cfg: ServerConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.server.name, "Mein Server");
        assert_eq!(cfg.server.max_clients, 100);
        assert_eq!(cfg.netzwerk.tcp_port, 10000);
        // Nicht angegebene Felder behalten Standardwerte
        assert_eq!(cfg.netzwerk.keepalive_sek, 30);
        assert_eq!(cfg.zustellung.persist_retries, 2);

        let chat = cfg.chat_config();
        assert_eq!(chat.persist_timeout, Duration::from_millis(1500));
        assert_eq!(chat.backlog_limit, 50);

        let dispatcher = cfg.dispatcher_config();
        assert_eq!(dispatcher.server_name, "Mein Server");
        assert_eq!(dispatcher.max_clients, 100);
    }

    #[test]
    fn standardwerte_entsprechen_chat_config() {
        let chat = ServerConfig::default().chat_config();
        let standard = ChatConfig::default();
        assert_eq!(chat.persist_timeout, standard.persist_timeout);
        assert_eq!(chat.max_klartext, standard.max_klartext);
        assert_eq!(chat.reservierung_gueltig, standard.reservierung_gueltig);
    }

    #[test]
    fn ungueltige_werte_werden_abgelehnt() {
        let mut cfg = ServerConfig::default();
        cfg.logging.level = "verbose".into();
        assert!(cfg.pruefen().is_err());

        let mut cfg = ServerConfig::default();
        cfg.zustellung.backlog_limit = 0;
        assert!(cfg.pruefen().is_err());

        let mut cfg = ServerConfig::default();
        cfg.zustellung.backlog_limit = u32::MAX;
        assert!(cfg.pruefen().is_err());
        cfg.zustellung.backlog_limit = MAX_BACKLOG_LIMIT;
        assert!(cfg.pruefen().is_ok());

        let mut cfg = ServerConfig::default();
        cfg.zustellung.reservierung_ms = 0;
        assert!(cfg.pruefen().is_err());

        let mut cfg = ServerConfig::default();
        cfg.netzwerk.verbindungs_timeout_sek = cfg.netzwerk.keepalive_sek;
        assert!(cfg.pruefen().is_err());
    }

    #[test]
    fn fehlende_datei_liefert_standardwerte() {
        let cfg = ServerConfig::laden("/nicht/vorhanden/encore.toml").unwrap();
        assert_eq!(cfg.server.name, "Encore Server");
    }
}
