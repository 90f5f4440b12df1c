//! Engine configuration and JSON persistence.

use std::path::Path;
use std::time::Duration;
use std::{fs, io};

use serde::{Deserialize, Serialize};
use zflow_proto::Format;

use crate::{Error, Result};

/// Credits offered by default: the initiator's allotment for response
/// bodies and the responder's clear-to-send for uploads.
pub const IDEAL_CREDITS: u64 = 200_000;

/// Settings shared by initiators and responders.
///
/// Every field has a default, so a configuration file only needs to name
/// what it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
#[non_exhaustive]
pub struct Config {
    /// Identity placed in the `from` field of every outbound message.
    pub client_id: String,
    /// Wire flavor for outbound messages.
    pub format: Format,
    /// Credits granted to the responder when a flow is opened.
    pub initial_credits: u64,
    /// Credits a responder offers when a peer starts an upload or stream.
    pub ideal_credits: u64,
    /// Grant credits back for every body byte received.
    pub grant_on_receive: bool,
    /// Idle time after which an initiator pings an open stream.
    pub keep_alive_secs: u64,
    /// Idle time after which a responder fails a flow.
    pub session_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: format!("zflow-{}", std::process::id()),
            format: Format::Tnetstring,
            initial_credits: IDEAL_CREDITS,
            ideal_credits: IDEAL_CREDITS,
            grant_on_receive: true,
            keep_alive_secs: 30,
            session_timeout_secs: 600,
        }
    }
}

impl Config {
    /// Default configuration with the given identity.
    pub fn with_client_id(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    /// Loads configuration from a JSON file and validates it.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Persists configuration to a JSON file.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }

    /// Checks invariants the engine relies on.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() {
            return Err(Error::Config("client-id must not be empty".into()));
        }
        // Peers use the id as a reply address.
        if self.client_id.contains(char::is_whitespace) {
            return Err(Error::Config("client-id must not contain whitespace".into()));
        }
        if self.ideal_credits == 0 {
            return Err(Error::Config("ideal-credits must be positive".into()));
        }
        if self.session_timeout_secs == 0 {
            return Err(Error::Config("session-timeout-secs must be positive".into()));
        }
        Ok(())
    }

    /// Keep-alive interval, or `None` when disabled (`keep-alive-secs = 0`).
    pub const fn keep_alive_interval(&self) -> Option<Duration> {
        if self.keep_alive_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.keep_alive_secs))
        }
    }

    /// Responder idle timeout.
    pub const fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zflow.json");
        fs::write(&path, r#"{"client-id": "getstream", "format": "json"}"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.client_id, "getstream");
        assert_eq!(config.format, Format::Json);
        assert_eq!(config.initial_credits, IDEAL_CREDITS);
        assert!(config.grant_on_receive);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zflow.json");
        let mut config = Config::with_client_id("wsecho");
        config.keep_alive_secs = 0;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.keep_alive_interval(), None);
    }

    #[test]
    fn rejects_whitespace_in_id() {
        let config = Config::with_client_id("two words");
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_zero_ideal_credits() {
        let mut config = Config::with_client_id("x");
        config.ideal_credits = 0;
        assert!(config.validate().is_err());
    }
}
