//! Configuration resolution for sasverify.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/sasverify/settings.json)
//! 3. Project config (.sasverify/settings.json)
//! 4. Environment variables (highest priority)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::{MessageAuthenticationCode, ShortAuthenticationString};

/// Complete sasverify configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Verification engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// How long a request may stay unanswered, and the inactivity window
    /// of conversation verifications (seconds).
    pub request_timeout_secs: u64,
    /// How far in the future an incoming request timestamp may lie (seconds).
    pub max_future_skew_secs: u64,
    /// Short authentication string encodings we offer and accept.
    pub short_authentication_strings: Vec<ShortAuthenticationString>,
    /// Whether the legacy `hkdf-hmac-sha256` MAC may be negotiated.
    pub allow_legacy_mac: bool,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 10 * 60, // 10 minutes
            max_future_skew_secs: 5 * 60,
            short_authentication_strings: vec![
                ShortAuthenticationString::Decimal,
                ShortAuthenticationString::Emoji,
            ],
            allow_legacy_mac: true,
        }
    }
}

impl VerificationConfig {
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub const fn max_future_skew(&self) -> Duration {
        Duration::from_secs(self.max_future_skew_secs)
    }

    /// MAC methods in preference order.
    pub fn message_authentication_codes(&self) -> Vec<MessageAuthenticationCode> {
        // TODO: drop the legacy variant once no deployed peer negotiates it.
        let mut macs = vec![MessageAuthenticationCode::HkdfHmacSha256V2];
        if self.allow_legacy_mac {
            macs.push(MessageAuthenticationCode::HkdfHmacSha256);
        }
        macs
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `RUST_LOG`-style filter.
    pub level: String,
    /// Emit structured JSON log lines instead of the human-readable format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "sasverify_engine=info".to_string(),
            json: false,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        config = load_config_file(&global_path)?;
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".sasverify").join("settings.json");
        if project_path.exists() {
            config = load_config_file(&project_path)?;
        }
    }

    apply_env_overrides(&mut config);
    debug!(
        request_timeout_secs = config.verification.request_timeout_secs,
        allow_legacy_mac = config.verification.allow_legacy_mac,
        "Configuration resolved"
    );

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".sasverify").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/sasverify/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("sasverify").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

/// Read a single settings file. Missing sections fall back to defaults.
pub fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let config: Config = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    validate(&config)?;
    debug!(path = %path.display(), "Loaded config file");
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.verification.request_timeout_secs == 0 {
        return Err(Error::Config("request_timeout_secs must be positive".into()));
    }
    let offers_known_sas = config
        .verification
        .short_authentication_strings
        .iter()
        .any(|sas| !matches!(sas, ShortAuthenticationString::Unknown(_)));
    if !offers_known_sas {
        return Err(Error::Config(
            "short_authentication_strings must contain decimal or emoji".into(),
        ));
    }
    Ok(())
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("SASVERIFY_REQUEST_TIMEOUT_SECS")
        && let Ok(n) = val.parse::<u64>()
        && n > 0
    {
        config.verification.request_timeout_secs = n;
    }
    if let Ok(val) = std::env::var("SASVERIFY_ALLOW_LEGACY_MAC")
        && let Ok(b) = val.parse()
    {
        config.verification.allow_legacy_mac = b;
    }
    if let Ok(val) = std::env::var("SASVERIFY_LOG_LEVEL") {
        config.logging.level = val;
    }
    if let Ok(val) = std::env::var("SASVERIFY_LOG_JSON")
        && let Ok(b) = val.parse()
    {
        config.logging.json = b;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_request_timeout_is_ten_minutes() {
        let config = Config::default();
        assert_eq!(config.verification.request_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn v2_mac_is_preferred() {
        let config = VerificationConfig::default();
        assert_eq!(
            config.message_authentication_codes(),
            vec![
                MessageAuthenticationCode::HkdfHmacSha256V2,
                MessageAuthenticationCode::HkdfHmacSha256,
            ]
        );
    }

    #[test]
    fn legacy_mac_can_be_disabled() {
        let config = VerificationConfig {
            allow_legacy_mac: false,
            ..Default::default()
        };
        assert_eq!(
            config.message_authentication_codes(),
            vec![MessageAuthenticationCode::HkdfHmacSha256V2]
        );
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"logging": {"json": true}}"#).unwrap();

        let config = load_config_file(&path).unwrap();
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "sasverify_engine=info");
        assert_eq!(config.verification.request_timeout_secs, 600);
    }

    #[test]
    fn zero_timeout_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"verification": {"request_timeout_secs": 0}}"#).unwrap();

        assert!(matches!(load_config_file(&path), Err(Error::Config(_))));
    }

    #[test]
    fn unknown_only_sas_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"verification": {"short_authentication_strings": ["pictograms"]}}"#,
        )
        .unwrap();

        assert!(matches!(load_config_file(&path), Err(Error::Config(_))));
    }

    #[test]
    fn project_config_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join(".sasverify");
        std::fs::create_dir_all(&project).unwrap();
        std::fs::write(
            project.join("settings.json"),
            r#"{"verification": {"allow_legacy_mac": false}}"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path())).unwrap();
        assert!(!config.verification.allow_legacy_mac);
    }
}
