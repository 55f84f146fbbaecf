use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged global configuration used by the running process.
///
/// Merge order: CLI flags override the YAML config file; the YAML config
/// file overrides these defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// SQLite DSN backing proxy keys and request logs.
    pub dsn: String,
    /// Logs older than this many days are swept away. <= 0 disables the sweep.
    pub log_retention_days: i64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8787,
            dsn: "sqlite://turnsapi.db?mode=rwc".to_string(),
            log_retention_days: 30,
        }
    }
}

/// Optional layer used for merging CLI overrides onto the file-loaded config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dsn: Option<String>,
    pub log_retention_days: Option<i64>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.dsn.is_some() {
            self.dsn = other.dsn;
        }
        if other.log_retention_days.is_some() {
            self.log_retention_days = other.log_retention_days;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        let defaults = GlobalConfig::default();
        Ok(GlobalConfig {
            host: self.host.unwrap_or(defaults.host),
            port: self.port.unwrap_or(defaults.port),
            dsn: self.dsn.unwrap_or(defaults.dsn),
            log_retention_days: self
                .log_retention_days
                .unwrap_or(defaults.log_retention_days),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            dsn: Some(value.dsn),
            log_retention_days: Some(value.log_retention_days),
        }
    }
}

/// Masks a credential to `prefix4****suffix4`. Keys of 4-8 chars have their
/// prefix and suffix slices overlap rather than lose either end (e.g.
/// `sk-aaa` -> `sk-a****-aaa`); only keys under 4 chars fall back to `****`.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() < 4 {
        return "****".to_string();
    }
    let prefix: String = chars[..4].iter().collect();
    let suffix: String = chars[chars.len() - 4..].iter().collect();
    format!("{prefix}****{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_long_keys_with_prefix_and_suffix() {
        assert_eq!(mask_key("sk-abcdefgh-xyz"), "sk-a****-xyz");
    }

    #[test]
    fn masks_a_short_key_with_overlapping_prefix_and_suffix() {
        assert_eq!(mask_key("sk-aaa"), "sk-a****-aaa");
    }

    #[test]
    fn masks_keys_under_four_chars_entirely() {
        assert_eq!(mask_key("ab"), "****");
    }

    #[test]
    fn patch_overlay_prefers_latest_values() {
        let mut base = GlobalConfigPatch {
            host: Some("127.0.0.1".to_string()),
            port: Some(8787),
            dsn: None,
            log_retention_days: None,
        };
        base.overlay(GlobalConfigPatch {
            host: None,
            port: Some(9000),
            dsn: Some("sqlite://x.db".to_string()),
            log_retention_days: None,
        });
        assert_eq!(base.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(base.port, Some(9000));
        assert_eq!(base.dsn.as_deref(), Some("sqlite://x.db"));
    }
}
