use std::{collections::HashMap, fs, path::Path};

use anyhow::Result;
use serde::Deserialize;

/// Main gateway configuration, loaded once at startup.
#[derive(Deserialize, Clone)]
pub struct Config {
    /// Plain listener the PBX connects to.
    pub pbx_addr: String,
    /// TLS listener the browser softphones connect to.
    pub browser_addr: String,
    pub cert_file: String,
    pub key_file: String,
    /// Wire framing on the PBX socket: `"json"` for the structured
    /// framing, anything else means plain text.
    #[serde(default)]
    pub pbx_format: String,
    /// Channel variable carrying the target extension in json mode.
    #[serde(default)]
    pub extension_variable: String,
    /// Regex whose capture group 1 extracts the extension from the
    /// connection id when the channel variable is absent.
    pub exten_search_pattern: String,
    pub token_secret: String,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub allowed_pbx_ips: Vec<String>,
    #[serde(default)]
    pub allowed_browser_ips: Vec<String>,
    #[serde(default)]
    pub log_level: String,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let contents = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.pbx_addr = normalize_address(&config.pbx_addr);
        config.browser_addr = normalize_address(&config.browser_addr);
        Ok(config)
    }
}

#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RingAll,
    Sequential,
}

/// One ring group: who to offer the call to and how long to wait.
/// For ring-all the timeout bounds the whole race, for sequential it
/// bounds each member in turn.
#[derive(Deserialize, Clone)]
pub struct GroupDef {
    pub strategy: Strategy,
    pub members: Vec<String>,
    pub timeout: u64,
}

pub fn load_groups(path: impl AsRef<Path>) -> Result<HashMap<String, GroupDef>> {
    let contents = fs::read_to_string(path)?;
    Ok(toml::from_str(&contents)?)
}

/// A bare port in the config means "every interface".
fn normalize_address(addr: &str) -> String {
    match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None if !addr.contains(':') => format!("0.0.0.0:{addr}"),
        None => addr.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_normalization() {
        assert_eq!(normalize_address("8080"), "0.0.0.0:8080");
        assert_eq!(normalize_address(":8080"), "0.0.0.0:8080");
        assert_eq!(normalize_address("127.0.0.1:8080"), "127.0.0.1:8080");
        assert_eq!(normalize_address("[::1]:8080"), "[::1]:8080");
    }

    #[test]
    fn parse_main_config() {
        let config: Config = toml::from_str(
            r#"
            pbx_addr = "8081"
            browser_addr = "0.0.0.0:8443"
            cert_file = "/etc/astergate/cert.pem"
            key_file = "/etc/astergate/key.pem"
            pbx_format = "json"
            extension_variable = "EXT"
            exten_search_pattern = '-(\d+)-'
            token_secret = "secret"
            allowed_origins = ["https://phone.example.com"]
            allowed_pbx_ips = ["10.0.0.0/8"]
            log_level = "DEBUG"
            "#,
        )
        .unwrap();
        assert_eq!(config.pbx_format, "json");
        assert_eq!(config.extension_variable, "EXT");
        assert!(config.allowed_browser_ips.is_empty());
    }

    #[test]
    fn parse_groups() {
        let groups: HashMap<String, GroupDef> = toml::from_str(
            r#"
            [800]
            strategy = "ring_all"
            members = ["1001", "1002", "1003"]
            timeout = 30

            [801]
            strategy = "sequential"
            members = ["1001", "1002"]
            timeout = 5
            "#,
        )
        .unwrap();
        assert_eq!(groups["800"].strategy, Strategy::RingAll);
        assert_eq!(groups["800"].members.len(), 3);
        assert_eq!(groups["801"].strategy, Strategy::Sequential);
        assert_eq!(groups["801"].timeout, 5);
    }

    #[test]
    fn unknown_strategy_is_an_error() {
        let result: Result<HashMap<String, GroupDef>, _> = toml::from_str(
            r#"
            [800]
            strategy = "broadcast"
            members = ["1001"]
            timeout = 30
            "#,
        );
        assert!(result.is_err());
    }
}
