use std::collections::HashMap;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use tokio_tungstenite::tungstenite::Message;

use crate::config::Config;

/// Event string marking a media-offering call on the PBX socket.
pub const MEDIA_START: &str = "MEDIA_START";

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PbxFormat {
    Text,
    Json,
}

/// Structured framing of the first PBX frame.
#[derive(Deserialize)]
struct PbxJsonMessage {
    #[serde(default)]
    event: String,
    #[serde(default)]
    connection_id: String,
    #[serde(default)]
    channel_variables: HashMap<String, String>,
}

/// What the first PBX frame declared about the call.
pub struct PbxHello {
    pub media_start: bool,
    pub target: String,
}

/// Parses the PBX hello in either framing and encodes commands back.
/// Both extension patterns compile once at startup; a pattern that does
/// not compile is a configuration error.
pub struct PbxParser {
    format: PbxFormat,
    extension_variable: String,
    exten_pattern: Regex,
    text_exten_pattern: Regex,
}

impl PbxParser {
    pub fn new(config: &Config) -> Result<PbxParser> {
        let format = if config.pbx_format == "json" {
            PbxFormat::Json
        } else {
            PbxFormat::Text
        };
        let exten_pattern = Regex::new(&config.exten_search_pattern)
            .with_context(|| {
                format!("bad exten_search_pattern {:?}", config.exten_search_pattern)
            })?;
        let text_exten_pattern =
            Regex::new(&format!("connection_id:{}", config.exten_search_pattern))
                .with_context(|| {
                    format!(
                        "bad exten_search_pattern {:?}",
                        config.exten_search_pattern
                    )
                })?;
        Ok(PbxParser {
            format,
            extension_variable: config.extension_variable.clone(),
            exten_pattern,
            text_exten_pattern,
        })
    }

    pub fn format(&self) -> PbxFormat {
        self.format
    }

    /// Extract event kind and target extension from the first PBX
    /// frame. None means the target cannot be resolved and the
    /// connection should be dropped.
    pub fn parse_hello(&self, raw: &str) -> Option<PbxHello> {
        match self.format {
            PbxFormat::Json => {
                let msg: PbxJsonMessage = serde_json::from_str(raw).ok()?;
                let media_start = msg.event == MEDIA_START;
                let target = match msg.channel_variables.get(&self.extension_variable)
                {
                    Some(ext) if !ext.is_empty() => ext.clone(),
                    _ => self.capture_extension(&self.exten_pattern, &msg.connection_id)?,
                };
                Some(PbxHello { media_start, target })
            }
            PbxFormat::Text => {
                let media_start = raw.contains(MEDIA_START);
                let target = self.capture_extension(&self.text_exten_pattern, raw)?;
                Some(PbxHello { media_start, target })
            }
        }
    }

    fn capture_extension(&self, pattern: &Regex, haystack: &str) -> Option<String> {
        let target = pattern.captures(haystack)?.get(1)?.as_str().to_string();
        if target.is_empty() {
            return None;
        }
        Some(target)
    }

    /// Encode a command frame for the PBX in the configured framing.
    pub fn command(&self, cmd: &str) -> Message {
        match self.format {
            PbxFormat::Json => Message::Text(format!("{{\"command\": \"{cmd}\"}}")),
            PbxFormat::Text => Message::Text(cmd.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser(format: &str) -> PbxParser {
        let config: Config = toml::from_str(&format!(
            r#"
            pbx_addr = "8081"
            browser_addr = "8443"
            cert_file = "cert.pem"
            key_file = "key.pem"
            pbx_format = "{format}"
            extension_variable = "EXT"
            exten_search_pattern = '\w+-(\d+)-'
            token_secret = "secret"
            "#
        ))
        .unwrap();
        PbxParser::new(&config).unwrap()
    }

    #[test]
    fn json_hello_with_channel_variable() {
        let hello = parser("json")
            .parse_hello(
                r#"{"event":"MEDIA_START","connection_id":"x-1001-y","channel_variables":{"EXT":"1001"}}"#,
            )
            .unwrap();
        assert!(hello.media_start);
        assert_eq!(hello.target, "1001");
    }

    #[test]
    fn json_hello_falls_back_to_connection_id() {
        let hello = parser("json")
            .parse_hello(
                r#"{"event":"MEDIA_START","connection_id":"x-1001-y","channel_variables":{}}"#,
            )
            .unwrap();
        assert_eq!(hello.target, "1001");
    }

    #[test]
    fn json_hello_without_media_start() {
        let hello = parser("json")
            .parse_hello(r#"{"event":"DTMF","connection_id":"x-1001-y"}"#)
            .unwrap();
        assert!(!hello.media_start);
        assert_eq!(hello.target, "1001");
    }

    #[test]
    fn json_hello_without_target_is_dropped() {
        assert!(parser("json")
            .parse_hello(r#"{"event":"MEDIA_START","connection_id":"nothing"}"#)
            .is_none());
    }

    #[test]
    fn malformed_json_is_dropped() {
        assert!(parser("json").parse_hello("{not json").is_none());
    }

    #[test]
    fn text_hello() {
        let hello = parser("text")
            .parse_hello("MEDIA_START connection_id:x-1001-y")
            .unwrap();
        assert!(hello.media_start);
        assert_eq!(hello.target, "1001");
    }

    #[test]
    fn text_hello_without_media_start() {
        let hello = parser("text")
            .parse_hello("HELLO connection_id:x-1001-y")
            .unwrap();
        assert!(!hello.media_start);
    }

    #[test]
    fn text_hello_without_target_is_dropped() {
        assert!(parser("text").parse_hello("MEDIA_START").is_none());
    }

    #[test]
    fn command_encoding() {
        assert_eq!(
            parser("json").command("ANSWER"),
            Message::Text(r#"{"command": "ANSWER"}"#.to_string())
        );
        assert_eq!(
            parser("text").command("HANGUP"),
            Message::Text("HANGUP".to_string())
        );
    }

    #[test]
    fn invalid_pattern_is_fatal() {
        let config: Config = toml::from_str(
            r#"
            pbx_addr = "8081"
            browser_addr = "8443"
            cert_file = "cert.pem"
            key_file = "key.pem"
            exten_search_pattern = '-(\d+'
            token_secret = "secret"
            "#,
        )
        .unwrap();
        assert!(PbxParser::new(&config).is_err());
    }
}
