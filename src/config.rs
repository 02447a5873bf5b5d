use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::decoder::types::SessionKeys;
use crate::filter::RouterMatch;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub stream: StreamConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub view: ViewConfig,
    #[serde(default)]
    pub recorder: RecorderConfig,
    pub decoder: Option<DecoderConfig>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct StreamConfig {
    /// WebSocket URL of the uplink feed
    pub url: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct FilterConfig {
    /// DevEui filter, any formatting (normalized on load)
    pub device: Option<String>,
    /// Stream-level router pre-filter
    pub router: Option<String>,
    #[serde(default)]
    pub router_match: RouterMatch,
}

#[derive(Debug, Default, Deserialize)]
pub struct ViewConfig {
    /// Presentation-level substring filter on router ids
    pub router_contains: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RecorderConfig {
    /// Start recording as soon as the session starts
    #[serde(default)]
    pub enabled: bool,
    /// CSV written on shutdown
    pub export_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecoderConfig {
    pub url: String,
    pub apps_key: String,
    pub nwks_key: String,
    #[serde(default)]
    pub direct_class_b: bool,
}

impl DecoderConfig {
    pub fn session_keys(&self) -> SessionKeys {
        SessionKeys {
            apps_key: self.apps_key.clone(),
            nwks_key: self.nwks_key.clone(),
            direct_class_b: self.direct_class_b,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stream: StreamConfig {
                url: "ws://127.0.0.1:7002/uplinks".to_string(),
            },
            filter: FilterConfig::default(),
            view: ViewConfig::default(),
            recorder: RecorderConfig::default(),
            decoder: None,
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = Config::parse(
            r#"
            [stream]
            url = "ws://loranet.example:7002/owner-c::2"

            [filter]
            device = "EB9BD6AC12B61EED"
            router = "12"
            router_match = "contains"

            [recorder]
            enabled = true
            export_path = "samples.csv"

            [decoder]
            url = "http://127.0.0.1:8000/decode"
            apps_key = "00112233445566778899aabbccddeeff"
            nwks_key = "ffeeddccbbaa99887766554433221100"

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.filter.router_match, RouterMatch::Contains);
        assert!(config.recorder.enabled);
        let decoder = config.decoder.unwrap();
        assert!(!decoder.direct_class_b);
        assert_eq!(decoder.session_keys().apps_key, "00112233445566778899aabbccddeeff");
    }

    #[test]
    fn test_optional_sections_default() {
        let config = Config::parse(
            r#"
            [stream]
            url = "ws://127.0.0.1:7002"

            [logging]
            level = "info"
            "#,
        )
        .unwrap();

        assert!(config.filter.device.is_none());
        assert_eq!(config.filter.router_match, RouterMatch::Exact);
        assert!(!config.recorder.enabled);
        assert!(config.decoder.is_none());
    }

    #[test]
    fn test_bad_router_match_is_rejected() {
        let result = Config::parse(
            r#"
            [stream]
            url = "ws://127.0.0.1:7002"
            [filter]
            router_match = "prefix"
            [logging]
            level = "info"
            "#,
        );
        assert!(result.is_err());
    }
}
