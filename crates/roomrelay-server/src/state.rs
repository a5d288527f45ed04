use crate::relay::Relay;
use crate::ws::connections::ConnectionManager;
use roomrelay_protocol::MediaKind;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_address: String,
    /// Default tracing filter, used when `RUST_LOG` is not set
    pub log_level: String,
    /// Local IPv4 the media engine binds RTC sockets to
    pub rtc_ipv4: Option<String>,
    /// Public IPv4 announced in ICE candidates, when behind NAT
    pub rtc_announced_ipv4: Option<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub media_codecs: Vec<CodecConfig>,
}

/// One entry of the room codec table
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CodecConfig {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default)]
    pub channels: u16,
    #[serde(default)]
    pub parameters: String,
    pub payload_type: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            log_level: "roomrelay_server=debug,tower_http=debug".to_string(),
            rtc_ipv4: None,
            rtc_announced_ipv4: None,
            rtc_min_port: 40000,
            rtc_max_port: 49999,
            media_codecs: default_codecs(),
        }
    }
}

fn default_codecs() -> Vec<CodecConfig> {
    vec![
        CodecConfig {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            parameters: "minptime=10;useinbandfec=1".to_string(),
            payload_type: 111,
        },
        CodecConfig {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: 0,
            parameters: String::new(),
            payload_type: 96,
        },
        CodecConfig {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            clock_rate: 90000,
            channels: 0,
            // Baseline profile, level 3.1
            parameters: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                .to_string(),
            payload_type: 102,
        },
    ]
}

impl Config {
    /// Load from defaults, an optional `roomrelay.toml`, then `ROOMRELAY_*`
    /// environment variables.
    pub fn load() -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("roomrelay").required(false))
            .add_source(config::Environment::with_prefix("ROOMRELAY").try_parsing(true))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.rtc_min_port > self.rtc_max_port {
            anyhow::bail!(
                "rtc_min_port ({}) must not exceed rtc_max_port ({})",
                self.rtc_min_port,
                self.rtc_max_port
            );
        }

        if self.media_codecs.is_empty() {
            anyhow::bail!("media_codecs must list at least one codec");
        }

        for codec in &self.media_codecs {
            let prefix = format!("{}/", codec.kind);
            if !codec.mime_type.to_lowercase().starts_with(&prefix) {
                anyhow::bail!(
                    "codec {} does not match its kind {}",
                    codec.mime_type,
                    codec.kind
                );
            }
        }

        Ok(())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub relay: Arc<Relay>,
    pub connections: Arc<ConnectionManager>,
}

impl AppState {
    pub fn new(config: Config, relay: Arc<Relay>) -> Self {
        Self {
            config: Arc::new(config),
            relay,
            connections: Arc::new(ConnectionManager::new()),
        }
    }
}
