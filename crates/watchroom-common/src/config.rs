//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > watchroom.toml > defaults

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Get the global application configuration.
///
/// # Panics
/// Panics if config has not been initialized via [`init`].
pub fn get() -> &'static AppConfig {
    CONFIG
        .get()
        .expect("Config not initialized. Call watchroom_common::config::init() first.")
}

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup. Library code never reads the
/// global; it receives a [`VoiceConfig`] from whoever builds the session.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let app_config = load()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

/// Build an [`AppConfig`] from defaults, `watchroom.toml` and the environment.
pub fn load() -> Result<AppConfig, config::ConfigError> {
    let cfg = config::Config::builder()
        // Defaults
        .set_default("log.filter", "watchroom_voice=info,watchroom_sim=info")?
        .set_default("voice.strategy", "webrtc-fallback")?
        .set_default("voice.hysteresis_ms", 5_000)?
        .set_default("voice.relay_sample_rate", 16_000)?
        .set_default("voice.relay_frame_samples", 4_096)?
        .set_default("voice.silence_rms_threshold", 0.01)?
        .set_default("voice.near_zero_amplitude", 256)?
        .set_default("voice.max_near_zero_ratio", 0.95)?
        .set_default("voice.max_queue_delay_ms", 500)?
        .set_default("voice.noise_suppression", true)?
        // Optional config file
        .add_source(config::File::with_name("watchroom").required(false))
        // Environment variables (WATCHROOM_VOICE__HYSTERESIS_MS, WATCHROOM_LOG__FILTER, etc.)
        .add_source(
            config::Environment::with_prefix("WATCHROOM")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app: AppConfig = cfg.try_deserialize()?;
    app.voice.validate()?;
    Ok(app)
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub log: LogConfig,
    pub voice: VoiceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

/// How a member is meant to reach the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum VoiceStrategy {
    /// Direct mesh first, server relay once every direct link has failed.
    #[default]
    WebrtcFallback,
    /// Never attempt direct links; always relay through the server.
    ServerOnly,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VoiceConfig {
    pub strategy: VoiceStrategy,
    /// Grace period for a disconnected link to recover before it counts as failed.
    pub hysteresis_ms: u64,
    /// Relay frames are resampled to this rate (mono).
    pub relay_sample_rate: u32,
    pub relay_frame_samples: usize,
    /// Frames whose RMS (float domain, -1.0..1.0) is below this are never sent.
    pub silence_rms_threshold: f32,
    /// PCM16 magnitude under which a sample counts as near-zero.
    pub near_zero_amplitude: i16,
    pub max_near_zero_ratio: f32,
    /// Relay playback backlog beyond which the next frame is dropped.
    pub max_queue_delay_ms: u64,
    /// RNNoise denoising of captured audio (48 kHz capture only).
    pub noise_suppression: bool,
    /// STUN/TURN servers handed to the direct transport factory.
    #[serde(default = "IceServerConfig::defaults")]
    pub ice_servers: Vec<IceServerConfig>,
}

impl VoiceConfig {
    pub fn hysteresis(&self) -> Duration {
        Duration::from_millis(self.hysteresis_ms)
    }

    pub fn max_queue_delay(&self) -> Duration {
        Duration::from_millis(self.max_queue_delay_ms)
    }

    /// Reject values the relay pipeline cannot run with.
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.relay_sample_rate == 0 {
            return Err(config::ConfigError::Message(
                "voice.relay_sample_rate must be greater than zero".into(),
            ));
        }
        if self.relay_frame_samples == 0 {
            return Err(config::ConfigError::Message(
                "voice.relay_frame_samples must be greater than zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.max_near_zero_ratio) {
            return Err(config::ConfigError::Message(format!(
                "voice.max_near_zero_ratio must be within 0..=1, got {}",
                self.max_near_zero_ratio
            )));
        }
        Ok(())
    }
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            strategy: VoiceStrategy::WebrtcFallback,
            hysteresis_ms: 5_000,
            relay_sample_rate: 16_000,
            relay_frame_samples: 4_096,
            silence_rms_threshold: 0.01,
            near_zero_amplitude: 256,
            max_near_zero_ratio: 0.95,
            max_queue_delay_ms: 500,
            noise_suppression: true,
            ice_servers: IceServerConfig::defaults(),
        }
    }
}

/// ICE server configuration (STUN/TURN).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// Default public STUN servers, Cloudflare first.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::stun("stun:stun.cloudflare.com:3478"),
            Self::stun("stun:stun.numb.viagenie.ca:3478"),
            Self::stun("stun:stun.annatel.net:3478"),
            Self::stun("stun:stun.l.google.com:19302"),
            Self::stun("stun:stun1.l.google.com:19302"),
        ]
    }
}
