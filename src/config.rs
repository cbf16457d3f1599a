//! Runtime configuration, read from `SOLA_*` environment variables.

use crate::codec::{INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use crate::gemini::GeminiClientConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SolaConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub voice: Option<String>,
    pub input_rate: u32,
    pub output_rate: u32,
    /// Samples per capture block.
    pub block_size: usize,
    /// Ringing time before the receptionist session opens.
    pub dial_delay_ms: u64,
    /// Pause before returning to the caller session.
    pub hangup_delay_ms: u64,
    /// Gap between closing one session and opening the next.
    pub settle_delay_ms: u64,
    pub places_file: Option<PathBuf>,
    pub calendar_file: PathBuf,
    pub audio_device: Option<String>,
}

impl Default for SolaConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: GeminiClientConfig::default().model,
            voice: None,
            input_rate: INPUT_SAMPLE_RATE,
            output_rate: OUTPUT_SAMPLE_RATE,
            block_size: 4096,
            dial_delay_ms: 3000,
            hangup_delay_ms: 1500,
            settle_delay_ms: 500,
            places_file: None,
            calendar_file: PathBuf::from("sola-appointments.ics"),
            audio_device: None,
        }
    }
}

impl SolaConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        config.api_key = get("GEMINI_API_KEY");
        if let Some(model) = get("SOLA_MODEL") {
            config.model = model;
        }
        config.voice = get("SOLA_VOICE");
        parse_into(&get, "SOLA_INPUT_RATE", &mut config.input_rate)?;
        parse_into(&get, "SOLA_OUTPUT_RATE", &mut config.output_rate)?;
        parse_into(&get, "SOLA_BLOCK_SIZE", &mut config.block_size)?;
        parse_into(&get, "SOLA_DIAL_DELAY_MS", &mut config.dial_delay_ms)?;
        parse_into(&get, "SOLA_HANGUP_DELAY_MS", &mut config.hangup_delay_ms)?;
        parse_into(&get, "SOLA_SETTLE_DELAY_MS", &mut config.settle_delay_ms)?;
        config.places_file = get("SOLA_PLACES_FILE").map(PathBuf::from);
        if let Some(path) = get("SOLA_CALENDAR_FILE") {
            config.calendar_file = PathBuf::from(path);
        }
        config.audio_device = get("SOLA_AUDIO_DEVICE");

        for (key, value) in [
            ("SOLA_INPUT_RATE", config.input_rate as usize),
            ("SOLA_OUTPUT_RATE", config.output_rate as usize),
            ("SOLA_BLOCK_SIZE", config.block_size),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    value: value.to_string(),
                });
            }
        }
        Ok(config)
    }

    pub fn dial_delay(&self) -> Duration {
        Duration::from_millis(self.dial_delay_ms)
    }

    pub fn hangup_delay(&self) -> Duration {
        Duration::from_millis(self.hangup_delay_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Connector settings; requires an API key.
    pub fn gemini(&self) -> Result<GeminiClientConfig, ConfigError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(ConfigError::Missing("GEMINI_API_KEY"))?;
        Ok(GeminiClientConfig {
            model: self.model.clone(),
            voice: self.voice.clone(),
            ..Default::default()
        }
        .with_api_key(api_key))
    }
}

fn parse_into<T, G>(get: &G, key: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    if let Some(value) = get(key) {
        *slot = value.trim().parse().map_err(|_| ConfigError::Invalid { key, value })?;
    }
    Ok(())
}
