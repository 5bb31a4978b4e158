use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

mod http;
pub use http::HttpSynthesisClient;


/// Audio container returned by the speech service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioContainer {
    Wav,
    #[default]
    Mp3,
}

impl AudioContainer {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioContainer::Wav => "wav",
            AudioContainer::Mp3 => "mp3",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            AudioContainer::Wav => "audio/wav",
            AudioContainer::Mp3 => "audio/mpeg",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Full endpoint, e.g. `https://api.openai.com/v1/audio/speech`.
    pub url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    pub default_voice: String,
    pub speed: Option<f32>,
    pub timeout_secs: u64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            url: "https://api.openai.com/v1/audio/speech".to_string(),
            api_key: None,
            model: "tts-1".to_string(),
            default_voice: "alloy".to_string(),
            speed: None,
            timeout_secs: 30,
        }
    }
}

#[async_trait]
pub trait SynthesisClient: Send + Sync {
    /// An empty `voice` selects the client's default voice.
    async fn synthesize(&self, text: &str, voice: &str, format: AudioContainer) -> Result<Vec<u8>>;
}
