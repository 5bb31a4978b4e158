use super::{AudioContainer, SynthesisClient, SynthesisConfig};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dotenv::dotenv;
use reqwest::Client as HttpClient;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed: Option<f32>,
}

/// Client for an OpenAI-compatible `audio/speech` endpoint.
#[derive(Debug, Clone)]
pub struct HttpSynthesisClient {
    http_client: HttpClient,
    config: SynthesisConfig,
}

impl HttpSynthesisClient {
    pub fn new(config: SynthesisConfig) -> Result<Self> {
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            http_client,
            config,
        })
    }

    /// Like `new`, taking the api key from `OPENAI_API_KEY` when the config
    /// has none.
    pub fn from_config(mut config: SynthesisConfig) -> Result<Self> {
        if config.api_key.as_deref().map_or(true, str::is_empty) {
            let _ = dotenv();
            config.api_key = std::env::var("OPENAI_API_KEY").ok();
        }
        Self::new(config)
    }
}

#[async_trait]
impl SynthesisClient for HttpSynthesisClient {
    async fn synthesize(&self, text: &str, voice: &str, format: AudioContainer) -> Result<Vec<u8>> {
        if text.trim().is_empty() {
            return Err(anyhow!("nothing to synthesize"));
        }
        let voice = if voice.is_empty() {
            self.config.default_voice.as_str()
        } else {
            voice
        };
        let body = SpeechRequest {
            model: &self.config.model,
            input: text,
            voice,
            response_format: format.as_str(),
            speed: self.config.speed,
        };

        let mut request = self.http_client.post(&self.config.url).json(&body);
        if let Some(api_key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.bearer_auth(api_key);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!("synthesis failed: {} {}", status, detail));
        }
        let audio = response.bytes().await?.to_vec();
        if audio.is_empty() {
            return Err(anyhow!("synthesis returned no audio"));
        }
        debug!(voice, format = format.as_str(), bytes = audio.len(), "synthesized speech");
        Ok(audio)
    }
}
