use anyhow::{anyhow, Result};
use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequest,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use dotenv::dotenv;
use serde::{Deserialize, Serialize};
use tracing::debug;


// Configuration for Language Model
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub base_url: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Provider name used when a request carries no hint.
    pub provider: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
            temperature: Some(0.7),
            max_tokens: Some(256),
            provider: None,
        }
    }
}

/// One completion: a prompt plus system instructions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateRequest {
    pub prompt: String,
    pub system: String,
    pub provider: Option<String>,
    pub max_tokens: Option<u32>,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>, system: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: system.into(),
            ..Default::default()
        }
    }

    pub fn with_provider(mut self, provider: Option<String>) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> Result<String>;
}

/// Used when no provider is configured; every request fails so callers fall
/// back to their static text.
pub struct UnavailableTextGenerator;

#[async_trait]
impl TextGenerator for UnavailableTextGenerator {
    async fn generate(&self, _request: GenerateRequest) -> Result<String> {
        Err(anyhow!("no text generation provider configured"))
    }
}

// Builder for OpenAI Client
#[derive(Default)]
pub struct OpenAiClientBuilder {
    api_key: Option<String>,
    base_url: Option<String>,
    org_id: Option<String>,
    config: LlmConfig,
}

impl OpenAiClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn from_env() -> Self {
        // Load .env file if it exists
        let _ = dotenv();

        Self {
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            base_url: std::env::var("OPENAI_BASE_URL").ok(),
            org_id: std::env::var("OPENAI_ORG_ID").ok(),
            config: LlmConfig::default(),
        }
    }

    /// Environment first, then anything set in `config` on top.
    pub fn from_config(config: &LlmConfig) -> Self {
        let mut builder = Self::from_env();
        if let Some(api_key) = config.api_key.as_ref().filter(|k| !k.is_empty()) {
            builder.api_key = Some(api_key.clone());
        }
        if let Some(base_url) = config.base_url.as_ref().filter(|u| !u.is_empty()) {
            builder.base_url = Some(base_url.clone());
        }
        builder.config = config.clone();
        builder
    }

    pub fn build(self) -> Result<OpenAiClient> {
        let api_key = self
            .api_key
            .ok_or_else(|| anyhow!("API key is required"))?;

        let mut openai_config = OpenAIConfig::new().with_api_key(api_key);

        if let Some(base_url) = self.base_url {
            openai_config = openai_config.with_api_base(base_url);
        }

        if let Some(org_id) = self.org_id {
            openai_config = openai_config.with_org_id(org_id);
        }

        Ok(OpenAiClient {
            client: Client::with_config(openai_config),
            config: self.config,
        })
    }
}

// OpenAI-compatible chat completion client
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    config: LlmConfig,
}

impl OpenAiClient {
    pub fn build_request(&self, request: &GenerateRequest) -> Result<CreateChatCompletionRequest> {
        let messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(&*request.system)
                .build()?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(&*request.prompt)
                .build()?
                .into(),
        ];
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.config.model).messages(messages);
        if let Some(temperature) = self.config.temperature {
            args.temperature(temperature);
        }
        if let Some(max_tokens) = request.max_tokens.or(self.config.max_tokens) {
            args.max_tokens(max_tokens);
        }
        Ok(args.build()?)
    }
}

#[async_trait]
impl TextGenerator for OpenAiClient {
    async fn generate(&self, request: GenerateRequest) -> Result<String> {
        let provider = request
            .provider
            .as_deref()
            .or(self.config.provider.as_deref())
            .unwrap_or("openai");
        debug!(provider, model = %self.config.model, "generating reply");

        let completion = self.build_request(&request)?;
        let response = self.client.chat().create(completion).await?;
        let text = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .unwrap_or_default();
        let text = text.trim();
        if text.is_empty() {
            return Err(anyhow!("empty completion from {}", provider));
        }
        Ok(text.to_string())
    }
}
