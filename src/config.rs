use crate::call::WebhookConfig;
use crate::llm::LlmConfig;
use crate::numbers::NumberConfig;
use crate::synthesis::SynthesisConfig;
use crate::useragent::RegistrationConfig;
use anyhow::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub http_addr: String,
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    pub sip: Option<SipConfig>,
    pub webhook: WebhookConfig,
    pub llm: LlmConfig,
    pub tts: SynthesisConfig,
    pub numbers: BTreeMap<String, NumberConfig>,
    pub default_number: Option<NumberConfig>,
}

/// `[sip]`: the registrar account plus the phone route table.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SipConfig {
    #[serde(flatten)]
    pub registration: RegistrationConfig,
    #[serde(default)]
    pub routes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    pub field: &'static str,
    pub message: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            log_level: Some("info".to_string()),
            log_file: None,
            sip: None,
            webhook: WebhookConfig::default(),
            llm: LlmConfig::default(),
            tts: SynthesisConfig::default(),
            numbers: BTreeMap::new(),
            default_number: None,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }

    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        if self.http_addr.parse::<SocketAddr>().is_err() {
            issues.push(ConfigIssue {
                field: "http_addr",
                message: format!("not a socket address: {}", self.http_addr),
            });
        }
        if let Some(sip) = &self.sip {
            let registration = &sip.registration;
            if registration.server.trim().is_empty() {
                issues.push(ConfigIssue {
                    field: "sip.server",
                    message: "registrar host is empty".to_string(),
                });
            }
            if registration.username.trim().is_empty() {
                issues.push(ConfigIssue {
                    field: "sip.username",
                    message: "username is empty".to_string(),
                });
            }
            if registration.expires == 0 {
                issues.push(ConfigIssue {
                    field: "sip.expires",
                    message: "expires must be positive".to_string(),
                });
            }
        }
        let url = &self.webhook.public_url;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            issues.push(ConfigIssue {
                field: "webhook.public_url",
                message: format!("not an http(s) url: {}", url),
            });
        }
        if self.webhook.max_turns == 0 {
            issues.push(ConfigIssue {
                field: "webhook.max_turns",
                message: "max_turns must be at least 1".to_string(),
            });
        }
        issues
    }
}
