//! Per-number agent configuration.
use crate::useragent::routes::normalize_number;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

fn default_agent_name() -> String {
    "Assistant".to_string()
}

fn default_greeting() -> String {
    "Hello, thanks for calling. How can I help you today?".to_string()
}

fn default_system_prompt() -> String {
    "You are a friendly, concise phone assistant.".to_string()
}

/// How the agent behind one phone number introduces itself and behaves.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NumberConfig {
    pub agent_name: String,
    /// Spoken verbatim when the greeting cannot be generated.
    pub greeting: String,
    pub system_prompt: String,
    pub voice: Option<String>,
    pub caller_history_notes: Option<String>,
    /// Text-generation provider hint.
    pub provider: Option<String>,
}

impl Default for NumberConfig {
    fn default() -> Self {
        Self {
            agent_name: default_agent_name(),
            greeting: default_greeting(),
            system_prompt: default_system_prompt(),
            voice: None,
            caller_history_notes: None,
            provider: None,
        }
    }
}

impl NumberConfig {
    pub fn voice(&self) -> &str {
        self.voice.as_deref().unwrap_or_default()
    }
}

pub trait NumberDirectory: Send + Sync {
    /// The entry configured for `key`, without falling back.
    fn lookup(&self, key: &str) -> Option<NumberConfig>;

    /// The entry for numbers nothing else claims.
    fn fallback(&self) -> Option<NumberConfig>;

    fn resolve(&self, called: &str) -> Option<NumberConfig> {
        self.lookup(called).or_else(|| self.fallback())
    }
}

/// Directory backed by the `[numbers]` config table.
#[derive(Debug, Clone, Default)]
pub struct StaticNumberDirectory {
    numbers: HashMap<String, NumberConfig>,
    normalized: HashMap<String, NumberConfig>,
    default: Option<NumberConfig>,
}

impl StaticNumberDirectory {
    pub fn new(numbers: BTreeMap<String, NumberConfig>, default: Option<NumberConfig>) -> Self {
        let normalized = numbers
            .iter()
            .map(|(number, config)| (normalize_number(number), config.clone()))
            .filter(|(number, _)| !number.is_empty())
            .collect();
        Self {
            numbers: numbers.into_iter().collect(),
            normalized,
            default,
        }
    }

    pub fn len(&self) -> usize {
        self.numbers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.numbers.is_empty()
    }
}

impl NumberDirectory for StaticNumberDirectory {
    fn lookup(&self, key: &str) -> Option<NumberConfig> {
        if let Some(config) = self.numbers.get(key) {
            return Some(config.clone());
        }
        self.normalized.get(&normalize_number(key)).cloned()
    }

    fn fallback(&self) -> Option<NumberConfig> {
        self.default.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory(default: Option<NumberConfig>) -> StaticNumberDirectory {
        let mut numbers = BTreeMap::new();
        numbers.insert(
            "+442012345678".to_string(),
            NumberConfig {
                agent_name: "Ada".to_string(),
                voice: Some("nova".to_string()),
                ..Default::default()
            },
        );
        StaticNumberDirectory::new(numbers, default)
    }

    #[test]
    fn test_resolve_exact_and_normalized() {
        let dir = directory(None);
        assert_eq!(dir.resolve("+442012345678").unwrap().agent_name, "Ada");
        assert_eq!(dir.resolve("442012345678").unwrap().agent_name, "Ada");
        assert_eq!(dir.resolve("+44 20 1234 5678").unwrap().voice(), "nova");
        assert!(dir.resolve("15550000").is_none());
        assert!(dir.lookup("").is_none());
    }

    #[test]
    fn test_resolve_falls_back_to_default() {
        let dir = directory(Some(NumberConfig {
            agent_name: "Front desk".to_string(),
            ..Default::default()
        }));
        assert_eq!(dir.resolve("15550000").unwrap().agent_name, "Front desk");
        assert_eq!(dir.resolve("").unwrap().agent_name, "Front desk");
        assert!(dir.lookup("15550000").is_none());
        assert_eq!(dir.fallback().unwrap().agent_name, "Front desk");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: NumberConfig = toml::from_str("agent_name = \"Bob\"").unwrap();
        assert_eq!(config.agent_name, "Bob");
        assert_eq!(config.greeting, default_greeting());
        assert_eq!(config.voice(), "");
    }
}
