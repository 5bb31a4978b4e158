use super::record::{CallRecord, CallStatus, CallStoreRef, Speaker};
use super::response::{ResponseDocument, ResponseFormat, Verb};
use crate::llm::{GenerateRequest, TextGenerator};
use crate::numbers::{NumberConfig, NumberDirectory};
use crate::synthesis::{AudioContainer, SynthesisClient};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

fn default_public_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Base URL the gateway uses for callbacks and audio fetches.
    pub public_url: String,
    pub max_turns: u32,
    pub call_timeout_secs: u64,
    pub reaper_interval_secs: u64,
    pub audio_format: AudioContainer,
    pub gather_timeout_secs: u32,
    pub language: Option<String>,
    pub reply_max_tokens: u32,
    pub closing_line: String,
    pub no_input_line: String,
    pub goodbye_line: String,
    pub apology_line: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            public_url: default_public_url(),
            max_turns: 10,
            call_timeout_secs: 600,
            reaper_interval_secs: 60,
            audio_format: AudioContainer::Mp3,
            gather_timeout_secs: 5,
            language: None,
            reply_max_tokens: 150,
            closing_line: "Thanks for calling. Goodbye.".to_string(),
            no_input_line: "Sorry, I didn't catch that.".to_string(),
            goodbye_line: "Sorry, I didn't catch that. Goodbye.".to_string(),
            apology_line: "Sorry, I'm having trouble right now. Please try again in a moment."
                .to_string(),
        }
    }
}

impl WebhookConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }

    fn base_url(&self) -> &str {
        self.public_url.trim_end_matches('/')
    }

    pub fn audio_url(&self, call_id: &str, turn: u32) -> String {
        format!(
            "{}/voice/audio/{}/{}",
            self.base_url(),
            urlencoding::encode(call_id),
            turn
        )
    }

    pub fn gather_url(&self, call_id: &str, turn: u32, format: ResponseFormat) -> String {
        let url = format!(
            "{}/voice/gather/{}/{}",
            self.base_url(),
            urlencoding::encode(call_id),
            turn
        );
        match format {
            ResponseFormat::Markup => url,
            other => format!("{}?format={}", url, other.as_param()),
        }
    }
}

/// Failures surfaced to webhook callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    MissingParameter(&'static str),
    UnknownCall(String),
    UnknownTurn { call_id: String, turn: u32 },
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::MissingParameter(name) => write!(f, "missing parameter: {}", name),
            CallError::UnknownCall(id) => write!(f, "unknown call: {}", id),
            CallError::UnknownTurn { call_id, turn } => {
                write!(f, "unknown turn {} for call {}", turn, call_id)
            }
        }
    }
}

impl std::error::Error for CallError {}

/// Drives conversational turns for both transports.
pub struct Orchestrator {
    pub config: WebhookConfig,
    pub calls: CallStoreRef,
    llm: Arc<dyn TextGenerator>,
    tts: Arc<dyn SynthesisClient>,
    numbers: Arc<dyn NumberDirectory>,
}

pub type OrchestratorRef = Arc<Orchestrator>;

impl Orchestrator {
    pub fn new(
        config: WebhookConfig,
        calls: CallStoreRef,
        llm: Arc<dyn TextGenerator>,
        tts: Arc<dyn SynthesisClient>,
        numbers: Arc<dyn NumberDirectory>,
    ) -> Self {
        Self {
            config,
            calls,
            llm,
            tts,
            numbers,
        }
    }

    pub fn resolve_number(&self, called: &str) -> NumberConfig {
        self.numbers.resolve(called).unwrap_or_default()
    }

    /// Number configuration for a routed raw-SIP call.
    ///
    /// The route destination names the entry; when it names none, the dialed
    /// numbers are tried. Unrouted calls get the default entry.
    pub fn resolve_routed(&self, destination: Option<&str>, dialed: &[&str]) -> NumberConfig {
        let routed = destination.and_then(|destination| {
            std::iter::once(destination)
                .chain(dialed.iter().copied())
                .filter(|key| !key.is_empty())
                .find_map(|key| self.numbers.lookup(key))
        });
        routed
            .or_else(|| self.numbers.fallback())
            .unwrap_or_default()
    }

    pub fn greeting_instructions(number: &NumberConfig, caller: &str, called: &str) -> String {
        let mut system = agent_preamble(number, caller, called);
        system.push_str(&format!(
            "Your usual greeting is: \"{}\"\n\
             Greet the caller in one or two short sentences suited to being spoken aloud. \
             Do not use markup, lists or emoji.",
            number.greeting
        ));
        system
    }

    pub fn reply_instructions(record: &CallRecord, utterance: &str) -> String {
        let mut system = agent_preamble(&record.number, &record.caller, &record.called);
        system.push_str("Conversation so far:\n");
        for entry in &record.transcript {
            system.push_str(&format!("{}: {}\n", entry.role.label(), entry.text));
        }
        system.push_str(&format!("Caller: {}\n", utterance));
        system.push_str(
            "Reply to the caller's last message in one to three short sentences suited to \
             being spoken aloud. Do not use markup, lists or emoji.",
        );
        system
    }

    /// The opening line, or the configured greeting verbatim when text
    /// generation fails.
    pub async fn greeting(&self, number: &NumberConfig, caller: &str, called: &str) -> String {
        let request = GenerateRequest::new(
            "The call has just been answered. Greet the caller.",
            Self::greeting_instructions(number, caller, called),
        )
        .with_provider(number.provider.clone());
        match self.llm.generate(request).await {
            Ok(text) => text,
            Err(e) => {
                warn!(caller, called, "greeting generation failed, using static greeting: {}", e);
                number.greeting.clone()
            }
        }
    }

    pub async fn synthesize(&self, text: &str, voice: &str, format: AudioContainer) -> anyhow::Result<Vec<u8>> {
        self.tts.synthesize(text, voice, format).await
    }

    async fn render_audio(&self, call_id: &str, text: &str, voice: &str) -> Option<Bytes> {
        match self.tts.synthesize(text, voice, self.config.audio_format).await {
            Ok(audio) => Some(Bytes::from(audio)),
            Err(e) => {
                warn!(call_id, "speech synthesis failed, gateway will speak the text: {}", e);
                None
            }
        }
    }

    /// Turn 0 of a webhook call.
    pub async fn start_call(
        &self,
        call_id: &str,
        caller: &str,
        called: &str,
        format: ResponseFormat,
    ) -> Result<ResponseDocument, CallError> {
        if call_id.is_empty() {
            return Err(CallError::MissingParameter("call id"));
        }
        if let Some(record) = self.calls.get(call_id) {
            debug!(call_id, "repeated inbound webhook for live call");
            return Ok(self.replay(&record, 0, format));
        }

        let number = self.resolve_number(called);
        let text = self.greeting(&number, caller, called).await;
        let audio = self.render_audio(call_id, &text, number.voice()).await;

        let mut record = CallRecord::new(
            call_id.to_string(),
            caller.to_string(),
            called.to_string(),
            number,
        );
        record.push(Speaker::Agent, text.clone(), 0);
        let has_audio = audio.is_some();
        if let Some(audio) = audio {
            record.set_audio(0, audio);
        }
        if !self.calls.insert(record) {
            // another request for the same call won the race
            if let Some(record) = self.calls.get(call_id) {
                return Ok(self.replay(&record, 0, format));
            }
        }
        info!(call_id, caller, called, "webhook call answered");
        Ok(self.turn_document(call_id, 0, &text, has_audio, format))
    }

    /// Caller speech arrived for the agent turn `turn`.
    pub async fn handle_gather(
        &self,
        call_id: &str,
        turn: u32,
        speech: &str,
        format: ResponseFormat,
    ) -> Result<ResponseDocument, CallError> {
        let record = self
            .calls
            .get(call_id)
            .ok_or_else(|| CallError::UnknownCall(call_id.to_string()))?;
        if turn > record.turn {
            return Err(CallError::UnknownTurn {
                call_id: call_id.to_string(),
                turn,
            });
        }
        if turn < record.turn {
            debug!(call_id, turn, current = record.turn, "repeated gather");
            return Ok(self.replay(&record, turn + 1, format));
        }
        if turn >= self.config.max_turns {
            info!(call_id, turn, "turn limit reached, closing call");
            self.calls.update(call_id, |r| {
                r.status = CallStatus::Completed;
                r.touch();
            });
            return Ok(self.closing_document());
        }

        let speech = speech.trim();
        if speech.is_empty() {
            self.calls.update(call_id, |r| r.touch());
            return Ok(self.no_input_document(call_id, turn, format));
        }

        let next = turn + 1;
        let max_turns = self.config.max_turns;
        let request = GenerateRequest::new(speech, Self::reply_instructions(&record, speech))
            .with_provider(record.number.provider.clone())
            .with_max_tokens(self.config.reply_max_tokens);
        let reply = match self.llm.generate(request).await {
            Ok(text) => text,
            Err(e) => {
                warn!(call_id, turn = next, "reply generation failed: {}", e);
                self.config.apology_line.clone()
            }
        };
        let audio = self.render_audio(call_id, &reply, record.number.voice()).await;
        let has_audio = audio.is_some();

        let committed = self
            .calls
            .update(call_id, |r| {
                if r.turn != turn {
                    return false;
                }
                r.push(Speaker::Caller, speech, next);
                r.push(Speaker::Agent, reply.clone(), next);
                if let Some(audio) = audio {
                    r.set_audio(next, audio);
                }
                r.turn = next;
                if next >= max_turns {
                    r.status = CallStatus::Completed;
                }
                true
            })
            .ok_or_else(|| CallError::UnknownCall(call_id.to_string()))?;
        if !committed {
            let record = self
                .calls
                .get(call_id)
                .ok_or_else(|| CallError::UnknownCall(call_id.to_string()))?;
            return Ok(self.replay(&record, next, format));
        }
        debug!(call_id, turn = next, "turn generated");
        Ok(self.turn_document(call_id, next, &reply, has_audio, format))
    }

    pub fn audio(&self, call_id: &str, turn: u32) -> Result<Bytes, CallError> {
        if !self.calls.contains(call_id) {
            return Err(CallError::UnknownCall(call_id.to_string()));
        }
        self.calls
            .audio(call_id, turn)
            .ok_or_else(|| CallError::UnknownTurn {
                call_id: call_id.to_string(),
                turn,
            })
    }

    /// Returns the final status when `status` ends the call.
    pub fn handle_status(&self, call_id: &str, status: &str) -> Option<CallStatus> {
        let final_status = match status.trim().to_ascii_lowercase().as_str() {
            "completed" => CallStatus::Completed,
            "busy" | "no-answer" | "canceled" | "cancelled" | "failed" => CallStatus::Failed,
            other => {
                debug!(call_id, status = other, "call status update");
                self.calls.update(call_id, |r| r.touch());
                return None;
            }
        };
        match self.calls.remove(call_id) {
            Some(_) => {
                info!(call_id, status, "call ended");
                Some(final_status)
            }
            None => {
                debug!(call_id, status, "final status for unknown call");
                None
            }
        }
    }

    fn turn_document(
        &self,
        call_id: &str,
        turn: u32,
        text: &str,
        has_audio: bool,
        format: ResponseFormat,
    ) -> ResponseDocument {
        let language = self.config.language.as_deref();
        let speak = if has_audio {
            Verb::Play {
                url: self.config.audio_url(call_id, turn),
            }
        } else {
            Verb::say(text, language)
        };
        let doc = ResponseDocument::new(text).push(speak);
        if turn >= self.config.max_turns {
            return doc
                .push(Verb::say(&self.config.closing_line, language))
                .push(Verb::Hangup);
        }
        doc.push(Verb::Gather {
            action: self.config.gather_url(call_id, turn, format),
            timeout_secs: self.config.gather_timeout_secs,
            language: self.config.language.clone(),
        })
        .push(Verb::say(&self.config.goodbye_line, language))
        .push(Verb::Hangup)
    }

    fn replay(&self, record: &CallRecord, turn: u32, format: ResponseFormat) -> ResponseDocument {
        match record.agent_text(turn) {
            Some(text) => self.turn_document(&record.id, turn, text, record.has_audio(turn), format),
            None => self.closing_document(),
        }
    }

    fn closing_document(&self) -> ResponseDocument {
        let language = self.config.language.as_deref();
        ResponseDocument::new(&self.config.closing_line)
            .push(Verb::say(&self.config.closing_line, language))
            .push(Verb::Hangup)
    }

    fn no_input_document(&self, call_id: &str, turn: u32, format: ResponseFormat) -> ResponseDocument {
        let language = self.config.language.as_deref();
        ResponseDocument::new(&self.config.no_input_line)
            .push(Verb::say(&self.config.no_input_line, language))
            .push(Verb::Gather {
                action: self.config.gather_url(call_id, turn, format),
                timeout_secs: self.config.gather_timeout_secs,
                language: self.config.language.clone(),
            })
            .push(Verb::say(&self.config.goodbye_line, language))
            .push(Verb::Hangup)
    }
}

fn agent_preamble(number: &NumberConfig, caller: &str, called: &str) -> String {
    let mut system = String::new();
    if !number.system_prompt.is_empty() {
        system.push_str(&number.system_prompt);
        system.push_str("\n\n");
    }
    system.push_str(&format!(
        "You are {}, answering a phone call.\n",
        number.agent_name
    ));
    if !caller.is_empty() {
        system.push_str(&format!("Caller number: {}\n", caller));
    }
    if !called.is_empty() {
        system.push_str(&format!("Number dialed: {}\n", called));
    }
    if let Some(notes) = number.caller_history_notes.as_deref().filter(|n| !n.is_empty()) {
        system.push_str(&format!("Notes about this caller: {}\n", notes));
    }
    system
}
