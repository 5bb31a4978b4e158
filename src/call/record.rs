use crate::numbers::NumberConfig;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Answered,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Agent,
    Caller,
}

impl Speaker {
    pub fn label(&self) -> &'static str {
        match self {
            Speaker::Agent => "Agent",
            Speaker::Caller => "Caller",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptEntry {
    pub role: Speaker,
    pub text: String,
    /// Agent turn this entry belongs to. A caller utterance carries the
    /// turn of the reply it prompted.
    pub turn: u32,
    pub timestamp: DateTime<Utc>,
}

/// State of one webhook-transport call.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub id: String,
    pub caller: String,
    pub called: String,
    pub number: NumberConfig,
    pub transcript: Vec<TranscriptEntry>,
    audio: HashMap<u32, Bytes>,
    pub status: CallStatus,
    pub turn: u32,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl CallRecord {
    pub fn new(id: String, caller: String, called: String, number: NumberConfig) -> Self {
        let now = Utc::now();
        Self {
            id,
            caller,
            called,
            number,
            transcript: Vec::new(),
            audio: HashMap::new(),
            status: CallStatus::Answered,
            turn: 0,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn push(&mut self, role: Speaker, text: impl Into<String>, turn: u32) {
        self.transcript.push(TranscriptEntry {
            role,
            text: text.into(),
            turn,
            timestamp: Utc::now(),
        });
        self.touch();
    }

    pub fn agent_text(&self, turn: u32) -> Option<&str> {
        self.transcript
            .iter()
            .rev()
            .find(|e| e.role == Speaker::Agent && e.turn == turn)
            .map(|e| e.text.as_str())
    }

    /// Replaces any segment already stored for `turn`.
    pub fn set_audio(&mut self, turn: u32, audio: Bytes) {
        self.audio.insert(turn, audio);
    }

    pub fn audio(&self, turn: u32) -> Option<Bytes> {
        self.audio.get(&turn).cloned()
    }

    pub fn has_audio(&self, turn: u32) -> bool {
        self.audio.contains_key(&turn)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CallSummary {
    pub id: String,
    pub caller: String,
    pub called: String,
    pub agent_name: String,
    pub status: CallStatus,
    pub turn: u32,
    pub transcript: Vec<TranscriptEntry>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl From<&CallRecord> for CallSummary {
    fn from(record: &CallRecord) -> Self {
        Self {
            id: record.id.clone(),
            caller: record.caller.clone(),
            called: record.called.clone(),
            agent_name: record.number.agent_name.clone(),
            status: record.status,
            turn: record.turn,
            transcript: record.transcript.clone(),
            created_at: record.created_at,
            last_activity: record.last_activity,
        }
    }
}

/// Live webhook calls keyed by call id.
#[derive(Debug, Default)]
pub struct CallStore {
    calls: Mutex<HashMap<String, CallRecord>>,
}

pub type CallStoreRef = Arc<CallStore>;

impl CallStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CallRecord>> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns false, leaving the live record untouched, if the id is taken.
    pub fn insert(&self, record: CallRecord) -> bool {
        let mut calls = self.lock();
        if calls.contains_key(&record.id) {
            return false;
        }
        calls.insert(record.id.clone(), record);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<CallRecord> {
        self.lock().get(id).cloned()
    }

    /// Run `f` against the record under the store lock.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut CallRecord) -> R) -> Option<R> {
        self.lock().get_mut(id).map(f)
    }

    pub fn remove(&self, id: &str) -> Option<CallRecord> {
        self.lock().remove(id)
    }

    pub fn audio(&self, id: &str, turn: u32) -> Option<Bytes> {
        self.update(id, |record| {
            record.touch();
            record.audio(turn)
        })
        .flatten()
    }

    pub fn list(&self) -> Vec<CallSummary> {
        let mut calls: Vec<CallSummary> = self.lock().values().map(CallSummary::from).collect();
        calls.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        calls
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Evict every record idle for longer than `timeout` as of `now`.
    /// Returns the evicted ids.
    pub fn sweep(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<String> {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        let mut evicted = Vec::new();
        self.lock().retain(|id, record| {
            let idle = now.signed_duration_since(record.last_activity) > timeout;
            if idle {
                evicted.push(id.clone());
            }
            !idle
        });
        evicted
    }
}

/// Periodically evict idle calls until `token` is cancelled.
pub async fn run_reaper(
    store: CallStoreRef,
    token: CancellationToken,
    every: Duration,
    timeout: Duration,
) {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = store.sweep(Utc::now(), timeout);
                for call_id in &evicted {
                    info!(call_id, "call timed out, evicted");
                }
                debug!(evicted = evicted.len(), live = store.len(), "reaper sweep");
            }
        }
    }
}
