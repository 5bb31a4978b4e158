use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;

/// What the engine knows about an inbound INVITE when it asks for a greeting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundCall {
    pub call_id: String,
    pub caller: String,
    pub called: String,
    pub request_uri_number: String,
    /// Destination from the phone route table, `None` when no route matched.
    pub routed_destination: Option<String>,
}

/// Text waiting to be spoken once the caller ACKs the answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingSpeech {
    pub text: String,
    pub voice: String,
}

/// The orchestration side of a raw-SIP call.
///
/// `on_invite` runs outside the signaling loop, so a slow answer delays only
/// its own call. Returning an error rejects the INVITE with a 500.
#[async_trait]
pub trait InvitationHandler: Send + Sync {
    async fn on_invite(&self, call: &InboundCall) -> Result<PendingSpeech>;

    /// Render speech to audio (WAV or raw 16-bit PCM).
    async fn synthesize(&self, speech: &PendingSpeech) -> Result<Vec<u8>>;

    /// Substitute line to try when `synthesize` fails.
    fn apology(&self, _speech: &PendingSpeech) -> Option<PendingSpeech> {
        None
    }

    async fn on_hangup(&self, _call_id: &str) {}
}

/// Rejects every call; used when no handler is configured.
pub struct UnavailableInvitationHandler;

#[async_trait]
impl InvitationHandler for UnavailableInvitationHandler {
    async fn on_invite(&self, call: &InboundCall) -> Result<PendingSpeech> {
        Err(anyhow!("no invitation handler for call {}", call.call_id))
    }

    async fn synthesize(&self, _speech: &PendingSpeech) -> Result<Vec<u8>> {
        Err(anyhow!("no invitation handler"))
    }
}
