use super::conversation::OrchestratorRef;
use crate::synthesis::AudioContainer;
use crate::useragent::invitation::{InboundCall, InvitationHandler, PendingSpeech};
use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

/// Answers raw-SIP calls with a generated greeting rendered as WAV.
pub struct ConversationInvitationHandler {
    orchestrator: OrchestratorRef,
}

impl ConversationInvitationHandler {
    pub fn new(orchestrator: OrchestratorRef) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl InvitationHandler for ConversationInvitationHandler {
    async fn on_invite(&self, call: &InboundCall) -> Result<PendingSpeech> {
        let called = [call.called.as_str(), call.request_uri_number.as_str()]
            .into_iter()
            .find(|n| !n.is_empty())
            .unwrap_or_default();
        let number = self.orchestrator.resolve_routed(
            call.routed_destination.as_deref(),
            &[call.called.as_str(), call.request_uri_number.as_str()],
        );
        info!(
            call_id = call.call_id,
            caller = call.caller,
            called,
            routed = call.routed_destination.as_deref().unwrap_or("-"),
            agent = number.agent_name,
            "preparing greeting"
        );
        let text = self
            .orchestrator
            .greeting(&number, &call.caller, called)
            .await;
        Ok(PendingSpeech {
            text,
            voice: number.voice().to_string(),
        })
    }

    async fn synthesize(&self, speech: &PendingSpeech) -> Result<Vec<u8>> {
        self.orchestrator
            .synthesize(&speech.text, &speech.voice, AudioContainer::Wav)
            .await
    }

    fn apology(&self, speech: &PendingSpeech) -> Option<PendingSpeech> {
        Some(PendingSpeech {
            text: self.orchestrator.config.apology_line.clone(),
            voice: speech.voice.clone(),
        })
    }

    async fn on_hangup(&self, call_id: &str) {
        info!(call_id, "sip call finished");
    }
}
