//! Conversational call handling: the webhook call store, the turn engine and
//! the raw-SIP greeting handler.
pub mod conversation;
pub mod record;
pub mod response;
pub mod sip_handler;

pub use conversation::{CallError, Orchestrator, OrchestratorRef, WebhookConfig};
pub use record::{run_reaper, CallRecord, CallStatus, CallStore, CallStoreRef, CallSummary};
pub use response::{ResponseDocument, ResponseFormat, Verb};
pub use sip_handler::ConversationInvitationHandler;
