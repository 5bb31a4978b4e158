use super::invitation::{InboundCall, InvitationHandler, PendingSpeech};
use super::registration::advertised_addr;
use super::transport::Connection;
use super::UserAgent;
use crate::media::codecs::prepare_ulaw;
use crate::media::rtp::{RtpSession, RtpSessionRef};
use crate::media::sdp;
use crate::sip::builder::{new_tag, response_for};
use crate::sip::message::extract_user;
use crate::sip::{Method, SipMessage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// An answered raw-SIP call.
pub struct SipDialog {
    pub call_id: String,
    pub caller: String,
    pub called: String,
    pub created_at: DateTime<Utc>,
    pub rtp: RtpSessionRef,
    /// Spoken on the first ACK, then cleared.
    pub pending_speech: Option<PendingSpeech>,
    pub invite: SipMessage,
    /// The 200 OK we sent, repeated if the INVITE is retransmitted.
    pub answer: SipMessage,
    pub local_tag: String,
}

/// An INVITE whose greeting is still being prepared.
pub(super) struct PendingInvite {
    pub token: CancellationToken,
    pub invite: SipMessage,
    pub local_tag: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DialogSummary {
    pub call_id: String,
    pub caller: String,
    pub called: String,
    pub created_at: DateTime<Utc>,
    pub local_rtp_port: u16,
    pub remote_rtp: String,
}

impl From<&SipDialog> for DialogSummary {
    fn from(dialog: &SipDialog) -> Self {
        Self {
            call_id: dialog.call_id.clone(),
            caller: dialog.caller.clone(),
            called: dialog.called.clone(),
            created_at: dialog.created_at,
            local_rtp_port: dialog.rtp.local_port(),
            remote_rtp: dialog.rtp.remote_addr().to_string(),
        }
    }
}

fn reply(conn: &Connection, request: &SipMessage, status: u16, to_tag: Option<&str>) {
    let response = response_for(request, status, to_tag);
    if let Err(e) = conn.send(&response) {
        warn!(call_id = request.call_id(), status, "failed to send response: {}", e);
    }
}

impl UserAgent {
    /// Dispatch one inbound request. Called from the connection read loop,
    /// so anything slow is spawned.
    pub(super) async fn handle_request(self: &Arc<Self>, conn: &Connection, request: SipMessage) {
        let Some(method) = request.method().cloned() else {
            return;
        };
        if request.call_id().is_none() || request.cseq().is_none() {
            warn!(method = %method, "dropping request without Call-ID/CSeq");
            reply(conn, &request, 400, None);
            return;
        }
        match method {
            Method::Invite => self.handle_invite(conn, request).await,
            Method::Ack => self.handle_ack(request).await,
            Method::Bye => self.handle_bye(conn, request).await,
            Method::Cancel => self.handle_cancel(conn, request).await,
            Method::Options => reply(conn, &request, 200, Some(&new_tag())),
            other => {
                info!(method = %other, call_id = request.call_id(), "ignoring unsupported request");
            }
        }
    }

    async fn handle_invite(self: &Arc<Self>, conn: &Connection, invite: SipMessage) {
        let call_id = invite.call_id().unwrap_or_default().to_string();

        if let Some(dialog) = self.dialogs.lock().await.get(&call_id) {
            debug!(call_id, "invite for existing dialog, repeating answer");
            if let Err(e) = conn.send(&dialog.answer) {
                warn!(call_id, "failed to repeat answer: {}", e);
            }
            return;
        }
        if self.lock_pending().contains_key(&call_id) {
            reply(conn, &invite, 100, None);
            return;
        }

        reply(conn, &invite, 100, None);

        let Some(remote_rtp) = sdp::parse_remote_endpoint(&invite.body_str()) else {
            warn!(call_id, "invite without usable audio offer");
            reply(conn, &invite, 488, Some(&new_tag()));
            return;
        };

        let caller = invite.header("from").and_then(extract_user).unwrap_or_default();
        let called = invite.header("to").and_then(extract_user).unwrap_or_default();
        let request_uri_number = invite.uri().and_then(extract_user).unwrap_or_default();
        let inbound_number = self
            .config()
            .and_then(|c| c.inbound_number)
            .unwrap_or_default();
        let routed_destination =
            self.routes
                .resolve(&[called.as_str(), request_uri_number.as_str(), inbound_number.as_str()]);

        let local_tag = new_tag();
        reply(conn, &invite, 180, Some(&local_tag));
        info!(
            call_id,
            caller,
            called,
            routed = routed_destination.as_deref().unwrap_or("-"),
            "inbound call ringing"
        );

        let token = self.token.child_token();
        self.lock_pending().insert(
            call_id.clone(),
            PendingInvite {
                token: token.clone(),
                invite: invite.clone(),
                local_tag: local_tag.clone(),
            },
        );

        let call = InboundCall {
            call_id,
            caller,
            called,
            request_uri_number,
            routed_destination,
        };
        let ua = self.clone();
        tokio::spawn(async move {
            ua.answer_invite(call, invite, local_tag, remote_rtp, token).await;
        });
    }

    async fn answer_invite(
        self: Arc<Self>,
        call: InboundCall,
        invite: SipMessage,
        local_tag: String,
        remote_rtp: std::net::SocketAddr,
        token: CancellationToken,
    ) {
        let call_id = call.call_id.clone();
        let speech = select! {
            _ = token.cancelled() => {
                debug!(call_id, "invite cancelled while preparing greeting");
                return;
            }
            result = self.invitation_handler.on_invite(&call) => result,
        };

        let answered = match speech {
            Ok(speech) => RtpSession::open(remote_rtp, token.child_token())
                .await
                .map(|rtp| (speech, rtp)),
            Err(e) => Err(e),
        };

        let Some(conn) = self.current_connection() else {
            warn!(call_id, "no signaling connection to answer on");
            self.lock_pending().remove(&call_id);
            return;
        };

        let (speech, rtp) = match answered {
            Ok(answered) => answered,
            Err(e) => {
                warn!(call_id, "failed to handle invite: {}", e);
                if self.lock_pending().remove(&call_id).is_some() {
                    reply(&conn, &invite, 500, Some(&local_tag));
                }
                return;
            }
        };

        let mut dialogs = self.dialogs.lock().await;
        if self.lock_pending().remove(&call_id).is_none() {
            // CANCEL won the race
            rtp.close();
            return;
        }

        let local = advertised_addr(&conn);
        let mut ok = response_for(&invite, 200, Some(&local_tag));
        let contact_user = if call.called.is_empty() {
            "sipvoice"
        } else {
            call.called.as_str()
        };
        ok.add_header("Contact", format!("<sip:{}@{}>", contact_user, local));
        ok.add_header("Content-Type", "application/sdp");
        ok.body = sdp::build_answer(local.ip(), rtp.local_port(), rand::random::<u32>() as u64)
            .into_bytes();
        if let Err(e) = conn.send(&ok) {
            warn!(call_id, "failed to send 200 OK: {}", e);
            rtp.close();
            return;
        }

        info!(
            call_id,
            rtp_local = rtp.local_port(),
            rtp_remote = %rtp.remote_addr(),
            "call answered"
        );
        dialogs.insert(
            call_id.clone(),
            SipDialog {
                call_id,
                caller: call.caller,
                called: call.called,
                created_at: Utc::now(),
                rtp,
                pending_speech: Some(speech),
                invite,
                answer: ok,
                local_tag,
            },
        );
        self.update_status(|status| status.calls_handled += 1);
    }

    async fn handle_ack(self: &Arc<Self>, ack: SipMessage) {
        let call_id = ack.call_id().unwrap_or_default();
        let (speech, rtp) = {
            let mut dialogs = self.dialogs.lock().await;
            let Some(dialog) = dialogs.get_mut(call_id) else {
                debug!(call_id, "ack without dialog");
                return;
            };
            match dialog.pending_speech.take() {
                Some(speech) => (speech, dialog.rtp.clone()),
                None => return,
            }
        };
        let handler = self.invitation_handler.clone();
        let call_id = call_id.to_string();
        tokio::spawn(async move {
            speak(handler, rtp, speech, call_id).await;
        });
    }

    async fn handle_bye(self: &Arc<Self>, conn: &Connection, bye: SipMessage) {
        let call_id = bye.call_id().unwrap_or_default().to_string();
        match self.dialogs.lock().await.remove(&call_id) {
            Some(dialog) => {
                reply(conn, &bye, 200, None);
                dialog.rtp.close();
                info!(call_id, "call ended by remote");
            }
            None => {
                reply(conn, &bye, 481, None);
                return;
            }
        }
        self.invitation_handler.on_hangup(&call_id).await;
    }

    async fn handle_cancel(self: &Arc<Self>, conn: &Connection, cancel: SipMessage) {
        let call_id = cancel.call_id().unwrap_or_default().to_string();

        let pending = self.lock_pending().remove(&call_id);
        if let Some(pending) = pending {
            pending.token.cancel();
            reply(conn, &cancel, 200, Some(&pending.local_tag));
            reply(conn, &pending.invite, 487, Some(&pending.local_tag));
            info!(call_id, "pending invite cancelled");
            return;
        }

        match self.dialogs.lock().await.remove(&call_id) {
            Some(dialog) => {
                reply(conn, &cancel, 200, Some(&dialog.local_tag));
                dialog.rtp.close();
                info!(call_id, "call cancelled");
            }
            None => {
                reply(conn, &cancel, 481, None);
                return;
            }
        }
        self.invitation_handler.on_hangup(&call_id).await;
    }

    pub async fn dialogs(&self) -> Vec<DialogSummary> {
        self.dialogs
            .lock()
            .await
            .values()
            .map(DialogSummary::from)
            .collect()
    }

    /// Close every call's media and forget all dialogs.
    pub(super) async fn close_dialogs(&self) {
        for (_, pending) in self.lock_pending().drain() {
            pending.token.cancel();
        }
        let dialogs: Vec<SipDialog> = self.dialogs.lock().await.drain().map(|(_, d)| d).collect();
        for dialog in dialogs {
            dialog.rtp.close();
            debug!(call_id = dialog.call_id, "dialog closed on shutdown");
        }
    }
}

/// Synthesize and stream one utterance, falling back to the handler's
/// apology line when synthesis fails.
async fn speak(
    handler: Arc<dyn InvitationHandler>,
    rtp: RtpSessionRef,
    speech: PendingSpeech,
    call_id: String,
) {
    let audio = match handler.synthesize(&speech).await {
        Ok(audio) => Some(audio),
        Err(e) => {
            warn!(call_id, "speech synthesis failed: {}", e);
            match handler.apology(&speech) {
                Some(apology) => match handler.synthesize(&apology).await {
                    Ok(audio) => Some(audio),
                    Err(e) => {
                        warn!(call_id, "apology synthesis failed: {}", e);
                        None
                    }
                },
                None => None,
            }
        }
    };
    let Some(audio) = audio else {
        return;
    };
    let ulaw = match prepare_ulaw(&audio) {
        Ok(ulaw) => ulaw,
        Err(e) => {
            warn!(call_id, "unsupported audio for rtp: {}", e);
            return;
        }
    };
    match rtp.stream_audio(&ulaw).await {
        Ok(sent) => debug!(call_id, sent, "utterance streamed"),
        Err(e) => warn!(call_id, "rtp stream aborted: {}", e),
    }
}
