use super::invitation::{InboundCall, InvitationHandler, PendingSpeech};
use super::routes::PhoneRouteTable;
use super::transport::TransportKind;
use super::*;
use crate::media::codecs::samples_to_bytes;
use crate::sip::builder::response_for;
use crate::sip::digest::{compute_response, DigestChallenge};
use crate::sip::framing::MessageBuffer;
use crate::sip::message::header_param;
use crate::sip::{Method, SipMessage};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;

#[derive(Default)]
struct RecordingHandler {
    calls: Mutex<Vec<InboundCall>>,
    synthesized: Mutex<Vec<String>>,
    invite_delay: Option<Duration>,
    fail_greeting_audio: bool,
}

#[async_trait]
impl InvitationHandler for RecordingHandler {
    async fn on_invite(&self, call: &InboundCall) -> Result<PendingSpeech> {
        self.calls.lock().unwrap().push(call.clone());
        if let Some(delay) = self.invite_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(PendingSpeech {
            text: "hello".to_string(),
            voice: "alloy".to_string(),
        })
    }

    async fn synthesize(&self, speech: &PendingSpeech) -> Result<Vec<u8>> {
        self.synthesized.lock().unwrap().push(speech.text.clone());
        if self.fail_greeting_audio && speech.text == "hello" {
            return Err(anyhow!("tts unavailable"));
        }
        Ok(samples_to_bytes(&[0i16; 480]))
    }

    fn apology(&self, speech: &PendingSpeech) -> Option<PendingSpeech> {
        Some(PendingSpeech {
            text: "sorry".to_string(),
            voice: speech.voice.clone(),
        })
    }
}

async fn recv_udp(socket: &UdpSocket) -> (SipMessage, SocketAddr) {
    let mut buf = vec![0u8; 65535];
    let (n, from) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for sip message")
        .unwrap();
    (SipMessage::parse(&buf[..n]).unwrap(), from)
}

async fn send_udp(socket: &UdpSocket, message: &SipMessage, to: SocketAddr) {
    socket.send_to(&message.to_bytes(), to).await.unwrap();
}

fn challenge_401(request: &SipMessage) -> SipMessage {
    let mut response = response_for(request, 401, Some("reg"));
    response.add_header(
        "WWW-Authenticate",
        "Digest realm=\"sip.example.com\", nonce=\"abc123\", algorithm=MD5",
    );
    response
}

fn quoted_param(header: &str, name: &str) -> Option<String> {
    let marker = format!("{}=\"", name);
    let start = header.find(&marker)? + marker.len();
    let end = header[start..].find('"')? + start;
    Some(header[start..end].to_string())
}

/// 401 for unauthenticated REGISTERs, 200 for the rest. Forwards every
/// REGISTER it sees.
fn spawn_udp_registrar(socket: Arc<UdpSocket>) -> tokio::sync::mpsc::UnboundedReceiver<(SipMessage, SocketAddr)> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let Ok(request) = SipMessage::parse(&buf[..n]) else {
                continue;
            };
            if request.method() != Some(&Method::Register) {
                continue;
            }
            let response = if request.header("authorization").is_none() {
                challenge_401(&request)
            } else {
                response_for(&request, 200, Some("reg"))
            };
            socket.send_to(&response.to_bytes(), from).await.ok();
            if tx.send((request, from)).is_err() {
                break;
            }
        }
    });
    rx
}

fn udp_config(port: u16, password: &str) -> RegistrationConfig {
    let mut config = RegistrationConfig::new("127.0.0.1", "alice", password);
    config.port = port;
    config
}

fn build_invite(registrar: SocketAddr, call_id: &str, rtp_port: u16) -> SipMessage {
    let mut invite = SipMessage::request(Method::Invite, "sip:442012345678@127.0.0.1");
    invite.add_header("Via", format!("SIP/2.0/UDP {};branch=z9hG4bK{}", registrar, call_id));
    invite.add_header("From", "<sip:441234@x>;tag=caller1");
    invite.add_header("To", "<sip:442012345678@x>");
    invite.add_header("Call-ID", call_id);
    invite.add_header("CSeq", "1 INVITE");
    invite.add_header("Contact", format!("<sip:441234@{}>", registrar));
    invite.add_header("Content-Type", "application/sdp");
    invite.body = format!(
        "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\nm=audio {} RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n",
        rtp_port
    )
    .into_bytes();
    invite
}

fn in_dialog_request(method: Method, call_id: &str, to: &str, cseq: u32) -> SipMessage {
    let mut request = SipMessage::request(method.clone(), "sip:442012345678@127.0.0.1");
    request.add_header("Via", format!("SIP/2.0/UDP 127.0.0.1;branch=z9hG4bK{}{}", method, cseq));
    request.add_header("From", "<sip:441234@x>;tag=caller1");
    request.add_header("To", to);
    request.add_header("Call-ID", call_id);
    request.add_header("CSeq", format!("{} {}", cseq, method));
    request
}

fn sdp_audio_port(body: &str) -> Option<u16> {
    body.lines()
        .find_map(|l| l.strip_prefix("m=audio "))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|p| p.parse().ok())
}

/// Register against a registrar that accepts without a challenge and return
/// the UA's signaling address as the registrar sees it.
async fn register_plain(ua: &UserAgentRef, registrar: &Arc<UdpSocket>) -> SocketAddr {
    let port = registrar.local_addr().unwrap().port();
    let socket = registrar.clone();
    let accept = tokio::spawn(async move {
        let (request, from) = recv_udp(&socket).await;
        assert_eq!(request.method(), Some(&Method::Register));
        send_udp(&socket, &response_for(&request, 200, Some("reg")), from).await;
        from
    });
    ua.register(udp_config(port, "")).await.unwrap();
    accept.await.unwrap()
}

#[tokio::test]
async fn test_register_with_digest_challenge() {
    let registrar = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let port = registrar.local_addr().unwrap().port();
    let mut seen = spawn_udp_registrar(registrar.clone());

    let ua = UserAgentBuilder::new().build();
    ua.register(udp_config(port, "secret")).await.unwrap();

    let (first, _) = seen.recv().await.unwrap();
    assert!(first.header("authorization").is_none());
    assert_eq!(first.header("expires"), Some("300"));
    assert!(first.header("via").unwrap().contains("branch=z9hG4bK"));

    let (second, _) = seen.recv().await.unwrap();
    assert_eq!(second.call_id(), first.call_id());
    assert_eq!(second.cseq().unwrap().0, first.cseq().unwrap().0 + 1);
    let authorization = second.header("authorization").unwrap();
    let challenge = DigestChallenge {
        realm: "sip.example.com".to_string(),
        nonce: "abc123".to_string(),
        ..Default::default()
    };
    let expected = compute_response(
        &challenge,
        "alice",
        "secret",
        "REGISTER",
        &format!("sip:127.0.0.1:{}", port),
        "",
    );
    assert_eq!(quoted_param(authorization, "response"), Some(expected));
    assert_eq!(quoted_param(authorization, "username").as_deref(), Some("alice"));

    let status = ua.status();
    assert!(status.registered);
    assert!(!status.registering);
    assert_eq!(status.state, RegistrationState::Registered);
    assert_eq!(status.last_error, None);
    assert!(status.last_registered.is_some());
    assert_eq!(status.sip_uri.as_deref(), Some("sip:alice@127.0.0.1"));

    ua.unregister().await;
    let (unregister, _) = seen.recv().await.unwrap();
    assert_eq!(unregister.header("expires"), Some("0"));
    assert_eq!(ua.status().state, RegistrationState::Unregistered);
    ua.token.cancel();
}

#[tokio::test]
async fn test_register_terminal_failures() {
    for (code, expected) in [
        (403, RegistrationError::Forbidden),
        (423, RegistrationError::IntervalTooBrief { min_expires: Some(600) }),
        (
            486,
            RegistrationError::Rejected {
                code: 486,
                reason: "Busy Here".to_string(),
            },
        ),
    ] {
        let registrar = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let port = registrar.local_addr().unwrap().port();
        let socket = registrar.clone();
        tokio::spawn(async move {
            let (request, from) = recv_udp(&socket).await;
            let mut response = response_for(&request, code, Some("reg"));
            response.add_header("Min-Expires", "600");
            send_udp(&socket, &response, from).await;
        });

        let ua = UserAgentBuilder::new().build();
        let result = ua.register(udp_config(port, "secret")).await;
        assert_eq!(result, Err(expected));
        let status = ua.status();
        assert_eq!(status.state, RegistrationState::Failed);
        assert!(!status.registered);
        assert!(status.last_error.is_some());
        ua.token.cancel();
    }
}

#[tokio::test]
async fn test_challenge_without_password() {
    let registrar = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let port = registrar.local_addr().unwrap().port();
    let _seen = spawn_udp_registrar(registrar.clone());

    let ua = UserAgentBuilder::new().build();
    let result = ua.register(udp_config(port, "")).await;
    assert_eq!(result, Err(RegistrationError::MissingCredentials));
    ua.token.cancel();
}

#[tokio::test]
async fn test_register_times_out() {
    let registrar = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = registrar.local_addr().unwrap().port();

    let ua = UserAgentBuilder::new()
        .with_transaction_timeout(Duration::from_millis(200))
        .build();
    let result = ua.register(udp_config(port, "secret")).await;
    assert_eq!(result, Err(RegistrationError::Timeout));
    assert_eq!(ua.status().state, RegistrationState::Failed);
    ua.token.cancel();
}

#[tokio::test]
async fn test_inbound_call_flow() {
    let registrar = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let registrar_addr = registrar.local_addr().unwrap();
    let rtp_peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let rtp_port = rtp_peer.local_addr().unwrap().port();

    let handler = Arc::new(RecordingHandler::default());
    let routes = Arc::new(PhoneRouteTable::from_routes([("442012345678", "deskA")]));
    let ua = UserAgentBuilder::new()
        .with_invitation_handler(handler.clone())
        .with_routes(routes)
        .build();
    let ua_addr = register_plain(&ua, &registrar).await;

    let invite = build_invite(registrar_addr, "call-e2e-1", rtp_port);
    send_udp(&registrar, &invite, ua_addr).await;

    let (trying, _) = recv_udp(&registrar).await;
    assert_eq!(trying.status(), Some(100));
    let (ringing, _) = recv_udp(&registrar).await;
    assert_eq!(ringing.status(), Some(180));
    let to_tag = header_param(ringing.header("to").unwrap(), "tag").unwrap();
    let (ok, _) = recv_udp(&registrar).await;
    assert_eq!(ok.status(), Some(200));
    assert_eq!(ok.call_id(), Some("call-e2e-1"));
    assert_eq!(ok.header("content-type"), Some("application/sdp"));
    assert_eq!(header_param(ok.header("to").unwrap(), "tag").as_deref(), Some(to_tag.as_str()));

    let calls = handler.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].caller, "441234");
    assert_eq!(calls[0].called, "442012345678");
    assert_eq!(calls[0].routed_destination.as_deref(), Some("deskA"));

    let dialogs = ua.dialogs().await;
    assert_eq!(dialogs.len(), 1);
    let body = ok.body_str();
    assert_eq!(sdp_audio_port(&body), Some(dialogs[0].local_rtp_port));
    assert!(body.contains("RTP/AVP 0 8 101"));
    assert_eq!(ua.status().calls_handled, 1);

    let to = ok.header("to").unwrap().to_string();
    send_udp(&registrar, &in_dialog_request(Method::Ack, "call-e2e-1", &to, 1), ua_addr).await;

    let mut packet = [0u8; 2048];
    let (n, _) = timeout(Duration::from_secs(2), rtp_peer.recv_from(&mut packet))
        .await
        .expect("no rtp after ack")
        .unwrap();
    assert_eq!(n, 12 + 160);
    assert_eq!(packet[0], 0x80);
    assert_eq!(packet[1], 0x80); // marker + PCMU
    assert_eq!(handler.synthesized.lock().unwrap().clone(), vec!["hello"]);

    send_udp(&registrar, &in_dialog_request(Method::Bye, "call-e2e-1", &to, 2), ua_addr).await;
    let (bye_ok, _) = recv_udp(&registrar).await;
    assert_eq!(bye_ok.status(), Some(200));
    assert_eq!(bye_ok.cseq(), Some((2, Method::Bye)));
    assert_eq!(ua.dialog_count().await, 0);
    ua.token.cancel();
}

#[tokio::test]
async fn test_apology_when_synthesis_fails() {
    let registrar = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let registrar_addr = registrar.local_addr().unwrap();
    let rtp_peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let rtp_port = rtp_peer.local_addr().unwrap().port();

    let handler = Arc::new(RecordingHandler {
        fail_greeting_audio: true,
        ..Default::default()
    });
    let ua = UserAgentBuilder::new()
        .with_invitation_handler(handler.clone())
        .build();
    let ua_addr = register_plain(&ua, &registrar).await;

    send_udp(&registrar, &build_invite(registrar_addr, "call-apology", rtp_port), ua_addr).await;
    let mut ok = None;
    for _ in 0..3 {
        let (response, _) = recv_udp(&registrar).await;
        if response.status() == Some(200) {
            ok = Some(response);
        }
    }
    let ok = ok.expect("call was not answered");
    let to = ok.header("to").unwrap().to_string();
    send_udp(&registrar, &in_dialog_request(Method::Ack, "call-apology", &to, 1), ua_addr).await;

    let mut packet = [0u8; 2048];
    timeout(Duration::from_secs(2), rtp_peer.recv_from(&mut packet))
        .await
        .expect("no rtp after ack")
        .unwrap();
    assert_eq!(handler.synthesized.lock().unwrap().clone(), vec!["hello", "sorry"]);
    ua.token.cancel();
}

#[tokio::test]
async fn test_cancel_pending_invite() {
    let registrar = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let registrar_addr = registrar.local_addr().unwrap();
    let handler = Arc::new(RecordingHandler {
        invite_delay: Some(Duration::from_secs(30)),
        ..Default::default()
    });
    let ua = UserAgentBuilder::new()
        .with_invitation_handler(handler.clone())
        .build();
    let ua_addr = register_plain(&ua, &registrar).await;

    send_udp(&registrar, &build_invite(registrar_addr, "call-cancel", 40000), ua_addr).await;
    assert_eq!(recv_udp(&registrar).await.0.status(), Some(100));
    assert_eq!(recv_udp(&registrar).await.0.status(), Some(180));

    let mut cancel = in_dialog_request(Method::Cancel, "call-cancel", "<sip:442012345678@x>", 1);
    cancel.set_header("Via", format!("SIP/2.0/UDP {};branch=z9hG4bKcall-cancel", registrar_addr));
    send_udp(&registrar, &cancel, ua_addr).await;

    let (cancel_ok, _) = recv_udp(&registrar).await;
    assert_eq!(cancel_ok.status(), Some(200));
    assert_eq!(cancel_ok.cseq(), Some((1, Method::Cancel)));
    let (terminated, _) = recv_udp(&registrar).await;
    assert_eq!(terminated.status(), Some(487));
    assert_eq!(terminated.cseq(), Some((1, Method::Invite)));
    assert_eq!(ua.dialog_count().await, 0);
    ua.token.cancel();
}

#[tokio::test]
async fn test_unknown_dialog_and_options() {
    let registrar = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let ua = UserAgentBuilder::new().build();
    let ua_addr = register_plain(&ua, &registrar).await;

    send_udp(&registrar, &in_dialog_request(Method::Bye, "nope", "<sip:a@x>;tag=1", 2), ua_addr).await;
    assert_eq!(recv_udp(&registrar).await.0.status(), Some(481));

    send_udp(&registrar, &in_dialog_request(Method::Cancel, "nope", "<sip:a@x>", 1), ua_addr).await;
    assert_eq!(recv_udp(&registrar).await.0.status(), Some(481));

    send_udp(&registrar, &in_dialog_request(Method::Options, "ping", "<sip:a@x>", 1), ua_addr).await;
    let (ok, _) = recv_udp(&registrar).await;
    assert_eq!(ok.status(), Some(200));
    assert_eq!(ok.cseq(), Some((1, Method::Options)));
    ua.token.cancel();
}

async fn read_tcp_message(stream: &mut TcpStream, buffer: &mut MessageBuffer) -> SipMessage {
    loop {
        if let Some(message) = buffer.next_message() {
            return message.unwrap();
        }
        let mut buf = [0u8; 4096];
        let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("timed out reading tcp")
            .unwrap();
        assert!(n > 0, "connection closed");
        buffer.extend(&buf[..n]);
    }
}

#[tokio::test]
async fn test_tcp_reconnect_keeps_active_call() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let registrar_addr = listener.local_addr().unwrap();
    let (event_tx, mut events) = tokio::sync::mpsc::unbounded_channel::<(&'static str, SipMessage)>();
    let (bye_tx, bye_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        // first connection: register, take a call, then drop
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buffer = MessageBuffer::new();
        let register = read_tcp_message(&mut stream, &mut buffer).await;
        stream
            .write_all(&response_for(&register, 200, Some("reg")).to_bytes())
            .await
            .unwrap();
        event_tx.send(("registered", register)).ok();

        let invite = build_invite(registrar_addr, "call-tcp", 40002);
        stream.write_all(&invite.to_bytes()).await.unwrap();
        let ok = loop {
            let response = read_tcp_message(&mut stream, &mut buffer).await;
            if response.status() == Some(200) {
                break response;
            }
        };
        event_tx.send(("answered", ok.clone())).ok();
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(stream);

        // second connection: register again, then hang up the call
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buffer = MessageBuffer::new();
        let register = read_tcp_message(&mut stream, &mut buffer).await;
        stream
            .write_all(&response_for(&register, 200, Some("reg")).to_bytes())
            .await
            .unwrap();
        event_tx.send(("registered", register)).ok();

        bye_rx.await.ok();
        let to = ok.header("to").unwrap().to_string();
        let bye = in_dialog_request(Method::Bye, "call-tcp", &to, 2);
        stream.write_all(&bye.to_bytes()).await.unwrap();
        let bye_ok = read_tcp_message(&mut stream, &mut buffer).await;
        event_tx.send(("bye", bye_ok)).ok();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let handler = Arc::new(RecordingHandler::default());
    let ua = UserAgentBuilder::new()
        .with_invitation_handler(handler.clone())
        .build();
    let mut config = udp_config(registrar_addr.port(), "");
    config.transport = TransportKind::Tcp;
    config.reconnect_delay_secs = 1;
    ua.register(config).await.unwrap();

    let (event, first) = events.recv().await.unwrap();
    assert_eq!(event, "registered");
    let (event, ok) = timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
    assert_eq!(event, "answered");
    assert_eq!(ok.call_id(), Some("call-tcp"));
    assert_eq!(ua.dialog_count().await, 1);

    let (event, second) = timeout(Duration::from_secs(10), events.recv()).await.unwrap().unwrap();
    assert_eq!(event, "registered");
    assert_eq!(second.call_id(), first.call_id());
    assert!(second.cseq().unwrap().0 > first.cseq().unwrap().0);
    let mut registered = false;
    for _ in 0..50 {
        if ua.status().registered {
            registered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(registered);
    assert_eq!(ua.dialog_count().await, 1);

    bye_tx.send(()).unwrap();
    let (event, bye_ok) = timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
    assert_eq!(event, "bye");
    assert_eq!(bye_ok.status(), Some(200));
    assert_eq!(bye_ok.cseq(), Some((2, Method::Bye)));
    assert_eq!(ua.dialog_count().await, 0);
    ua.token.cancel();
}

/// Answers the first REGISTER with 200 and later ones with `refresh_code`.
/// OPTIONS get no answer. Forwards everything it receives.
fn spawn_refresh_registrar(
    socket: Arc<UdpSocket>,
    refresh_code: Option<u16>,
) -> tokio::sync::mpsc::UnboundedReceiver<(SipMessage, SocketAddr)> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        let mut registers = 0;
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let Ok(request) = SipMessage::parse(&buf[..n]) else {
                continue;
            };
            if request.method() == Some(&Method::Register) {
                registers += 1;
                let code = if registers == 1 { Some(200) } else { refresh_code };
                if let Some(code) = code {
                    let response = response_for(&request, code, Some("reg"));
                    socket.send_to(&response.to_bytes(), from).await.ok();
                }
            }
            if tx.send((request, from)).is_err() {
                break;
            }
        }
    });
    rx
}

#[tokio::test]
async fn test_rejected_refresh_fails_registration() {
    let registrar = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let port = registrar.local_addr().unwrap().port();
    let mut seen = spawn_refresh_registrar(registrar.clone(), Some(403));

    let ua = UserAgentBuilder::new().build();
    let mut config = udp_config(port, "");
    config.register_interval_secs = 1;
    ua.register(config).await.unwrap();
    assert!(ua.status().registered);

    let (first, _) = seen.recv().await.unwrap();
    let (refresh, _) = timeout(Duration::from_secs(3), seen.recv()).await.unwrap().unwrap();
    assert_eq!(refresh.method(), Some(&Method::Register));
    assert_eq!(refresh.call_id(), first.call_id());
    assert_eq!(refresh.header("expires"), Some("300"));

    let mut failed = false;
    for _ in 0..50 {
        if ua.status().state == RegistrationState::Failed {
            failed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(failed);
    let status = ua.status();
    assert!(!status.registered);
    assert!(status.last_error.unwrap().contains("forbidden"));
    assert!(ua.current_connection().is_none());
    ua.token.cancel();
}

#[tokio::test]
async fn test_unanswered_keepalives_trigger_reconnect() {
    let registrar = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let port = registrar.local_addr().unwrap().port();
    let mut seen = spawn_refresh_registrar(registrar.clone(), Some(200));

    let ua = UserAgentBuilder::new()
        .with_transaction_timeout(Duration::from_millis(200))
        .build();
    let mut config = udp_config(port, "");
    config.keepalive_interval_secs = 1;
    config.reconnect_delay_secs = 1;
    ua.register(config).await.unwrap();

    let watcher = ua.clone();
    let saw_reconnecting = tokio::spawn(async move {
        for _ in 0..500 {
            if watcher.status().state == RegistrationState::Reconnecting {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    });

    let mut options = 0;
    let mut registers = 0;
    while registers < 2 {
        let (message, _) = timeout(Duration::from_secs(10), seen.recv())
            .await
            .expect("no reconnect after missed keepalives")
            .unwrap();
        match message.method() {
            Some(Method::Options) => options += 1,
            Some(Method::Register) => registers += 1,
            _ => {}
        }
    }
    assert!(options >= 3, "options {}", options);
    assert!(saw_reconnecting.await.unwrap());

    let mut registered = false;
    for _ in 0..50 {
        if ua.status().registered {
            registered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(registered);
    ua.token.cancel();
}

#[tokio::test]
async fn test_invite_handler_failure_answers_500() {
    let registrar = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let registrar_addr = registrar.local_addr().unwrap();
    let ua = UserAgentBuilder::new().build();
    let ua_addr = register_plain(&ua, &registrar).await;

    send_udp(&registrar, &build_invite(registrar_addr, "call-broken", 40004), ua_addr).await;
    assert_eq!(recv_udp(&registrar).await.0.status(), Some(100));
    assert_eq!(recv_udp(&registrar).await.0.status(), Some(180));
    let (failure, _) = recv_udp(&registrar).await;
    assert_eq!(failure.status(), Some(500));
    assert_eq!(failure.cseq(), Some((1, Method::Invite)));
    assert_eq!(ua.dialog_count().await, 0);
    assert_eq!(ua.status().calls_handled, 0);
    ua.token.cancel();
}

#[tokio::test]
async fn test_invite_without_offer_answers_488() {
    let registrar = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let registrar_addr = registrar.local_addr().unwrap();
    let handler = Arc::new(RecordingHandler::default());
    let ua = UserAgentBuilder::new()
        .with_invitation_handler(handler.clone())
        .build();
    let ua_addr = register_plain(&ua, &registrar).await;

    let mut invite = build_invite(registrar_addr, "call-no-sdp", 40006);
    invite.body.clear();
    send_udp(&registrar, &invite, ua_addr).await;
    assert_eq!(recv_udp(&registrar).await.0.status(), Some(100));
    assert_eq!(recv_udp(&registrar).await.0.status(), Some(488));
    assert!(handler.calls.lock().unwrap().is_empty());
    assert_eq!(ua.dialog_count().await, 0);
    ua.token.cancel();
}
