use super::transport::{Connection, TransportKind};
use super::UserAgent;
use crate::net_tool::{advertised_ip, resolve_server};
use crate::sip::builder::{new_branch, new_call_id, new_tag, RequestBuilder};
use crate::sip::digest::{authorize, DigestChallenge};
use crate::sip::message::header_param;
use crate::sip::{Method, SipMessage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::oneshot;
use tokio::time::{interval_at, sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

fn default_sip_port() -> u16 {
    5060
}
fn default_expires() -> u32 {
    300
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_register_interval() -> u64 {
    60
}
fn default_keepalive_interval() -> u64 {
    20
}
fn default_connect_timeout() -> u64 {
    20
}

const MAX_MISSED_KEEPALIVES: u32 = 3;

/// Everything needed to register with one upstream registrar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationConfig {
    pub server: String,
    #[serde(default = "default_sip_port")]
    pub port: u16,
    #[serde(default)]
    pub transport: TransportKind,
    pub username: String,
    #[serde(default)]
    pub auth_username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: String,
    #[serde(default = "default_expires")]
    pub expires: u32,
    /// Statically configured number that also counts as "called" for routing.
    #[serde(default)]
    pub inbound_number: Option<String>,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_register_interval")]
    pub register_interval_secs: u64,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl RegistrationConfig {
    pub fn new(server: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            port: default_sip_port(),
            transport: TransportKind::default(),
            username: username.into(),
            auth_username: None,
            password: password.into(),
            expires: default_expires(),
            inbound_number: None,
            reconnect_delay_secs: default_reconnect_delay(),
            register_interval_secs: default_register_interval(),
            keepalive_interval_secs: default_keepalive_interval(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }

    pub fn registrar_uri(&self) -> String {
        if self.port == default_sip_port() {
            format!("sip:{}", self.server)
        } else {
            format!("sip:{}:{}", self.server, self.port)
        }
    }

    pub fn aor(&self) -> String {
        format!("sip:{}@{}", self.username, self.server)
    }

    pub fn auth_username(&self) -> &str {
        self.auth_username
            .as_deref()
            .filter(|u| !u.is_empty())
            .unwrap_or(&self.username)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationState {
    #[default]
    Unregistered,
    Registering,
    Challenged,
    Registered,
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistrationStatus {
    pub state: RegistrationState,
    pub registered: bool,
    pub registering: bool,
    pub last_error: Option<String>,
    pub last_registered: Option<DateTime<Utc>>,
    pub calls_handled: u64,
    pub local_addr: Option<String>,
    pub sip_uri: Option<String>,
}

impl RegistrationStatus {
    pub(super) fn set_state(&mut self, state: RegistrationState) {
        self.state = state;
        self.registered = state == RegistrationState::Registered;
        self.registering = matches!(
            state,
            RegistrationState::Registering
                | RegistrationState::Challenged
                | RegistrationState::Reconnecting
        );
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationError {
    Timeout,
    Transport(String),
    Forbidden,
    IntervalTooBrief { min_expires: Option<u32> },
    Rejected { code: u16, reason: String },
    MissingCredentials,
    Cancelled,
}

impl RegistrationError {
    /// Worth another attempt after the reconnect delay.
    pub fn is_transient(&self) -> bool {
        matches!(self, RegistrationError::Timeout | RegistrationError::Transport(_))
    }

    fn from_response(response: &SipMessage) -> Self {
        let code = response.status().unwrap_or_default();
        match code {
            403 => RegistrationError::Forbidden,
            423 => RegistrationError::IntervalTooBrief {
                min_expires: response
                    .header("min-expires")
                    .and_then(|v| v.trim().parse().ok()),
            },
            _ => RegistrationError::Rejected {
                code,
                reason: response.reason().unwrap_or_default().to_string(),
            },
        }
    }
}

impl std::fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistrationError::Timeout => write!(f, "Registration timed out"),
            RegistrationError::Transport(e) => write!(f, "Transport error: {}", e),
            RegistrationError::Forbidden => write!(f, "Registration forbidden (bad credentials)"),
            RegistrationError::IntervalTooBrief { min_expires } => match min_expires {
                Some(min) => write!(f, "Interval too brief, minimum {}s", min),
                None => write!(f, "Interval too brief"),
            },
            RegistrationError::Rejected { code, reason } => {
                write!(f, "Registration rejected: {} {}", code, reason)
            }
            RegistrationError::MissingCredentials => {
                write!(f, "Challenged without credentials configured")
            }
            RegistrationError::Cancelled => write!(f, "Registration cancelled"),
        }
    }
}

impl std::error::Error for RegistrationError {}

/// One registration cycle against one config. Call-ID and From tag stay the
/// same across refreshes; CSeq increases per request.
pub(super) struct RegisterSession {
    pub config: RegistrationConfig,
    call_id: String,
    from_tag: String,
    cseq: AtomicU32,
    pub token: CancellationToken,
}

impl RegisterSession {
    fn new(config: RegistrationConfig, token: CancellationToken) -> Self {
        Self {
            call_id: new_call_id(&config.server),
            from_tag: new_tag(),
            cseq: AtomicU32::new(0),
            config,
            token,
        }
    }

    fn next_cseq(&self) -> u32 {
        self.cseq.fetch_add(1, Ordering::SeqCst) + 1
    }
}

pub(super) fn transaction_key(message: &SipMessage) -> Option<String> {
    let (seq, method) = message.cseq()?;
    Some(format!("{} {} {}", message.call_id()?, seq, method))
}

/// Via/Contact address for a connection.
pub(super) fn advertised_addr(conn: &Connection) -> SocketAddr {
    let local = conn.local_addr();
    SocketAddr::new(advertised_ip(local.ip()), local.port())
}

fn granted_expires(response: &SipMessage, requested: u32) -> u32 {
    response
        .header("contact")
        .and_then(|c| header_param(c, "expires"))
        .and_then(|v| v.parse().ok())
        .or_else(|| response.header("expires").and_then(|v| v.trim().parse().ok()))
        .unwrap_or(requested)
}

impl UserAgent {
    /// Register with `config`, replacing any previous registration.
    ///
    /// Resolves once the first REGISTER cycle finishes. On success the
    /// keepalive and refresh timers keep running, and a dropped connection
    /// is re-established in the background.
    pub async fn register(self: &Arc<Self>, config: RegistrationConfig) -> Result<(), RegistrationError> {
        self.unregister().await;

        let session = Arc::new(RegisterSession::new(config.clone(), self.token.child_token()));
        *self.session.lock().await = Some(session.clone());
        self.set_config(Some(config));
        self.update_status(|status| {
            status.set_state(RegistrationState::Registering);
            status.last_error = None;
        });

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let ua = self.clone();
        tokio::spawn(async move { ua.run_session(session, outcome_tx).await });
        outcome_rx.await.unwrap_or(Err(RegistrationError::Cancelled))
    }

    /// Send `Expires: 0`, stop timers and close the connection.
    pub async fn unregister(&self) {
        let Some(session) = self.session.lock().await.take() else {
            return;
        };
        let was_registered = self.status().registered;
        let conn = self.current_connection();
        if let Some(conn) = conn.filter(|c| was_registered && !c.is_closed()) {
            match timeout(Duration::from_secs(5), self.do_register(&session, &conn, 0)).await {
                Ok(Ok(_)) => info!(aor = session.config.aor(), "unregistered"),
                Ok(Err(e)) => warn!(aor = session.config.aor(), "unregister failed: {}", e),
                Err(_) => warn!(aor = session.config.aor(), "unregister timed out"),
            }
        }
        session.token.cancel();
        self.set_connection(None);
        self.update_status(|status| {
            status.set_state(RegistrationState::Unregistered);
            status.local_addr = None;
        });
    }

    async fn run_session(
        self: Arc<Self>,
        session: Arc<RegisterSession>,
        outcome: oneshot::Sender<Result<(), RegistrationError>>,
    ) {
        let mut outcome = Some(outcome);
        let reconnect_delay = Duration::from_secs(session.config.reconnect_delay_secs);
        loop {
            if session.token.is_cancelled() {
                break;
            }
            match self.register_once(&session).await {
                Ok(conn) => {
                    if let Some(tx) = outcome.take() {
                        tx.send(Ok(())).ok();
                    }
                    let timers = session.token.child_token();
                    self.spawn_timers(session.clone(), conn.clone(), timers.clone());
                    select! {
                        _ = session.token.cancelled() => {
                            timers.cancel();
                            break;
                        }
                        _ = conn.closed() => {
                            timers.cancel();
                            if session.token.is_cancelled() {
                                break;
                            }
                            warn!(aor = session.config.aor(), "sip connection lost, reconnecting");
                            self.update_status(|status| {
                                status.set_state(RegistrationState::Reconnecting);
                                status
                                    .last_error
                                    .get_or_insert_with(|| "connection closed".to_string());
                            });
                        }
                    }
                }
                Err(e) if session.token.is_cancelled() => {
                    debug!("registration aborted: {}", e);
                    break;
                }
                Err(e) => {
                    warn!(aor = session.config.aor(), "registration failed: {}", e);
                    let first_attempt = outcome.is_some();
                    let terminal = first_attempt || !e.is_transient();
                    self.update_status(|status| {
                        status.last_error = Some(e.to_string());
                        if terminal {
                            status.set_state(RegistrationState::Failed);
                        } else {
                            status.set_state(RegistrationState::Reconnecting);
                        }
                    });
                    if let Some(tx) = outcome.take() {
                        tx.send(Err(e)).ok();
                    }
                    if terminal {
                        self.set_connection(None);
                        break;
                    }
                }
            }
            select! {
                _ = session.token.cancelled() => break,
                _ = sleep(reconnect_delay) => {}
            }
        }
        if let Some(tx) = outcome.take() {
            tx.send(Err(RegistrationError::Cancelled)).ok();
        }
        debug!(aor = session.config.aor(), "registration session ended");
    }

    /// Connect and complete one REGISTER exchange.
    async fn register_once(self: &Arc<Self>, session: &RegisterSession) -> Result<Connection, RegistrationError> {
        let config = &session.config;
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
        let remote = resolve_server(&config.server, config.port)
            .await
            .map_err(|e| RegistrationError::Transport(e.to_string()))?;
        let (conn, inbound) = timeout(
            connect_timeout,
            Connection::connect(config.transport, remote, &session.token),
        )
        .await
        .map_err(|_| RegistrationError::Timeout)?
        .map_err(|e| RegistrationError::Transport(e.to_string()))?;

        self.set_connection(Some(conn.clone()));
        tokio::spawn(self.clone().dispatch_loop(conn.clone(), inbound));

        let local = advertised_addr(&conn);
        self.update_status(|status| {
            status.local_addr = Some(local.to_string());
            status.sip_uri = Some(config.aor());
        });

        match self.do_register(session, &conn, config.expires).await {
            Ok(expires) => {
                info!(
                    aor = config.aor(),
                    expires,
                    local = %local,
                    "registration succeeded"
                );
                self.update_status(|status| {
                    status.set_state(RegistrationState::Registered);
                    status.last_error = None;
                    status.last_registered = Some(Utc::now());
                });
                Ok(conn)
            }
            Err(e) => {
                conn.close();
                Err(e)
            }
        }
    }

    /// One REGISTER, answering at most one Digest challenge.
    /// Returns the expiry granted by the registrar.
    pub(super) async fn do_register(
        &self,
        session: &RegisterSession,
        conn: &Connection,
        expires: u32,
    ) -> Result<u32, RegistrationError> {
        let request = self.build_register(session, conn, expires, None);
        let response = self.send_request(conn, &request).await?;
        let code = response.status().unwrap_or_default();
        if (200..300).contains(&code) {
            return Ok(granted_expires(&response, expires));
        }
        if code != 401 && code != 407 {
            return Err(RegistrationError::from_response(&response));
        }

        let (challenge_header, authorization_header) = if code == 401 {
            ("www-authenticate", "Authorization")
        } else {
            ("proxy-authenticate", "Proxy-Authorization")
        };
        let Some(challenge) = response.header(challenge_header) else {
            return Err(RegistrationError::from_response(&response));
        };
        let challenge = DigestChallenge::parse(challenge).map_err(|e| {
            warn!("unusable digest challenge: {}", e);
            RegistrationError::from_response(&response)
        })?;
        let config = &session.config;
        if config.password.is_empty() {
            return Err(RegistrationError::MissingCredentials);
        }
        if expires > 0 {
            self.update_status(|status| status.set_state(RegistrationState::Challenged));
        }
        debug!(realm = %challenge.realm, code, "answering digest challenge");

        let credentials = authorize(
            &challenge,
            config.auth_username(),
            &config.password,
            Method::Register.as_str(),
            &config.registrar_uri(),
        );
        let request = self.build_register(
            session,
            conn,
            expires,
            Some((authorization_header, credentials.to_header_value())),
        );
        if expires > 0 {
            self.update_status(|status| status.set_state(RegistrationState::Registering));
        }
        let response = self.send_request(conn, &request).await?;
        match response.status().unwrap_or_default() {
            200..=299 => Ok(granted_expires(&response, expires)),
            _ => Err(RegistrationError::from_response(&response)),
        }
    }

    fn build_register(
        &self,
        session: &RegisterSession,
        conn: &Connection,
        expires: u32,
        authorization: Option<(&str, String)>,
    ) -> SipMessage {
        let config = &session.config;
        let local = advertised_addr(conn);
        let contact = match conn.kind() {
            TransportKind::Udp => format!("sip:{}@{}", config.username, local),
            TransportKind::Tcp => format!("sip:{}@{};transport=tcp", config.username, local),
        };
        let aor = config.aor();
        let mut builder = RequestBuilder::new(Method::Register, config.registrar_uri())
            .via(conn.kind().via_name(), local, &new_branch())
            .from(&aor, &session.from_tag)
            .to(&aor, None)
            .call_id(&session.call_id)
            .cseq(session.next_cseq())
            .contact(&contact)
            .header("Expires", expires.to_string());
        if let Some((name, value)) = authorization {
            builder = builder.header(name, value);
        }
        builder.build()
    }

    fn build_options(&self, session: &RegisterSession, conn: &Connection) -> SipMessage {
        let config = &session.config;
        let local = advertised_addr(conn);
        RequestBuilder::new(Method::Options, config.registrar_uri())
            .via(conn.kind().via_name(), local, &new_branch())
            .from(&config.aor(), &new_tag())
            .to(&config.registrar_uri(), None)
            .call_id(&new_call_id(&local.ip().to_string()))
            .cseq(1)
            .build()
    }

    /// Send a request and wait for its final response on the same connection.
    pub(super) async fn send_request(
        &self,
        conn: &Connection,
        request: &SipMessage,
    ) -> Result<SipMessage, RegistrationError> {
        let key = transaction_key(request)
            .ok_or_else(|| RegistrationError::Transport("request without Call-ID/CSeq".to_string()))?;
        let (tx, rx) = oneshot::channel();
        self.lock_transactions().insert(key.clone(), tx);

        if let Err(e) = conn.send(request) {
            self.lock_transactions().remove(&key);
            return Err(RegistrationError::Transport(e.to_string()));
        }
        let result = select! {
            response = timeout(self.transaction_timeout, rx) => match response {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(_)) => Err(RegistrationError::Transport("transaction dropped".to_string())),
                Err(_) => Err(RegistrationError::Timeout),
            },
            _ = conn.closed() => Err(RegistrationError::Transport("connection closed".to_string())),
        };
        self.lock_transactions().remove(&key);
        result
    }

    /// Re-REGISTER and OPTIONS keepalive on the live connection until `token` fires.
    ///
    /// A terminal refresh failure ends the session. A refresh timeout, or
    /// `MAX_MISSED_KEEPALIVES` unanswered keepalives in a row, closes the
    /// connection so `run_session` reconnects.
    fn spawn_timers(self: &Arc<Self>, session: Arc<RegisterSession>, conn: Connection, token: CancellationToken) {
        let ua = self.clone();
        let keepalive_every = Duration::from_secs(session.config.keepalive_interval_secs.max(1));
        let refresh_every = Duration::from_secs(session.config.register_interval_secs.max(1));
        let missed = Arc::new(AtomicU32::new(0));
        tokio::spawn(async move {
            let mut keepalive = interval_at(Instant::now() + keepalive_every, keepalive_every);
            let mut refresh = interval_at(Instant::now() + refresh_every, refresh_every);
            loop {
                select! {
                    _ = token.cancelled() => break,
                    _ = keepalive.tick() => {
                        let ua = ua.clone();
                        let conn = conn.clone();
                        let missed = missed.clone();
                        let options = ua.build_options(&session, &conn);
                        tokio::spawn(async move {
                            match ua.send_request(&conn, &options).await {
                                Ok(response) => {
                                    missed.store(0, Ordering::SeqCst);
                                    debug!(status = response.status(), "keepalive answered");
                                }
                                Err(e) => {
                                    let count = missed.fetch_add(1, Ordering::SeqCst) + 1;
                                    warn!(missed = count, "keepalive failed: {}", e);
                                    if e.is_transient() && count >= MAX_MISSED_KEEPALIVES {
                                        warn!(remote = %conn.remote_addr(), "registrar unresponsive, dropping connection");
                                        conn.close();
                                    }
                                }
                            }
                        });
                    }
                    _ = refresh.tick() => {
                        match ua.do_register(&session, &conn, session.config.expires).await {
                            Ok(expires) => {
                                debug!(aor = session.config.aor(), expires, "registration refreshed");
                                ua.update_status(|status| {
                                    status.set_state(RegistrationState::Registered);
                                    status.last_registered = Some(Utc::now());
                                    status.last_error = None;
                                });
                            }
                            Err(e) if e.is_transient() => {
                                warn!(aor = session.config.aor(), "registration refresh failed, reconnecting: {}", e);
                                ua.update_status(|status| {
                                    status.set_state(RegistrationState::Reconnecting);
                                    status.last_error = Some(e.to_string());
                                });
                                conn.close();
                                break;
                            }
                            Err(e) => {
                                warn!(aor = session.config.aor(), "registration refresh rejected: {}", e);
                                ua.update_status(|status| {
                                    status.set_state(RegistrationState::Failed);
                                    status.last_error = Some(e.to_string());
                                });
                                session.token.cancel();
                                ua.set_connection(None);
                                break;
                            }
                        }
                    }
                }
            }
            debug!("registration timers stopped");
        });
    }
}
