use super::dialog::{PendingInvite, SipDialog};
use super::invitation::{InvitationHandler, UnavailableInvitationHandler};
use super::registration::{
    transaction_key, RegisterSession, RegistrationConfig, RegistrationStatus,
};
use super::routes::PhoneRouteTable;
use super::transport::{Connection, InboundReceiver};
use crate::sip::SipMessage;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct UserAgentBuilder {
    pub config: Option<RegistrationConfig>,
    pub cancel_token: Option<CancellationToken>,
    pub invitation_handler: Option<Arc<dyn InvitationHandler>>,
    pub routes: Option<Arc<PhoneRouteTable>>,
    pub transaction_timeout: Option<Duration>,
}

/// The SIP dialog and registration engine.
///
/// Owns at most one registration (and its connection) at a time. Dialogs
/// live independently of the connection so calls survive a reconnect.
pub struct UserAgent {
    pub token: CancellationToken,
    pub routes: Arc<PhoneRouteTable>,
    pub invitation_handler: Arc<dyn InvitationHandler>,
    pub(super) transaction_timeout: Duration,
    pub(super) session: tokio::sync::Mutex<Option<Arc<RegisterSession>>>,
    pub(super) dialogs: tokio::sync::Mutex<HashMap<String, SipDialog>>,
    pending_invites: Mutex<HashMap<String, PendingInvite>>,
    transactions: Mutex<HashMap<String, oneshot::Sender<SipMessage>>>,
    config: RwLock<Option<RegistrationConfig>>,
    status: RwLock<RegistrationStatus>,
    connection: RwLock<Option<Connection>>,
}

pub type UserAgentRef = Arc<UserAgent>;

impl Default for UserAgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl UserAgentBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            cancel_token: None,
            invitation_handler: None,
            routes: None,
            transaction_timeout: None,
        }
    }

    pub fn with_config(mut self, config: Option<RegistrationConfig>) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn with_invitation_handler(mut self, handler: Arc<dyn InvitationHandler>) -> Self {
        self.invitation_handler = Some(handler);
        self
    }

    pub fn with_routes(mut self, routes: Arc<PhoneRouteTable>) -> Self {
        self.routes = Some(routes);
        self
    }

    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = Some(timeout);
        self
    }

    pub fn build(mut self) -> UserAgentRef {
        let token = self.cancel_token.take().unwrap_or_default();
        let transaction_timeout = self.transaction_timeout.unwrap_or_else(|| {
            Duration::from_secs(
                self.config
                    .as_ref()
                    .map(|c| c.connect_timeout_secs)
                    .unwrap_or(20),
            )
        });
        Arc::new(UserAgent {
            token,
            routes: self.routes.unwrap_or_default(),
            invitation_handler: self
                .invitation_handler
                .unwrap_or_else(|| Arc::new(UnavailableInvitationHandler)),
            transaction_timeout,
            session: tokio::sync::Mutex::new(None),
            dialogs: tokio::sync::Mutex::new(HashMap::new()),
            pending_invites: Mutex::new(HashMap::new()),
            transactions: Mutex::new(HashMap::new()),
            config: RwLock::new(self.config),
            status: RwLock::new(RegistrationStatus::default()),
            connection: RwLock::new(None),
        })
    }
}

impl UserAgent {
    /// Register with the configured registrar (if any) and run until the
    /// root token is cancelled, then unregister and drop all calls.
    pub async fn serve(self: Arc<Self>) -> anyhow::Result<()> {
        if let Some(config) = self.config() {
            if let Err(e) = self.register(config).await {
                warn!("initial registration failed: {}", e);
            }
        } else {
            info!("no sip registrar configured");
        }
        self.token.cancelled().await;
        self.stop().await;
        Ok(())
    }

    pub async fn stop(&self) {
        self.unregister().await;
        self.close_dialogs().await;
        info!("useragent stopped");
    }

    pub fn status(&self) -> RegistrationStatus {
        self.status
            .read()
            .map(|status| status.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn config(&self) -> Option<RegistrationConfig> {
        self.config
            .read()
            .map(|config| config.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub async fn dialog_count(&self) -> usize {
        self.dialogs.lock().await.len()
    }

    pub(super) fn set_config(&self, config: Option<RegistrationConfig>) {
        match self.config.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }

    pub(super) fn update_status(&self, f: impl FnOnce(&mut RegistrationStatus)) {
        match self.status.write() {
            Ok(mut guard) => f(&mut *guard),
            Err(poisoned) => f(&mut *poisoned.into_inner()),
        }
    }

    pub(super) fn current_connection(&self) -> Option<Connection> {
        self.connection
            .read()
            .map(|conn| conn.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub(super) fn set_connection(&self, conn: Option<Connection>) {
        let previous = match self.connection.write() {
            Ok(mut guard) => std::mem::replace(&mut *guard, conn),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), conn),
        };
        if let Some(previous) = previous {
            previous.close();
        }
    }

    pub(super) fn lock_pending(&self) -> MutexGuard<'_, HashMap<String, PendingInvite>> {
        self.pending_invites
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(super) fn lock_transactions(
        &self,
    ) -> MutexGuard<'_, HashMap<String, oneshot::Sender<SipMessage>>> {
        self.transactions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Read loop for one connection: requests go to the dialog handlers,
    /// final responses complete the waiting transaction.
    pub(super) async fn dispatch_loop(self: Arc<Self>, conn: Connection, mut inbound: InboundReceiver) {
        while let Some(message) = inbound.recv().await {
            if message.is_request() {
                self.handle_request(&conn, message).await;
                continue;
            }
            let status = message.status().unwrap_or_default();
            if status < 200 {
                debug!(status, call_id = message.call_id(), "provisional response");
                continue;
            }
            let waiter = transaction_key(&message).and_then(|key| self.lock_transactions().remove(&key));
            match waiter {
                Some(waiter) => {
                    waiter.send(message).ok();
                }
                None => debug!(status, call_id = message.call_id(), "unmatched response"),
            }
        }
        conn.close();
        debug!(remote = %conn.remote_addr(), "sip dispatch loop ended");
    }
}
