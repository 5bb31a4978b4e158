use crate::call::{
    run_reaper, CallStore, ConversationInvitationHandler, Orchestrator, OrchestratorRef,
};
use crate::config::Config;
use crate::llm::{OpenAiClientBuilder, TextGenerator, UnavailableTextGenerator};
use crate::numbers::{NumberDirectory, StaticNumberDirectory};
use crate::synthesis::{HttpSynthesisClient, SynthesisClient};
use crate::useragent::routes::PhoneRouteTable;
use crate::useragent::{UserAgentBuilder, UserAgentRef};
use anyhow::Result;
use axum::{routing::get, Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};

pub struct AppStateInner {
    pub config: Arc<Config>,
    pub useragent: UserAgentRef,
    pub orchestrator: OrchestratorRef,
    pub token: CancellationToken,
}

pub type AppState = Arc<AppStateInner>;

/// Assembles the engine and the turn engine from config. Collaborators can
/// be swapped before `build`.
pub struct AppStateBuilder {
    pub config: Option<Config>,
    pub token: Option<CancellationToken>,
    pub llm: Option<Arc<dyn TextGenerator>>,
    pub tts: Option<Arc<dyn SynthesisClient>>,
    pub numbers: Option<Arc<dyn NumberDirectory>>,
}

impl Default for AppStateBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AppStateBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            token: None,
            llm: None,
            tts: None,
            numbers: None,
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn with_text_generator(mut self, llm: Arc<dyn TextGenerator>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_synthesizer(mut self, tts: Arc<dyn SynthesisClient>) -> Self {
        self.tts = Some(tts);
        self
    }

    pub fn with_number_directory(mut self, numbers: Arc<dyn NumberDirectory>) -> Self {
        self.numbers = Some(numbers);
        self
    }

    pub fn build(self) -> Result<AppState> {
        let config = Arc::new(self.config.unwrap_or_default());
        let token = self.token.unwrap_or_default();

        let llm: Arc<dyn TextGenerator> = match self.llm {
            Some(llm) => llm,
            None => match OpenAiClientBuilder::from_config(&config.llm).build() {
                Ok(client) => Arc::new(client),
                Err(e) => {
                    warn!("text generation disabled, static greetings only: {}", e);
                    Arc::new(UnavailableTextGenerator)
                }
            },
        };
        let tts: Arc<dyn SynthesisClient> = match self.tts {
            Some(tts) => tts,
            None => Arc::new(HttpSynthesisClient::from_config(config.tts.clone())?),
        };
        let numbers: Arc<dyn NumberDirectory> = self.numbers.unwrap_or_else(|| {
            Arc::new(StaticNumberDirectory::new(
                config.numbers.clone(),
                config.default_number.clone(),
            ))
        });

        let orchestrator = Arc::new(Orchestrator::new(
            config.webhook.clone(),
            Arc::new(CallStore::new()),
            llm,
            tts,
            numbers,
        ));

        let routes = config
            .sip
            .as_ref()
            .map(|sip| PhoneRouteTable::from_routes(sip.routes.clone()))
            .unwrap_or_default();
        // every configured number routes to its own entry unless overridden
        for number in config.numbers.keys() {
            routes.set_if_absent(number.as_str(), number.as_str());
        }
        let useragent = UserAgentBuilder::new()
            .with_config(config.sip.as_ref().map(|sip| sip.registration.clone()))
            .with_cancel_token(token.child_token())
            .with_routes(Arc::new(routes))
            .with_invitation_handler(Arc::new(ConversationInvitationHandler::new(
                orchestrator.clone(),
            )))
            .build();

        Ok(Arc::new(AppStateInner {
            config,
            useragent,
            orchestrator,
            token,
        }))
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "running",
        "version": crate::version::get_short_version(),
    }))
}

pub fn create_router(state: AppState) -> Router {
    // CORS configuration to allow cross-origin requests
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            axum::http::header::ACCEPT,
            axum::http::header::ORIGIN,
        ]);

    Router::new()
        .route("/health", get(health_handler))
        .merge(crate::handler::router().with_state(state))
        .layer(cors)
}

pub async fn run(state: AppState) -> Result<()> {
    let ua = state.useragent.clone();
    let token = state.token.clone();

    let app = create_router(state.clone());
    let addr: SocketAddr = state.config.http_addr.parse()?;
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            return Err(anyhow::anyhow!("Failed to bind to {}: {}", addr, e));
        }
    };
    info!("listening on {}", addr);

    let http_task = axum::serve(listener, app).with_graceful_shutdown({
        let token = token.clone();
        async move { token.cancelled().await }
    });

    let reaper = tokio::spawn(run_reaper(
        state.orchestrator.calls.clone(),
        token.child_token(),
        state.config.webhook.reaper_interval(),
        state.config.webhook.call_timeout(),
    ));
    let ua_task = tokio::spawn(ua.clone().serve());

    let result = select! {
        http_result = http_task => {
            match http_result {
                Ok(_) => {
                    info!("Server shut down gracefully");
                    Ok(())
                }
                Err(e) => {
                    tracing::error!("Server error: {}", e);
                    Err(anyhow::anyhow!("Server error: {}", e))
                }
            }
        }
        _ = token.cancelled() => {
            info!("Application shutting down due to cancellation");
            Ok(())
        }
    };
    token.cancel();
    match ua_task.await {
        Ok(Err(e)) => tracing::error!("User agent server error: {}", e),
        Err(e) => tracing::error!("User agent task failed: {}", e),
        Ok(Ok(())) => {}
    }
    let _ = reaper.await;
    result
}
