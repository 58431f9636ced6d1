use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{AllowHeaders, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod documents;
mod error;
mod extractor;
mod handlers;
mod ics;
mod llm;
mod models;
mod orchestrator;
mod prompts;


use config::Config;
use ics::{IcsRenderer, SystemClock};
use llm::{LlmClient, OpenAiClient};
use orchestrator::{ChatOrchestrator, SyllabusAnalyzer};

/// Per-process handles shared by every request.
/// Holds no request state: each stream builds its own extractor.
#[derive(Clone)]
pub struct AppState {
    llm: Arc<dyn LlmClient>,
    chat: ChatOrchestrator,
    analyzer: SyllabusAnalyzer,
    calendar: IcsRenderer,
}

impl AppState {
    pub fn new(llm: Arc<dyn LlmClient>, calendar: IcsRenderer) -> Self {
        Self {
            chat: ChatOrchestrator::new(Arc::clone(&llm)),
            analyzer: SyllabusAnalyzer::new(Arc::clone(&llm)),
            llm,
            calendar,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "syllendar_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("loading configuration")?;

    // Initialize state
    let llm = OpenAiClient::from_config(&config.llm).context("building LLM client")?;
    let calendar = IcsRenderer::new(Arc::new(SystemClock), config.recurrence_until_year);
    let state = AppState::new(Arc::new(llm), calendar);

    // Build router
    let app = app(state, &config)?;

    // Run server
    let addr = config.bind_addr();
    tracing::info!("🚀 Syllendar API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn app(state: AppState, config: &Config) -> anyhow::Result<Router> {
    let origins = config
        .cors_origins
        .iter()
        .map(|origin| origin.parse::<HeaderValue>())
        .collect::<Result<Vec<_>, _>>()
        .context("parsing CORS_ORIGINS")?;

    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true);

    Ok(routes(state)
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http()))
}

fn routes(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health_check))
        .route("/test", get(handlers::test_completion))
        .route("/test/", get(handlers::test_completion))
        .route("/test/stream", get(handlers::test_stream))
        .route("/generate/analyze-image", post(handlers::analyze_image))
        .route("/generate/generate-ics", post(handlers::generate_ics))
        .route(
            "/generate/generate-ics-selected",
            post(handlers::generate_ics_selected),
        )
        .route("/generate/chat", post(handlers::chat))
        .route("/generate/chat-stream", post(handlers::chat_stream))
        .route("/pdf/analyze", post(handlers::analyze_pdf))
        .route("/pdf/analyze-stream", post(handlers::analyze_pdf_stream))
        .with_state(state)
}
