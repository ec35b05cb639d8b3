//! Arbiter server - agent execution run and audit engine

use clap::Parser;
use sqlx::sqlite::SqlitePoolOptions;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use arbiter::completion::CompletionClient;
use arbiter::{api, AppState};

#[derive(Debug, Parser)]
#[command(name = "arbiter", about = "Agent execution run and audit engine server")]
struct Args {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:arbiter.db")]
    database_url: String,

    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:3000")]
    bind_addr: String,

    /// Base URL of the completion backend; the deterministic stub is used
    /// when unset.
    #[arg(long, env = "COMPLETION_URL")]
    completion_url: Option<String>,

    /// Pending approvals older than this are escalated to operators.
    #[arg(long, env = "APPROVAL_ESCALATION_SECS", default_value_t = 900)]
    approval_escalation_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "arbiter=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Database connection
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&args.database_url)
        .await?;

    // Run migrations
    sqlx::migrate!("./migrations").run(&pool).await?;

    let completion = match &args.completion_url {
        Some(url) => CompletionClient::http(url.clone()),
        None => CompletionClient::Stub,
    };
    let state = AppState::new(pool, completion);

    // Escalate stale approvals in the background; starvation is surfaced,
    // never auto-resolved.
    let gate = state.gate.clone();
    let escalation = chrono::Duration::seconds(args.approval_escalation_secs as i64);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            if let Err(e) = gate.escalate_stale(escalation).await {
                tracing::error!("approval escalation sweep failed: {}", e);
            }
        }
    });

    // Build router
    let app = api::router()
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&args.bind_addr).await?;
    tracing::info!("Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}
