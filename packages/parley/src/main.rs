use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{get, post},
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod auth;
mod config;
mod db;
mod fanout;
mod handlers;
mod ids;
mod metrics;
mod models;
mod notify;
mod push;
mod reconciler;
mod repository;
mod ws;

#[cfg(test)]
mod test_helpers;

use crate::config::{FileConfig, ParleyConfig, ServerConfig};
use crate::db::Database;
use crate::ids::{IdGenerator, UuidIdGenerator};
use crate::metrics::ServerMetrics;
use crate::models::{Conversation, ConversationStatus};
use crate::notify::Notifier;
use crate::push::PushBroadcaster;
use crate::reconciler::SyncReconciler;
use crate::repository::ConversationRepository;
use crate::ws::{BroadcastRegistry, ConnectionContext};

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Multiplexed conversation sync server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.parley)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync server in the foreground
    Serve(ServeArgs),

    /// Manage conversations in the local database
    #[command(subcommand)]
    Conversation(ConversationCommands),
}

#[derive(Parser)]
struct ServeArgs {
    /// Port for the web server (overrides config.toml; default 8080)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides config.toml; default 127.0.0.1)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum ConversationCommands {
    /// Create a conversation owned by a user and print its id
    Create {
        /// Owning user id (the value clients send as x-user-id)
        #[arg(long)]
        user: String,

        #[arg(long)]
        title: Option<String>,
    },

    /// Mark a conversation archived; sync to it is refused afterwards
    Archive { id: String },
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub repository: Arc<ConversationRepository>,
    /// Duplex subscribers and the agent slot
    pub registry: Arc<BroadcastRegistry>,
    /// Push-only (SSE) subscribers
    pub push: Arc<PushBroadcaster>,
    pub notifier: Arc<Notifier>,
    pub reconciler: Arc<SyncReconciler>,
    pub ids: Arc<dyn IdGenerator>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
    pub server_config: Arc<ServerConfig>,
}

impl AppState {
    pub(crate) fn new(repository: ConversationRepository, server_config: ServerConfig) -> Self {
        let repository = Arc::new(repository);
        let metrics = Arc::new(ServerMetrics::new());
        let ids: Arc<dyn IdGenerator> = Arc::new(UuidIdGenerator);
        let registry = Arc::new(BroadcastRegistry::new(server_config.websocket.write_timeout));
        let push = Arc::new(PushBroadcaster::new(
            server_config.push.queue_capacity,
            metrics.clone(),
        ));
        let notifier = Arc::new(Notifier::new(
            registry.clone(),
            push.clone(),
            metrics.clone(),
        ));
        let reconciler = Arc::new(SyncReconciler::new(
            repository.clone(),
            ids.clone(),
            notifier.clone(),
            metrics.clone(),
        ));

        Self {
            repository,
            registry,
            push,
            notifier,
            reconciler,
            ids,
            metrics,
            server_config: Arc::new(server_config),
        }
    }

    pub(crate) fn connection_context(&self) -> ConnectionContext {
        ConnectionContext {
            registry: self.registry.clone(),
            reconciler: self.reconciler.clone(),
            conversations: self.repository.clone(),
            metrics: self.metrics.clone(),
            config: self.server_config.websocket.clone(),
        }
    }
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/ws", get(handlers::websocket_handler))
        .route(
            "/api/conversations/{id}/events",
            get(handlers::conversation_events),
        )
        .route(
            "/api/conversations/{id}/messages",
            get(handlers::list_messages),
        )
        .route(
            "/api/conversations/{id}/sync",
            post(handlers::sync_messages),
        )
        .route(
            "/api/conversations/{id}/sync/status",
            get(handlers::sync_status),
        )
        .route(
            "/api/conversations/{id}/generate",
            post(handlers::request_generation),
        )
        .route("/api/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ParleyConfig::new(cli.data_dir.clone())?;

    match cli.command {
        Commands::Serve(args) => run_server(args, config).await,
        Commands::Conversation(cmd) => conversation_command(cmd, config).await,
    }
}

async fn run_server(args: ServeArgs, config: ParleyConfig) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "parley=debug,tower_http=debug,info"
    } else {
        "parley=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting parley");

    let file_config: FileConfig = config::load_config(&config.data_dir)
        .extract()
        .with_context(|| {
            format!(
                "Failed to load configuration from {}",
                config.config_toml_path().display()
            )
        })?;
    let server_config = ServerConfig::from_file(&file_config);
    info!(
        "Duplex: ping every {:?}, read deadline {:?}, write deadline {:?}, max envelope {} KB",
        server_config.websocket.ping_interval,
        server_config.websocket.read_timeout,
        server_config.websocket.write_timeout,
        server_config.websocket.max_envelope_bytes / 1024
    );

    // Initialize database
    info!("Initializing database...");
    let db = Database::new(&config).await?;
    let repository = ConversationRepository::new(db.pool.clone());

    let app_state = AppState::new(repository, server_config);
    let app = build_router(app_state);

    let host = args
        .host
        .or(file_config.server.host)
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let port = args.port.or(file_config.server.port).unwrap_or(8080);
    let addr = format!("{}:{}", host, port)
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("parley listening on http://{}", actual_addr);
    info!("API endpoints:");
    info!("  GET    /api/ws                              - Multiplexed duplex connection");
    info!("  GET    /api/conversations/:id/events        - Server-sent events");
    info!("  GET    /api/conversations/:id/messages      - Authoritative messages");
    info!("  POST   /api/conversations/:id/sync          - Reconcile a batch");
    info!("  GET    /api/conversations/:id/sync/status   - Sync counters");
    info!("  POST   /api/conversations/:id/generate      - Route to the agent");

    // Create shutdown signal handler
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    // Run server with graceful shutdown
    let server_result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await
    .context("Server error");

    db.pool.close().await;
    info!("Shutdown complete");
    server_result
}

async fn conversation_command(cmd: ConversationCommands, config: ParleyConfig) -> Result<()> {
    let db = Database::new(&config).await?;
    let repository = ConversationRepository::new(db.pool.clone());

    match cmd {
        ConversationCommands::Create { user, title } => {
            let now = Utc::now();
            let conversation = Conversation {
                id: UuidIdGenerator.generate_conversation_id(),
                user_id: user,
                title,
                status: ConversationStatus::Active,
                created_at: now,
                updated_at: now,
            };
            repository.create_conversation(&conversation).await?;
            println!("{}", conversation.id);
        }
        ConversationCommands::Archive { id } => {
            if !repository
                .set_conversation_status(&id, ConversationStatus::Archived)
                .await?
            {
                anyhow::bail!("Conversation not found: {}", id);
            }
            println!("Archived {}", id);
        }
    }

    db.pool.close().await;
    Ok(())
}
