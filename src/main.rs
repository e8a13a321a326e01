//! # Bazaar Chat Server
//!
//! Real-time conversation messaging for the marketplace: buyers, vendors, and
//! service providers exchange messages delivered live over WebSocket when the
//! recipient is connected, and via device push when they are not.

mod db;
mod dispatch;
mod error;
mod handlers;
mod live;
mod models;
mod presence;
mod push;
mod state;
mod validation;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use handlers::{
    auth_handler, get_conversation_handler, get_messages_handler, health_handler,
    list_conversations_handler, mark_read_handler, register_device_handler, register_handler,
    send_message_handler, start_conversation_handler, unread_count_handler, ws_handler,
};
use state::{AppState, SharedState};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server bind address
    #[arg(short = 'a', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Database file path
    #[arg(short = 'd', long, default_value = "bazaar-chat.db")]
    database: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    info!("Starting Bazaar Chat Server");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Bind address: {}:{}", args.host, args.port);

    // Initialize shared state with database; the dispatcher worker is spawned
    // here too. Real push transports plug in behind the gateway trait.
    info!("Initializing database: {}", args.database);
    let state: SharedState = AppState::new(&args.database).await?;

    let app = router(state);

    println!("Bazaar Chat Server starting on {}:{}", args.host, args.port);
    println!();
    println!("Endpoints:");
    println!("  GET    /health                      - Health check");
    println!("  POST   /register                    - User registration");
    println!("  POST   /auth                        - User authentication");
    println!("  POST   /conversations               - Start conversation (?token=)");
    println!("  GET    /conversations               - List conversations with unread counts (?token=)");
    println!("  GET    /conversations/:id           - Get one conversation (?token=)");
    println!("  GET    /conversations/:id/messages  - Message history (?token=&limit=50&before=msg_id)");
    println!("  POST   /conversations/:id/messages  - Send message (?token=)");
    println!("  POST   /conversations/:id/read      - Mark conversation read (?token=)");
    println!("  GET    /unread                      - Aggregate unread count (?token=)");
    println!("  POST   /devices                     - Register device push token (?token= optional)");
    println!("  WS     /ws                          - Live messaging channel (?token=)");
    println!();

    let listener = tokio::net::TcpListener::bind(&format!("{}:{}", args.host, args.port)).await?;
    info!("Server successfully bound to {}:{}", args.host, args.port);

    axum::serve(listener, app).await?;

    info!("Shutting down server...");
    Ok(())
}

/// Build the full application router
fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/register", post(register_handler))
        .route("/auth", post(auth_handler))
        // Conversation endpoints
        .route(
            "/conversations",
            post(start_conversation_handler).get(list_conversations_handler),
        )
        .route("/conversations/:id", get(get_conversation_handler))
        .route(
            "/conversations/:id/messages",
            get(get_messages_handler).post(send_message_handler),
        )
        .route("/conversations/:id/read", post(mark_read_handler))
        .route("/unread", get(unread_count_handler))
        // Device registry
        .route("/devices", post(register_device_handler))
        // WebSocket endpoint
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_methods(Any)
                        .allow_headers(Any)
                        .allow_origin(Any),
                ),
        )
}
