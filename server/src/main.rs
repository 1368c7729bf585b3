use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use chatport_server::config::{generate_config_template, Config};
use chatport_server::{auth, chat, db, routes, state, ws};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("chatport_server=info"))?;
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(filter).init();
    }

    tracing::info!("Chatport server v{} starting", env!("CARGO_PKG_VERSION"));

    // Refuse to start with tunables the session loop cannot honor
    let realtime = config.realtime_settings()?;
    tracing::info!(
        outbound_buffer = realtime.outbound_buffer,
        delivery_timeout_ms = realtime.delivery_timeout.as_millis() as u64,
        max_content_length = realtime.max_content_length,
        "Realtime settings resolved"
    );

    // Initialize SQLite database
    let db = db::init_db(&config.data_dir)?;

    // Load or generate JWT verification key shared with the identity service
    let jwt_secret = auth::jwt::load_or_generate_jwt_secret(&config.data_dir)?;

    let app_state = state::AppState {
        store: Arc::new(chat::store::SqliteStore::new(db)),
        jwt_secret,
        connections: ws::new_connection_registry(),
        realtime: Arc::new(realtime),
    };

    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
