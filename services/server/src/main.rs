use chat_server::api::ApiClient;
use chat_server::config::{self, ServerConfig};
use chat_server::kv::Kv;
use chat_server::persist::ChatState;
use chat_server::{AppState, ChatSettings, build_router, repo};
use sqlx::postgres::PgPoolOptions;
use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() {
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| config::DEFAULT_CONFIG_PATH.to_owned());
    let cfg = config::load_or_create(Path::new(&config_path)).expect("unable to load config");

    let default_level = if cfg.debug { "debug" } else { "info" };
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| default_level.to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if cfg.max_processes > 0 {
        builder.worker_threads(cfg.max_processes);
    }
    let runtime = builder.build().expect("failed to build runtime");
    runtime.block_on(serve(cfg));
}

async fn serve(cfg: ServerConfig) {
    info!("connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&cfg.database.dsn)
        .await
        .expect("failed to connect to Postgres");

    let kv = Kv::new(&cfg.redis).expect("invalid KV store address");
    kv.ping().await.expect("failed to connect to the KV store");

    let chat_state =
        ChatState::load(Path::new(chat_server::STATE_PATH)).expect("failed to load state file");
    let settings = ChatSettings {
        delay: Duration::from_millis(cfg.chat_delay_ms),
        max_throttle: Duration::from_millis(cfg.max_throttle_time_ms),
    };
    let api = ApiClient::new(&cfg.api.base_url, &cfg.api.private_key);
    let state = AppState::new(pool, kv, api, chat_state, settings);

    match repo::users::load_nicks(&state.pool).await {
        Ok(rows) => {
            let count = rows.len();
            for (uid, nick, protected) in rows {
                state.users.add(&nick, uid, protected).await;
            }
            info!(count, "loaded nicks");
        }
        Err(e) => warn!(error = %e, "unable to preload nicks"),
    }
    state.bans.load_active(&state.pool).await;

    tokio::spawn(chat_server::kv::run_pubsub(state.clone()));
    tokio::spawn(chat_server::run_sweeper(state.clone()));

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(&cfg.listen_address)
        .await
        .expect("failed to bind");
    info!(addr = %cfg.listen_address, "server listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("server error");
    info!("server shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
