pub mod api;
pub mod bans;
pub mod config;
pub mod connection;
pub mod eventlog;
pub mod hub;
pub mod kv;
pub mod mutes;
pub mod namescache;
pub mod persist;
pub mod repo;
pub mod state;
pub mod user;
pub mod ws;

pub use state::{AppState, ChatSettings};

use axum::{Router, routing::get};
use std::time::Duration;

/// Default path of the persisted `{mutes, submode}` snapshot.
pub const STATE_PATH: &str = "chat-state.bin";

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/healthz", get(health::healthz))
        .with_state(state)
}

/// Periodic sweep of expired moderation entries.
pub async fn run_sweeper(state: AppState) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // the immediate first tick
    loop {
        ticker.tick().await;
        state.bans.clean().await;
        state.chat_state.clean().await;
    }
}

/// Millisecond-precision unix timestamp used in every outbound event.
pub fn unix_milli_time() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

mod health {
    use axum::response::IntoResponse;
    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }
}
