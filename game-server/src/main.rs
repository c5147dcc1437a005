mod channels;
mod clock;
mod config;
mod connection;
mod events;
mod http;
mod orchestrator;
mod services;
mod state;
mod ws;

use crate::config::reload_config;
use crate::services::NoopServices;
use crate::state::AppState;
use axum::routing::get;
use chrono::Utc;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
/// Activates error tracing, spawns the watch dog tasks for the clock polls and
/// for eventual dead subscriptions, then it sets up the routing system to serve
/// the web sockets and the HTTP surface. The server listens on port 8080.
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=trace", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(true) // Modul-Path (e.g. game_server::orchestrator)
                .with_thread_ids(true) // Thread-ID (helpful for Tokio)
                .with_thread_names(true), // Thread-Name
        )
        .init();

    let app_state = Arc::new(AppState::new(Arc::new(NoopServices)));

    let initial = reload_config(&app_state.config).await;
    if let Err(message) = initial {
        tracing::warn!(message, "No usable config file, running on the defaults.");
    }

    // The clock watch dog drives the polled timeout checks.
    let clock_state = app_state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(1));
        loop {
            interval.tick().await;
            sweep_due_timeouts(&clock_state).await;
        }
    });

    // The subscription watch dog prunes leftovers of dead connections. This is
    // a fallback solution, disconnects should be handled internally otherwise.
    let sweep_state = app_state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(1200)); // 20 Min
        loop {
            interval.tick().await;
            sweep_state.subscribers.sweep_closed().await;
        }
    });

    let exit_state = app_state.clone();
    let app = http::router()
        .route("/ws", get(ws::websocket_handler))
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:8080")
        .await
        .unwrap();

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            exit_state.shutdown.exit.notified().await;
            tracing::warn!("Last clocked game is over, the server exits.");
        })
        .await
        .unwrap();
}

/// Runs over the scheduled timeout checks and polls every game whose ticking
/// reserve may have run out by now.
async fn sweep_due_timeouts(state: &Arc<AppState>) {
    let now = Utc::now();
    let due: Vec<uuid::Uuid> = {
        let schedule = state.timeout_not_earlier_than.lock().await;
        schedule
            .iter()
            .filter(|(_, not_earlier_than)| **not_earlier_than <= now)
            .map(|(id, _)| *id)
            .collect()
    };
    for id in due {
        let Some(game) = state.game(&id).await else {
            state.timeout_not_earlier_than.lock().await.remove(&id);
            continue;
        };
        match orchestrator::check_timeout(state, &game).await {
            Ok(Some(outcome)) => {
                tracing::info!(game = %id, winner = ?outcome.winner, "Clock poll committed a timeout.");
            }
            Ok(None) => {}
            Err(err) => {
                tracing::error!(game = %id, %err, "Clock poll failed.");
            }
        }
    }
}
