//! REST API for site state and loadpoint settings.
//!
//! Endpoints:
//! - `GET /state` — mode plus the latest published site and loadpoint values
//! - `GET /loadpoints/{id}` — one loadpoint's published values and settings
//! - `POST /mode` — change the charge mode
//! - `POST /loadpoints/{id}/settings` — partial loadpoint settings update

mod handlers;
mod types;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::core::site::SiteHandle;
use crate::core::types::Param;

pub use types::SiteState;

/// Application state shared across all request handlers.
///
/// The published-value snapshot is fed by [`collect`]; setters go through
/// the site handle.
pub struct AppState {
    /// Latest published site and loadpoint values.
    pub state: Arc<RwLock<SiteState>>,
    /// Handle for mode and settings changes.
    pub handle: SiteHandle,
}

/// Folds the UI param stream into the shared snapshot. Runs until the
/// channel closes.
pub async fn collect(mut rx: UnboundedReceiver<Param>, state: Arc<RwLock<SiteState>>) {
    while let Some(param) = rx.recv().await {
        let mut state = state.write();
        match param.loadpoint {
            Some(id) => {
                if state.loadpoints.len() <= id {
                    state.loadpoints.resize(id + 1, Default::default());
                }
                state.loadpoints[id].insert(param.key, param.val);
            }
            None => {
                state.site.insert(param.key, param.val);
            }
        }
    }
}

/// Builds the axum router with all API routes.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/state", get(handlers::get_state))
        .route("/loadpoints/{id}", get(handlers::get_loadpoint))
        .route("/mode", post(handlers::set_mode))
        .route(
            "/loadpoints/{id}/settings",
            post(handlers::set_loadpoint_settings),
        )
        .with_state(state)
}

/// Binds to the given address and serves the API.
///
/// # Panics
///
/// Panics if the TCP listener cannot bind to `addr`.
pub async fn serve(state: Arc<AppState>, addr: SocketAddr) {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind to {addr}: {e}"));
    tracing::info!("API listening on http://{addr}");
    axum::serve(listener, app)
        .await
        .unwrap_or_else(|e| panic!("server error: {e}"));
}
