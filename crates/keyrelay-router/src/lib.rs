//! HTTP surface: the management API and the client-facing routes.

mod admin;
mod client;
mod error;

use std::sync::Arc;

use axum::Router;
use keyrelay_core::AppState;

pub use admin::admin_router;
pub use client::client_router;
pub use error::{AdminError, ApiError};

/// Management routes under `/v0/management` plus the client routes.
pub fn app_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/v0/management", admin_router(state.clone()))
        .merge(client_router(state))
}
