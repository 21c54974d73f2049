//! Admin JSON API, served on its own listener behind bearer auth.

pub mod auth;
pub mod handlers;

use axum::{
    middleware,
    routing::{get, put},
    Router,
};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::http::server::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/instances", get(get_instances))
        .route("/admin/scaling", get(get_scaling))
        .route("/admin/limiter", get(get_limiter))
        .route("/admin/strategy", put(put_strategy))
        .route("/admin/utilization", put(put_utilization))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}
