use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

mod flags;
mod health;

pub use health::health;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    let flag_router = Router::new()
        .route("/", post(flags::routes::create))
        .route(
            "/{flag_id}",
            get(flags::routes::get).delete(flags::routes::delete),
        )
        .route("/{flag_id}/default", put(flags::routes::set_default))
        .route("/{flag_id}/rule-chains", post(flags::routes::add_rule_chain))
        .route("/{flag_id}/check", post(flags::routes::check));

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .nest("/api/flags", flag_router)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn root() -> &'static str {
    "Feature flag service"
}
