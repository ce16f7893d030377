use axum::{
    Router,
    routing::{delete, get, post},
};

use super::*;

pub(super) fn build_internal_router() -> Router<AppState> {
    let router = Router::<AppState>::new();
    let router = add_health_routes(router);
    let router = add_openai_routes(router);
    add_bridge_routes(router)
}

fn add_health_routes(router: Router<AppState>) -> Router<AppState> {
    router.route("/health", get(health))
}

fn add_openai_routes(router: Router<AppState>) -> Router<AppState> {
    router
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
}

fn add_bridge_routes(router: Router<AppState>) -> Router<AppState> {
    router
        .route("/v1/bridge/conversations", get(list_conversations))
        .route("/v1/bridge/sessions/{slot}", delete(delete_session_binding))
}
