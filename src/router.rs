use std::sync::Arc;

use axum::{
    Router,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::{
    AppState,
    governance::GovernanceService,
    middleware::{admission, idempotency, log_errors},
    routes,
};

/// 给路由加上治理中间件
///
/// 幂等层在外：重放的请求不再经过准入，也不消耗 token 预算。
pub fn governed<S>(router: Router<S>, governance: Arc<GovernanceService>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router
        .route_layer(from_fn_with_state(governance.clone(), admission))
        .route_layer(from_fn_with_state(governance, idempotency))
}

// 创建主路由
pub fn create_router(state: AppState) -> Router {
    // AI 路由，需要经过治理层
    let ai_routes = governed(
        Router::new().route("/ai/chat", post(routes::ai::chat_completion)),
        state.governance.clone(),
    );

    // axum 不允许在根路径 nest
    let base = state.config.api_base_uri.trim_end_matches('/');
    let router = if base.is_empty() {
        Router::new().merge(ai_routes)
    } else {
        Router::new().nest(base, ai_routes)
    };

    router
        .route("/health", get(routes::governance::health))
        .route("/governance/stats", get(routes::governance::stats))
        .layer(from_fn(log_errors))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
