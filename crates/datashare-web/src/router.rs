use std::sync::Arc;

use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware,
    routing::get,
};
use datashare_batch::{BatchSearchRepository, QueueSignal};
use datashare_common::error::Result;
use datashare_session::SessionStore;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::{handlers, middleware::resolve_user, types::WebConfig};

pub struct WebState {
    pub repository: Arc<dyn BatchSearchRepository>,
    pub sessions: Arc<dyn SessionStore>,
    pub signal: QueueSignal,
    pub config: WebConfig,
}

impl WebState {
    pub fn new(
        repository: Arc<dyn BatchSearchRepository>,
        sessions: Arc<dyn SessionStore>,
        signal: QueueSignal,
        config: WebConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            repository,
            sessions,
            signal,
            config,
        })
    }
}

pub fn api_router(state: Arc<WebState>) -> Router {
    let batch_routes = Router::new()
        .route("/api/batch/search", get(handlers::batch::list_batch_searches))
        // POST takes a project name in the same position as the batch id.
        .route(
            "/api/batch/search/{id}",
            get(handlers::batch::get_batch_search)
                .post(handlers::batch::submit_batch_search)
                .delete(handlers::batch::delete_batch_search),
        )
        .route(
            "/api/batch/search/result/{id}",
            get(handlers::batch::get_batch_search_results),
        )
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            resolve_user,
        ));

    let cors = state.config.cors_allow_origin.as_deref().and_then(cors_layer);
    let router = Router::new()
        .route("/api/health", get(handlers::health::health))
        .merge(batch_routes);
    let router = match cors {
        Some(cors) => router.layer(cors),
        None => router,
    };
    router.layer(TraceLayer::new_for_http()).with_state(state)
}

fn cors_layer(origin: &str) -> Option<CorsLayer> {
    let allow_origin = if origin == "*" {
        AllowOrigin::any()
    } else {
        AllowOrigin::exact(HeaderValue::from_str(origin).ok()?)
    };
    Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]),
    )
}
