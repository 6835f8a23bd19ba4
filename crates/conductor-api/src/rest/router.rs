//! Axum router configuration

use crate::{
    rest::{handlers, middleware},
    AppState,
};
use axum::{
    http::{header, HeaderValue, Method},
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::{sync::Arc, time::Duration};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    let state = Arc::new(state);

    let api_v1 = Router::new()
        .route("/execute", post(handlers::execute))
        .route("/status/:run_id", get(handlers::get_status))
        .route("/resume/:run_id", post(handlers::resume))
        .route("/cancel/:run_id", post(handlers::cancel))
        .route("/pause/:run_id", post(handlers::pause))
        .route("/unpause/:run_id", post(handlers::unpause))
        .route("/runs", get(handlers::list_runs))
        .route("/templates", get(handlers::list_templates))
        .layer(axum_middleware::from_fn(middleware::request_id_middleware));

    Router::new()
        .nest("/api/v1", api_v1)
        .route("/health", get(handlers::health_check))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Configure CORS layer
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(
            std::env::var("CORS_ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "*".to_string())
                .parse::<HeaderValue>()
                .unwrap_or(HeaderValue::from_static("*")),
        )
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::ACCEPT,
            header::CONTENT_TYPE,
            middleware::REQUEST_ID.clone(),
        ])
        .max_age(Duration::from_secs(3600))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use conductor_workflow::{TemplateStore, WorkflowEngine};
    use tower::ServiceExt;

    fn create_test_state() -> AppState {
        AppState::new(WorkflowEngine::builder().templates(Arc::new(TemplateStore::new())).build())
    }

    #[tokio::test]
    async fn test_health_check_route() {
        let app = create_router(create_test_state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_request_id_is_echoed() {
        let app = create_router(create_test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/templates")
                    .header("x-request-id", "req-42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-request-id"], "req-42");
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let app = create_router(create_test_state());
        let response = app
            .oneshot(Request::builder().uri("/api/v2/execute").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
