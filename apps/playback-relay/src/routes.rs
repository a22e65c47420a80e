use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info};

use crate::{engine::Engine, error::AuthError, websocket::websocket_handler};

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub metrics: Option<PrometheusHandle>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(users_handler))
        .route("/login", get(login_handler))
        .route("/redirect", get(redirect_handler))
        .route("/ws", get(websocket_handler))
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
}

async fn login_handler(State(state): State<AppState>) -> Response {
    info!(http = "/login");
    match state.engine.begin_authorization() {
        Ok(authorization) => {
            debug!(state = %authorization.state, "authorization redirect issued");
            Redirect::to(&authorization.url).into_response()
        }
        Err(err) => {
            error!(error = %err, "cannot start authorization");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

async fn redirect_handler(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    info!(http = "/redirect");
    let code = query.code.unwrap_or_default();
    let auth_state = query.state.unwrap_or_default();
    match state.engine.complete_authorization(&code, &auth_state).await {
        Ok(_) => Redirect::to(&format!("/?b={}", Utc::now().timestamp_millis())).into_response(),
        Err(err @ (AuthError::Forbidden | AuthError::TokenExchangeFailed(_))) => {
            (StatusCode::FORBIDDEN, err.to_string()).into_response()
        }
        Err(err) => (StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
    }
}

async fn users_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!(http = "/");
    Json(json!({ "users": state.engine.profiles().await }))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::engine::EngineSettings;
    use crate::upstream::fake::FakeUpstream;

    use super::*;

    fn app(upstream: Arc<FakeUpstream>) -> (Engine, Router) {
        let engine = Engine::new(upstream, None, EngineSettings::default());
        let router = router(AppState {
            engine: engine.clone(),
            metrics: None,
        });
        (engine, router)
    }

    async fn get(router: &Router, uri: &str) -> Response {
        router
            .clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn location(response: &Response) -> String {
        response.headers()[header::LOCATION].to_str().unwrap().to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn login_then_redirect_creates_session() {
        let upstream = Arc::new(FakeUpstream::new());
        let (engine, router) = app(upstream);

        let login = get(&router, "/login").await;
        assert_eq!(login.status(), StatusCode::SEE_OTHER);
        let target = location(&login);
        let state = target.split("state=").nth(1).unwrap().to_string();

        let callback = get(&router, &format!("/redirect?code=user123&state={state}")).await;
        assert_eq!(callback.status(), StatusCode::SEE_OTHER);
        assert!(location(&callback).starts_with("/?b="));

        let users = get(&router, "/").await;
        assert_eq!(users.status(), StatusCode::OK);
        let users: Value = serde_json::from_str(&body_text(users).await).unwrap();
        assert_eq!(
            users,
            json!({"users": [{"uri": "user123", "display_name": "user123"}]})
        );
        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_state_is_forbidden() {
        let upstream = Arc::new(FakeUpstream::new());
        let (engine, router) = app(upstream);

        let response = get(&router, "/redirect?code=user123&state=forged").await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_text(response).await, "Forbidden");
        assert!(engine.sessions().is_empty());

        let response = get(&router, "/redirect?code=user123").await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_code_returns_upstream_message() {
        let upstream = Arc::new(FakeUpstream::new());
        *upstream.reject_exchange.lock() = true;
        let (_, router) = app(upstream);

        let login = get(&router, "/login").await;
        let state = location(&login).split("state=").nth(1).unwrap().to_string();
        let response = get(&router, &format!("/redirect?code=bad&state={state}")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_text(response).await, "Bad Request (400)");
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (_, router) = app(Arc::new(FakeUpstream::new()));
        let response = get(&router, "/healthz").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, r#"{"status":"ok"}"#);
    }
}
