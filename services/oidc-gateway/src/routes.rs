//! HTTP surface of the gateway
//!
//! - `GET /login`: start a flow, `302` to the provider
//! - `GET /callback`, `POST /callback`: finish a flow from query or form post
//! - `GET /userinfo`: provider claims for the session's access token
//! - `GET /health`, `GET /metrics`

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::extract::{Form, Query, State};
use axum::http::header::{CONTENT_TYPE, LOCATION, SET_COOKIE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use oidc_client::{
    AuthOutcome, AuthorizationResponse, Authenticator, HttpClient, JwtProcessor, ProviderConfig,
    decode_jwt,
};
use serde_json::{Value, json};
use tracing::info;

use crate::error::{Error, Result};
use crate::metrics;
use crate::sessions::{self, SessionStore};

/// Process-lifetime counters for `/health`
#[derive(Debug)]
pub struct Stats {
    pub started_at: Instant,
    pub authenticated: AtomicU64,
    pub redirects: AtomicU64,
    pub failed: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            authenticated: AtomicU64::new(0),
            redirects: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }
}

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub provider: Arc<ProviderConfig>,
    pub jwt: Arc<JwtProcessor>,
    pub http: Arc<HttpClient>,
    pub sessions: SessionStore,
    pub stats: Arc<Stats>,
    pub prometheus: PrometheusHandle,
    /// Mark the session cookie `Secure`
    pub secure_cookies: bool,
}

pub fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/login", get(login_handler))
        .route("/callback", get(callback_query).post(callback_form))
        .route("/userinfo", get(userinfo_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

async fn login_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let started = Instant::now();
    let response = authenticate(&state, &headers, AuthorizationResponse::default()).await;
    metrics::record_duration("login", started.elapsed().as_secs_f64());
    response
}

async fn callback_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<AuthorizationResponse>,
) -> Response {
    let started = Instant::now();
    let response = authenticate(&state, &headers, params).await;
    metrics::record_duration("callback", started.elapsed().as_secs_f64());
    response
}

async fn callback_form(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(params): Form<AuthorizationResponse>,
) -> Response {
    let started = Instant::now();
    let response = authenticate(&state, &headers, params).await;
    metrics::record_duration("callback", started.elapsed().as_secs_f64());
    response
}

/// Run one `authenticate` step for the request's session.
async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    params: AuthorizationResponse,
) -> Response {
    let session_id = sessions::session_id(headers).unwrap_or_else(sessions::new_session_id);
    let cookie = sessions::session_cookie(&session_id, state.secure_cookies);

    let mut response = match run_flow(state, &session_id, &params).await {
        Ok(AuthOutcome::Redirect { url }) => {
            state.stats.redirects.fetch_add(1, Ordering::Relaxed);
            metrics::record_authentication("redirect");
            (StatusCode::FOUND, [(LOCATION, url)]).into_response()
        }
        Ok(AuthOutcome::Authenticated) => {
            state.stats.authenticated.fetch_add(1, Ordering::Relaxed);
            metrics::record_authentication("authenticated");
            match session_summary(state, &session_id).await {
                Ok(summary) => Json(summary).into_response(),
                Err(e) => e.into_response(),
            }
        }
        Err(e) => {
            state.stats.failed.fetch_add(1, Ordering::Relaxed);
            metrics::record_authentication("failed");
            metrics::record_error(e.kind());
            e.into_response()
        }
    };

    if let Ok(value) = cookie.parse() {
        response.headers_mut().insert(SET_COOKIE, value);
    }
    response
}

async fn run_flow(
    state: &AppState,
    session_id: &str,
    params: &AuthorizationResponse,
) -> Result<AuthOutcome> {
    let tokens = state
        .sessions
        .token_manager(session_id)
        .await
        .map_err(oidc_client::Error::from)?;
    let mut authenticator = Authenticator::new(
        state.provider.clone(),
        state.jwt.clone(),
        tokens,
        state.http.clone(),
    );

    let outcome = authenticator.authenticate(params).await?;
    if outcome == AuthOutcome::Authenticated {
        state
            .sessions
            .store_tokens(session_id, authenticator.token_manager())
            .await;
        info!(flow_state = ?authenticator.flow_state(), "session authenticated");
    }
    Ok(outcome)
}

/// Which tokens the session holds, never the tokens themselves.
async fn session_summary(state: &AppState, session_id: &str) -> Result<Value> {
    let manager = state
        .sessions
        .token_manager(session_id)
        .await
        .map_err(oidc_client::Error::from)?;
    let subject = manager
        .id_token()
        .and_then(|token| decode_jwt(token, 1))
        .and_then(|claims| claims.get("sub").cloned())
        .unwrap_or(Value::Null);
    Ok(json!({
        "status": "authenticated",
        "subject": subject,
        "access_token": manager.access_token().is_some(),
        "refresh_token": manager.refresh_token().is_some(),
        "id_token": manager.id_token().is_some(),
    }))
}

async fn userinfo_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let started = Instant::now();
    let result = userinfo(&state, &headers).await;
    metrics::record_duration("userinfo", started.elapsed().as_secs_f64());
    match result {
        Ok(user) => Json(user).into_response(),
        Err(e) => {
            metrics::record_error(e.kind());
            e.into_response()
        }
    }
}

async fn userinfo(state: &AppState, headers: &HeaderMap) -> Result<Value> {
    let session_id = sessions::session_id(headers).ok_or(Error::NotAuthenticated)?;
    if !state.sessions.has_tokens(&session_id).await {
        return Err(Error::NotAuthenticated);
    }
    let tokens = state
        .sessions
        .token_manager(&session_id)
        .await
        .map_err(oidc_client::Error::from)?;
    let authenticator = Authenticator::new(
        state.provider.clone(),
        state.jwt.clone(),
        tokens,
        state.http.clone(),
    );
    let user = authenticator.request_user_info(None, false).await?;
    Ok(user.unwrap_or(Value::Null))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let stats = &state.stats;
    let body = json!({
        "status": "healthy",
        "storage": state.sessions.driver(),
        "sessions": state.sessions.len().await,
        "uptime_seconds": stats.started_at.elapsed().as_secs(),
        "authentications": {
            "authenticated": stats.authenticated.load(Ordering::Relaxed),
            "redirects": stats.redirects.load(Ordering::Relaxed),
            "failed": stats.failed.load(Ordering::Relaxed),
        },
    });
    (StatusCode::OK, Json(body))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}
