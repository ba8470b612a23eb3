//!
//! pillargate HTTP server
//! ----------------------
//! This module defines the Axum-based HTTP API for the pillar dashboard core.
//!
//! Responsibilities:
//! - Session management with an HTTP-only cookie carrying a server-issued token.
//! - The access gate endpoint that 302-redirects authorized callers to a
//!   pillar's verification endpoint.
//! - Admin mutation endpoints (claim sync, permission updates, deletion,
//!   pre-authorization) plus read-only user and audit listings.
//! - The idempotent first-sign-in initializer.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::admin;
use crate::config::{AppConfig, VerifyConfig};
use crate::error::{AppError, AppResult};
use crate::gate;
use crate::identity::{
    extract_bearer_token, DirectoryProvider, HsVerifier, IdentityProvider, JwksVerifier,
    SessionManager, TokenVerifier, VerifiedIdentity,
};
use crate::reconcile::{self, ReconcileOutcome};
use crate::storage::SharedStore;

const SESSION_COOKIE: &str = "pillargate_session";

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub provider: Arc<dyn IdentityProvider>,
    pub verifier: Arc<TokenVerifier>,
    pub sessions: SessionManager,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(config: AppConfig) -> anyhow::Result<AppState> {
        let store = SharedStore::new(&config.data_root)?;
        let provider = Arc::new(DirectoryProvider::new(&config.data_root)?);
        let verifier = Arc::new(build_verifier(&config)?);
        let sessions = SessionManager::with_ttl(config.session_ttl);
        Ok(AppState { store, provider, verifier, sessions, config: Arc::new(config) })
    }
}

fn build_verifier(config: &AppConfig) -> anyhow::Result<TokenVerifier> {
    Ok(match &config.verify {
        VerifyConfig::Hs { secret, issuer, audience } => {
            if config.production {
                warn!("HS256 token mode in a production runtime; expected JWKS");
            }
            TokenVerifier::Hs(HsVerifier::new(secret.clone(), issuer.clone(), audience.clone()))
        }
        VerifyConfig::Jwks { issuer, jwks_url, audiences } => TokenVerifier::Jwks(JwksVerifier::new(
            issuer.clone(),
            jwks_url.clone(),
            audiences.clone(),
        )?),
    })
}

/// Start the pillargate HTTP server with configuration from the environment.
pub async fn run() -> anyhow::Result<()> {
    run_with_config(AppConfig::from_env()).await
}

pub async fn run_with_config(config: AppConfig) -> anyhow::Result<()> {
    info!(
        target: "startup",
        production = config.production,
        data_root = %config.data_root,
        pillars_configured = config.configured_pillar_count(),
        "pillargate starting"
    );
    let http_port = config.http_port;
    let state = AppState::new(config)?;
    let app = router(state);

    let addr: SocketAddr = format!("0.0.0.0:{}", http_port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "pillargate ok" }))
        .route("/pillar/{id}", get(pillar_redirect))
        .route("/auth/session", post(create_session).delete(end_session))
        .route("/auth/initialize-user", post(initialize_user))
        .route("/admin/set-admin-claim", post(set_admin_claim))
        .route("/admin/update-permissions", post(update_permissions))
        .route("/admin/delete-user", delete(delete_user))
        .route("/admin/preauthorize", post(preauthorize))
        .route("/admin/users", get(list_users))
        .route("/admin/audit-log", get(audit_log))
        .with_state(state)
}

// --- cookie helpers ---

fn parse_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookie = headers.get("cookie").or_else(|| headers.get("Cookie"))?;
    let s = cookie.to_str().ok()?;
    for part in s.split(';') {
        let p = part.trim();
        if let Some(eq) = p.find('=') {
            let (k, v) = p.split_at(eq);
            if k == name {
                return Some(v[1..].to_string());
            }
        }
    }
    None
}

fn set_session_cookie(token: &str, max_age_secs: u64, production: bool) -> HeaderValue {
    // SameSite=Lax so the cross-site pillar redirect flow keeps the cookie;
    // Secure only in production so local HTTP development works.
    let secure = if production { "; Secure" } else { "" };
    HeaderValue::from_str(&format!(
        "{}={}; HttpOnly{}; SameSite=Lax; Path=/; Max-Age={}",
        SESSION_COOKIE, token, secure, max_age_secs
    ))
    .unwrap()
}

fn clear_session_cookie(production: bool) -> HeaderValue {
    let secure = if production { "; Secure" } else { "" };
    HeaderValue::from_str(&format!(
        "{}=deleted; Expires=Thu, 01 Jan 1970 00:00:00 GMT; HttpOnly{}; SameSite=Lax; Path=/",
        SESSION_COOKIE, secure
    ))
    .unwrap()
}

fn fail(e: &AppError) -> (StatusCode, Json<serde_json::Value>) {
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({"status": "error", "error": e.code_str(), "message": e.message()})))
}

/// Bearer token from the Authorization header, falling back to the session
/// cookie's pinned provider token.
fn caller_token(state: &AppState, headers: &HeaderMap) -> Option<String> {
    if let Some(t) = extract_bearer_token(headers) {
        return Some(t.to_string());
    }
    let sid = parse_cookie(headers, SESSION_COOKIE)?;
    state.sessions.validate(&sid).map(|s| s.id_token)
}

/// Authenticate the caller of a privileged endpoint; verification failures
/// are logged server-side and surfaced as a generic 401.
async fn authenticate_caller(state: &AppState, headers: &HeaderMap) -> AppResult<VerifiedIdentity> {
    let Some(token) = caller_token(state, headers) else {
        return Err(AppError::unauthenticated("missing_token", "authentication required"));
    };
    state.verifier.verify(&token).await.map_err(|e| {
        warn!(error = %e, "caller token verification failed");
        AppError::unauthenticated("invalid_token", "authentication token is invalid or expired")
    })
}

// --- access gate ---

async fn pillar_redirect(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> axum::response::Response {
    let token = caller_token(&state, &headers);
    match gate::resolve_pillar_redirect(&state.store, &state.verifier, &state.config, &id, token.as_deref()).await {
        Ok(redirect) => {
            info!(
                uid = %redirect.identity.uid,
                email = redirect.identity.email.as_deref().unwrap_or(""),
                pillar = redirect.pillar.number(),
                via_admin = redirect.via_admin,
                target = %redirect.logged_target,
                "pillar access granted"
            );
            (
                StatusCode::FOUND,
                [(axum::http::header::LOCATION, HeaderValue::from_str(&redirect.location).unwrap())],
            )
                .into_response()
        }
        Err(e) => fail(&e).into_response(),
    }
}

// --- auth/session ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionPayload {
    id_token: String,
}

async fn create_session(
    State(state): State<AppState>,
    Json(payload): Json<SessionPayload>,
) -> impl IntoResponse {
    let identity = match state.verifier.verify(&payload.id_token).await {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "session token verification failed");
            return fail(&AppError::unauthenticated("invalid_token", "authentication token is invalid or expired"))
                .into_response();
        }
    };

    if let Err(e) = state.provider.upsert_account(&identity.uid, identity.email.as_deref()) {
        error!(error = %e, "provider account upsert failed");
        return fail(&AppError::from(e)).into_response();
    }

    // Account-creation trigger equivalent: provision the permission record on
    // first sign-in. Identities without an email are initialized later.
    if let Some(email) = identity.email.as_deref() {
        if let Err(e) = reconcile::reconcile_new_user(&state.store, &identity.uid, email) {
            error!(error = %e, "permission record provisioning failed");
            return fail(&AppError::from(e)).into_response();
        }
    }

    let sess = state.sessions.issue(&identity.uid, identity.email.as_deref(), &payload.id_token);
    let mut headers = HeaderMap::new();
    headers.insert(
        "Set-Cookie",
        set_session_cookie(&sess.token, state.config.session_ttl.as_secs(), state.config.production),
    );
    (StatusCode::OK, headers, Json(json!({"status": "ok", "uid": identity.uid}))).into_response()
}

async fn end_session(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if let Some(sid) = parse_cookie(&headers, SESSION_COOKIE) {
        state.sessions.logout(&sid);
    }
    let mut h = HeaderMap::new();
    h.insert("Set-Cookie", clear_session_cookie(state.config.production));
    (StatusCode::OK, h, Json(json!({"status": "ok"})))
}

async fn initialize_user(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let Some(sid) = parse_cookie(&headers, SESSION_COOKIE) else {
        return fail(&AppError::unauthenticated("missing_session", "a session cookie is required"));
    };
    let Some(sess) = state.sessions.validate(&sid) else {
        return fail(&AppError::unauthenticated("session_invalid", "session is missing or expired"));
    };
    let Some(email) = sess.email.as_deref() else {
        return fail(&AppError::invalid(
            "email_required",
            "the signed-in account has no email; contact an administrator",
        ));
    };
    match reconcile::reconcile_new_user(&state.store, &sess.uid, email) {
        Ok(outcome) => {
            let message = match outcome {
                ReconcileOutcome::AlreadyProvisioned => "permission record already exists",
                ReconcileOutcome::MigratedPending => "pre-authorized permissions applied",
                ReconcileOutcome::CreatedDefault => "permission record created",
            };
            (StatusCode::OK, Json(json!({"success": true, "message": message})))
        }
        Err(e) => {
            error!(error = %e, "initialize-user provisioning failed");
            fail(&AppError::from(e))
        }
    }
}

// --- admin mutations ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetClaimPayload {
    user_id: String,
    is_admin: bool,
}

async fn set_admin_claim(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SetClaimPayload>,
) -> impl IntoResponse {
    let caller = match authenticate_caller(&state, &headers).await {
        Ok(c) => c,
        Err(e) => return fail(&e),
    };
    match admin::set_admin_claim(&state.store, state.provider.as_ref(), &caller, &payload.user_id, payload.is_admin) {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": format!("admin claim set to {}", payload.is_admin)
            })),
        ),
        Err(e) => fail(&e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdatePermissionsPayload {
    user_id: String,
    pillars: serde_json::Map<String, serde_json::Value>,
}

async fn update_permissions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<UpdatePermissionsPayload>,
) -> impl IntoResponse {
    let caller = match authenticate_caller(&state, &headers).await {
        Ok(c) => c,
        Err(e) => return fail(&e),
    };
    match admin::update_pillars(&state.store, &caller, &payload.user_id, &payload.pillars) {
        Ok(merged) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": format!("permissions updated; {} pillars granted", merged.granted_count())
            })),
        ),
        Err(e) => fail(&e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteUserPayload {
    user_id: String,
}

async fn delete_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<DeleteUserPayload>,
) -> impl IntoResponse {
    let caller = match authenticate_caller(&state, &headers).await {
        Ok(c) => c,
        Err(e) => return fail(&e),
    };
    match admin::delete_user(&state.store, state.provider.as_ref(), &state.sessions, &caller, &payload.user_id) {
        Ok(email) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "deletedUserId": payload.user_id,
                "deletedUserEmail": email
            })),
        ),
        Err(e) => fail(&e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreauthorizePayload {
    email: String,
    #[serde(default)]
    is_admin: bool,
    #[serde(default)]
    pillars: Option<serde_json::Map<String, serde_json::Value>>,
}

async fn preauthorize(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<PreauthorizePayload>,
) -> impl IntoResponse {
    let caller = match authenticate_caller(&state, &headers).await {
        Ok(c) => c,
        Err(e) => return fail(&e),
    };
    if let Err(e) = admin::require_admin(&state.store, &caller) {
        return fail(&e);
    }
    match reconcile::preauthorize(&state.store, &payload.email, payload.is_admin, payload.pillars.as_ref()) {
        Ok(stub) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": format!("pre-authorized {} for {} pillars", stub.email, stub.pillars.granted_count())
            })),
        ),
        Err(e) => fail(&e),
    }
}

// --- admin read surface ---

async fn list_users(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let caller = match authenticate_caller(&state, &headers).await {
        Ok(c) => c,
        Err(e) => return fail(&e),
    };
    if let Err(e) = admin::require_admin(&state.store, &caller) {
        return fail(&e);
    }
    match state.store.0.lock().list_records() {
        Ok(users) => (StatusCode::OK, Json(json!({"status": "ok", "users": users}))),
        Err(e) => {
            error!(error = %e, "user listing failed");
            fail(&AppError::from(e))
        }
    }
}

async fn audit_log(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let caller = match authenticate_caller(&state, &headers).await {
        Ok(c) => c,
        Err(e) => return fail(&e),
    };
    if let Err(e) = admin::require_admin(&state.store, &caller) {
        return fail(&e);
    }
    match state.store.0.lock().list_audit() {
        Ok(entries) => (StatusCode::OK, Json(json!({"status": "ok", "entries": entries}))),
        Err(e) => {
            error!(error = %e, "audit listing failed");
            fail(&AppError::from(e))
        }
    }
}
