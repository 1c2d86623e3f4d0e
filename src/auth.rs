//! Email/password sign-in against the hosted identity service.
//!
//! A session carries the user's email, resolved role and the bearer token
//! used for row-level security. The role comes from the configured
//! email -> role table first, then from the profile's `user_metadata.role`;
//! a user with neither is signed out again and rejected. The refresh token is
//! kept in the OS credential store so the session survives restarts.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::backend::rest::{error_from_response, friendly_error};
use crate::context::AppContext;
use crate::error::{AppError, AppResult};
use crate::events;
use crate::models::UserRole;
use crate::storage;

/// Refresh this long before the access token expires.
const REFRESH_MARGIN_SECS: i64 = 120;
const DEFAULT_SESSION_SECS: i64 = 3600;
const AUTH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(20);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Session {
    user_id: String,
    email: String,
    role: UserRole,
    access_token: Zeroizing<String>,
    refresh_token: Zeroizing<String>,
    expires_at: DateTime<Utc>,
}

impl Session {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            user_id: self.user_id.clone(),
            email: self.email.clone(),
            role: self.role,
            expires_at: self.expires_at,
        }
    }
}

/// What the frontend sees of the current session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub user_id: String,
    pub email: String,
    pub role: UserRole,
    pub expires_at: DateTime<Utc>,
}

pub struct AuthState {
    session: RwLock<Option<Session>>,
    /// Whether sessions are written to the credential store.
    remember: bool,
}

impl Default for AuthState {
    fn default() -> Self {
        Self::new(true)
    }
}

impl AuthState {
    pub fn new(remember: bool) -> Self {
        Self {
            session: RwLock::new(None),
            remember,
        }
    }

    fn read<R>(&self, f: impl FnOnce(&Session) -> R) -> Option<R> {
        self.session.read().ok()?.as_ref().map(f)
    }

    fn replace(&self, session: Option<Session>) {
        match self.session.write() {
            Ok(mut slot) => *slot = session,
            Err(e) => warn!(error = %e, "session lock poisoned"),
        }
    }

    pub fn current(&self) -> Option<SessionInfo> {
        self.read(Session::info)
    }

    pub fn email(&self) -> Option<String> {
        self.read(|s| s.email.clone())
    }

    pub fn access_token(&self) -> Option<String> {
        self.read(|s| s.access_token.to_string())
    }

    /// The current session, provided it has `role`.
    pub fn require_role(&self, role: UserRole) -> AppResult<SessionInfo> {
        match self.current() {
            Some(info) if info.role == role => Ok(info),
            Some(_) => Err(AppError::Unauthorized(
                "Esta área não está disponível para o seu perfil.".into(),
            )),
            None => Err(AppError::Unauthorized("Faça login para continuar.".into())),
        }
    }

    /// The current session, whatever its role.
    pub fn require_session(&self) -> AppResult<SessionInfo> {
        self.current()
            .ok_or_else(|| AppError::Unauthorized("Faça login para continuar.".into()))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: AuthUser,
}

#[derive(Debug, Deserialize)]
struct AuthUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    user_metadata: Value,
}

// ---------------------------------------------------------------------------
// Role and token helpers
// ---------------------------------------------------------------------------

/// Resolve the role for `email`: static table first, then profile metadata.
pub fn resolve_role(
    email: &str,
    user_metadata: &Value,
    table: &HashMap<String, UserRole>,
) -> Option<UserRole> {
    if let Some(role) = table.get(&email.trim().to_lowercase()) {
        return Some(*role);
    }
    user_metadata
        .get("role")
        .and_then(Value::as_str)
        .and_then(UserRole::parse)
}

/// `exp` claim of a JWT, without verifying the signature.
pub fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Value = serde_json::from_slice(&decoded).ok()?;
    let exp = claims.get("exp").and_then(Value::as_i64)?;
    DateTime::from_timestamp(exp, 0)
}

fn expiry_of(resp: &TokenResponse, now: DateTime<Utc>) -> DateTime<Utc> {
    resp.expires_at
        .and_then(|at| DateTime::from_timestamp(at, 0))
        .or_else(|| resp.expires_in.map(|secs| now + Duration::seconds(secs)))
        .or_else(|| token_expiry(&resp.access_token))
        .unwrap_or_else(|| now + Duration::seconds(DEFAULT_SESSION_SECS))
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

fn client() -> AppResult<Client> {
    Client::builder()
        .timeout(AUTH_TIMEOUT)
        .build()
        .map_err(|e| AppError::Network(format!("Failed to create HTTP client: {e}")))
}

async fn token_request(ctx: &AppContext, grant_type: &str, body: Value) -> AppResult<TokenResponse> {
    let base = &ctx.config.supabase_url;
    let url = format!("{base}/auth/v1/token");
    let resp = client()?
        .post(&url)
        .query(&[("grant_type", grant_type)])
        .header("apikey", ctx.config.supabase_anon_key.as_str())
        .json(&body)
        .send()
        .await
        .map_err(|e| AppError::Network(friendly_error(base, &e)))?;

    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(match error_from_response(status, &text) {
            AppError::Remote { status: 400, message } => AppError::Unauthorized(message),
            other => other,
        });
    }
    Ok(serde_json::from_str(&text)?)
}

async fn logout_request(ctx: &AppContext, access_token: &str) -> AppResult<()> {
    let base = &ctx.config.supabase_url;
    let resp = client()?
        .post(format!("{base}/auth/v1/logout"))
        .header("apikey", ctx.config.supabase_anon_key.as_str())
        .header("Authorization", format!("Bearer {access_token}"))
        .send()
        .await
        .map_err(|e| AppError::Network(friendly_error(base, &e)))?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(error_from_response(status, &text));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

/// Turn a token response into the active session.
async fn install(ctx: &AppContext, resp: TokenResponse, fallback_email: &str) -> AppResult<SessionInfo> {
    let email = resp
        .user
        .email
        .clone()
        .unwrap_or_else(|| fallback_email.to_string())
        .trim()
        .to_lowercase();

    let Some(role) = resolve_role(&email, &resp.user.user_metadata, &ctx.config.role_table) else {
        warn!(email = %email, "signed-in user has no role; signing out");
        if let Err(e) = logout_request(ctx, &resp.access_token).await {
            warn!(error = %e, "logout of role-less user failed");
        }
        return Err(AppError::Unauthorized(
            "Usuário sem perfil de acesso configurado.".into(),
        ));
    };

    let session = Session {
        user_id: resp.user.id.clone(),
        email,
        role,
        expires_at: expiry_of(&resp, Utc::now()),
        access_token: Zeroizing::new(resp.access_token),
        refresh_token: Zeroizing::new(resp.refresh_token),
    };

    if ctx.auth.remember {
        if let Err(e) = storage::save_session(&session.email, &session.refresh_token) {
            warn!(error = %e, "could not remember session in credential store");
        }
    }
    ctx.backend
        .set_access_token(Some(session.access_token.to_string()));
    let info = session.info();
    ctx.auth.replace(Some(session));
    ctx.events.emit(events::SESSION_CHANGED, json!(info));
    Ok(info)
}

pub async fn sign_in(ctx: &AppContext, email: &str, password: &str) -> AppResult<SessionInfo> {
    let email = email.trim();
    if email.is_empty() || password.is_empty() {
        return Err(AppError::Validation("Informe e-mail e senha.".into()));
    }
    let password = Zeroizing::new(password.to_string());
    let resp = token_request(
        ctx,
        "password",
        json!({ "email": email, "password": password.as_str() }),
    )
    .await?;
    let info = install(ctx, resp, email).await?;
    info!(email = %info.email, role = ?info.role, "signed in");
    Ok(info)
}

async fn refresh_with(ctx: &AppContext, refresh_token: &str, email: &str) -> AppResult<SessionInfo> {
    let resp = token_request(
        ctx,
        "refresh_token",
        json!({ "refresh_token": refresh_token }),
    )
    .await?;
    install(ctx, resp, email).await
}

/// Exchange the current refresh token for a new access token.
pub async fn refresh(ctx: &AppContext) -> AppResult<SessionInfo> {
    let (token, email) = ctx
        .auth
        .read(|s| (s.refresh_token.clone(), s.email.clone()))
        .ok_or_else(|| AppError::Unauthorized("Faça login para continuar.".into()))?;
    refresh_with(ctx, &token, &email).await
}

/// Refresh when the access token is within two minutes of expiring.
pub async fn refresh_if_expiring(ctx: &AppContext) -> AppResult<bool> {
    let due = ctx
        .auth
        .read(|s| s.expires_at - Duration::seconds(REFRESH_MARGIN_SECS) <= Utc::now())
        .unwrap_or(false);
    if !due {
        return Ok(false);
    }
    refresh(ctx).await?;
    info!("access token refreshed");
    Ok(true)
}

/// Restore the last remembered session. A rejected refresh token is
/// forgotten; network failures keep it for the next start.
pub async fn restore_session(ctx: &AppContext) -> AppResult<Option<SessionInfo>> {
    if !ctx.auth.remember {
        return Ok(None);
    }
    let Some((email, token)) = storage::load_session() else {
        return Ok(None);
    };
    match refresh_with(ctx, &token, &email).await {
        Ok(info) => {
            info!(email = %info.email, "session restored");
            Ok(Some(info))
        }
        Err(err @ AppError::Unauthorized(_)) => {
            warn!(error = %err, "remembered session rejected; clearing");
            if let Err(e) = storage::clear_session() {
                warn!(error = %e, "could not clear remembered session");
            }
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// End the session locally and on the identity service. Local state is
/// cleared even when the remote call fails.
pub async fn sign_out(ctx: &AppContext) -> AppResult<()> {
    let token = ctx.auth.access_token();
    ctx.auth.replace(None);
    ctx.backend.set_access_token(None);
    if ctx.auth.remember {
        if let Err(e) = storage::clear_session() {
            warn!(error = %e, "could not clear remembered session");
        }
    }
    ctx.with_store(|s| s.clear())?;
    if let Some(cache) = ctx.cache.as_ref() {
        if let Err(e) = crate::db::clear_snapshots(cache) {
            warn!(error = %e, "could not clear cached snapshots");
        }
    }
    ctx.events.emit(events::SESSION_CHANGED, Value::Null);

    if let Some(token) = token {
        if let Err(e) = logout_request(ctx, &token).await {
            warn!(error = %e, "remote logout failed");
        }
    }
    info!("signed out");
    Ok(())
}
