use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use super::{parse_payload, to_json, DashboardState};
use crate::{auth, sync};

#[derive(Debug, Deserialize)]
struct LoginPayload {
    email: String,
    password: String,
}

#[tauri::command]
pub async fn auth_login(
    arg0: Option<Value>,
    state: tauri::State<'_, DashboardState>,
) -> Result<Value, String> {
    let LoginPayload { email, password } = parse_payload(arg0)?;
    let ctx = state.context()?;
    let info = auth::sign_in(&ctx, &email, &password)
        .await
        .map_err(|e| e.to_string())?;

    if let Err(e) = sync::refresh_all(&ctx).await {
        warn!(error = %e, "initial fetch after login failed");
    }
    // Rejoin realtime channels with the new access token.
    sync::start(&ctx);
    serde_json::to_value(info).map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn auth_logout(state: tauri::State<'_, DashboardState>) -> Result<Value, String> {
    let ctx = state.context()?;
    sync::stop(&ctx);
    to_json(auth::sign_out(&ctx).await.map(|()| serde_json::json!({ "success": true })))
}

#[tauri::command]
pub async fn auth_get_current_session(
    state: tauri::State<'_, DashboardState>,
) -> Result<Value, String> {
    let ctx = state.context()?;
    serde_json::to_value(ctx.auth.current()).map_err(|e| e.to_string())
}
