use serde_json::{json, Value};
use tracing::info;

use super::{to_json, try_build_context, DashboardState};
use crate::{diagnostics, storage, sync};

#[tauri::command]
pub async fn app_get_version() -> Result<Value, String> {
    serde_json::to_value(diagnostics::about_info()).map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn system_health(state: tauri::State<'_, DashboardState>) -> Result<Value, String> {
    let ctx = state.context()?;
    serde_json::to_value(diagnostics::health(&ctx)).map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn setup_is_configured(state: tauri::State<'_, DashboardState>) -> Result<Value, String> {
    Ok(json!({
        "configured": state.context().is_ok(),
        "credentialsStored": storage::is_configured(),
    }))
}

/// Store backend credentials and bring the dashboard up with them.
#[tauri::command]
pub async fn setup_save_credentials(
    arg0: Option<Value>,
    app: tauri::AppHandle,
    state: tauri::State<'_, DashboardState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing payload")?;
    storage::save_backend_credentials(&payload).map_err(|e| e.to_string())?;

    let ctx = try_build_context(&app, &state)
        .map_err(|e| format!("{e:#}"))?
        .ok_or("Backend URL and anon key are required")?;
    ctx.restore_from_cache();
    sync::start(&ctx);
    state.install(ctx);
    info!("backend credentials saved");
    Ok(json!({ "success": true }))
}

#[tauri::command]
pub async fn setup_factory_reset(state: tauri::State<'_, DashboardState>) -> Result<Value, String> {
    if let Ok(ctx) = state.context() {
        crate::auth::sign_out(&ctx).await.map_err(|e| e.to_string())?;
    }
    state.clear();
    storage::factory_reset().map_err(|e| e.to_string())?;
    info!("factory reset complete");
    Ok(json!({ "success": true }))
}

#[tauri::command]
pub async fn sync_get_status(state: tauri::State<'_, DashboardState>) -> Result<Value, String> {
    let ctx = state.context()?;
    serde_json::to_value(sync::status(&ctx)).map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn sync_force(state: tauri::State<'_, DashboardState>) -> Result<Value, String> {
    let ctx = state.with_session()?;
    to_json(sync::refresh_all(&ctx).await.map(|()| sync::status(&ctx)))
}
