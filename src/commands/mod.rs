//! IPC command handlers and the desktop wiring around [`AppContext`].
//!
//! Commands keep the `Result<Value, String>` convention: services return
//! `AppError`, which is converted with `to_string()` here.

pub mod address;
pub mod auth;
pub mod deliveries;
pub mod ledger;
pub mod reports;
pub mod system;

use anyhow::Context as _;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tauri::{AppHandle, Emitter};
use tracing::{info, warn};

use crate::backend::RestBackend;
use crate::config::AppConfig;
use crate::context::AppContext;
use crate::error::{AppError, AppResult};
use crate::events::EventSink;
use crate::models::UserRole;
use crate::{auth as session, db, sync};

/// Forwards service events to the webview.
pub struct TauriEvents {
    app: AppHandle,
}

impl EventSink for TauriEvents {
    fn emit(&self, event: &str, payload: Value) {
        if let Err(e) = self.app.emit(event, payload) {
            warn!(event, error = %e, "event emit failed");
        }
    }
}

/// Managed state. The context is absent until backend credentials exist.
pub struct DashboardState {
    ctx: RwLock<Option<Arc<AppContext>>>,
    pub data_dir: PathBuf,
}

impl DashboardState {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            ctx: RwLock::new(None),
            data_dir,
        }
    }

    pub fn context(&self) -> Result<Arc<AppContext>, String> {
        self.ctx
            .read()
            .map_err(|e| e.to_string())?
            .clone()
            .ok_or_else(|| AppError::NotConfigured("open the setup screen".into()).to_string())
    }

    /// Replace the active context, stopping the loops of the previous one.
    pub fn install(&self, ctx: Arc<AppContext>) {
        match self.ctx.write() {
            Ok(mut slot) => {
                if let Some(old) = slot.replace(ctx) {
                    sync::stop(&old);
                }
            }
            Err(e) => warn!(error = %e, "dashboard state lock poisoned"),
        }
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.ctx.write() {
            if let Some(old) = slot.take() {
                sync::stop(&old);
            }
        }
    }

    /// The context, provided the signed-in user has `role`.
    pub fn with_role(&self, role: UserRole) -> Result<Arc<AppContext>, String> {
        let ctx = self.context()?;
        ctx.auth.require_role(role).map_err(|e| e.to_string())?;
        Ok(ctx)
    }

    pub fn with_session(&self) -> Result<Arc<AppContext>, String> {
        let ctx = self.context()?;
        ctx.auth.require_session().map_err(|e| e.to_string())?;
        Ok(ctx)
    }
}

/// Build a context when configuration is complete. Missing credentials are
/// not an error: the frontend shows the setup screen instead.
pub fn try_build_context(
    app: &AppHandle,
    state: &DashboardState,
) -> anyhow::Result<Option<Arc<AppContext>>> {
    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(AppError::NotConfigured(reason)) => {
            info!(reason = %reason, "backend not configured yet");
            return Ok(None);
        }
        Err(e) => return Err(e).context("loading configuration"),
    };

    let backend = RestBackend::new(&config).context("creating backend client")?;
    let cache = match db::init(&state.data_dir) {
        Ok(cache) => Some(cache),
        Err(e) => {
            warn!(error = %e, "snapshot cache unavailable; continuing without it");
            None
        }
    };
    let events = Arc::new(TauriEvents { app: app.clone() });
    Ok(Some(Arc::new(AppContext::new(
        config,
        Arc::new(backend),
        events,
        cache,
    ))))
}

/// Start-up sequence: cached data, remembered session, first fetch, loops.
pub async fn bootstrap(ctx: Arc<AppContext>) {
    let restored = ctx.restore_from_cache();
    info!(collections = restored, "cached snapshots loaded");

    match session::restore_session(&ctx).await {
        Ok(Some(info)) => {
            info!(email = %info.email, "resuming session");
            if let Err(e) = sync::refresh_all(&ctx).await {
                warn!(error = %e, "initial fetch failed");
            }
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "could not restore session"),
    }
    sync::start(&ctx);
}

pub(crate) fn parse_payload<T: DeserializeOwned>(arg0: Option<Value>) -> Result<T, String> {
    let payload = arg0.ok_or("Missing payload")?;
    serde_json::from_value(payload).map_err(|e| format!("Invalid payload: {e}"))
}

pub(crate) fn to_json<T: Serialize>(result: AppResult<T>) -> Result<Value, String> {
    let value = result.map_err(|e| e.to_string())?;
    serde_json::to_value(value).map_err(|e| e.to_string())
}
