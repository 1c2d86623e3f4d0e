//! Bella Flor dashboard - Tauri v2 backend
//!
//! Sales, commission and delivery tracking for a small flower shop. The
//! library holds every service (backend clients, the delivery reconciler,
//! aggregates, exports) and builds without the desktop shell; the `desktop`
//! feature adds the Tauri window and the IPC commands the frontend calls
//! via `@tauri-apps/api/core::invoke()`.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod address;
pub mod auth;
pub mod backend;
pub mod config;
pub mod context;
pub mod db;
pub mod deliveries;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod insights;
pub mod models;
pub mod money;
pub mod payments;
pub mod reconcile;
pub mod report;
pub mod sales;
pub mod stats;
pub mod storage;
pub mod store;
pub mod sync;

#[cfg(feature = "desktop")]
mod commands;

#[cfg(test)]
mod test_support;

const DEFAULT_LOG_FILTER: &str = "info,bellaflor_dashboard_lib=debug";

/// Initialize structured logging (console + daily rolling file).
///
/// The returned guard flushes the file writer when dropped. Returns `None`
/// when a global subscriber is already installed.
pub fn init_tracing() -> Option<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    // Prune old log files before setting up the appender
    diagnostics::prune_old_logs();

    let log_dir = diagnostics::log_dir();
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok()?;
    Some(guard)
}

// ============================================================================
// App entry point
// ============================================================================

#[cfg(feature = "desktop")]
pub fn run() {
    // Keep the guard alive for the lifetime of the app; dropping it flushes logs.
    if let Some(guard) = init_tracing() {
        std::mem::forget(guard);
    }

    tracing::info!("Starting Bella Flor dashboard v{}", env!("CARGO_PKG_VERSION"));

    tauri::Builder::default()
        .setup(|app| {
            use tauri::Manager;

            let app_data_dir = app.path().app_data_dir()?;
            let state = commands::DashboardState::new(app_data_dir);
            if let Some(ctx) = commands::try_build_context(app.handle(), &state)? {
                let boot = ctx.clone();
                tauri::async_runtime::spawn(async move { commands::bootstrap(boot).await });
                state.install(ctx);
            }
            app.manage(state);
            tracing::info!("Dashboard state registered");
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            // System
            commands::system::app_get_version,
            commands::system::system_health,
            commands::system::setup_is_configured,
            commands::system::setup_save_credentials,
            commands::system::setup_factory_reset,
            commands::system::sync_get_status,
            commands::system::sync_force,
            // Auth
            commands::auth::auth_login,
            commands::auth::auth_logout,
            commands::auth::auth_get_current_session,
            // Sales and payments
            commands::ledger::sales_list,
            commands::ledger::sales_add,
            commands::ledger::sales_update,
            commands::ledger::sales_delete,
            commands::ledger::payments_list,
            commands::ledger::payments_add,
            commands::ledger::payments_delete,
            commands::ledger::dashboard_get_stats,
            commands::ledger::sales_grouped_by_month,
            // Deliveries
            commands::deliveries::deliveries_list,
            commands::deliveries::deliveries_start,
            commands::deliveries::deliveries_confirm,
            commands::deliveries::deliveries_cancel,
            commands::deliveries::driver_get_summary,
            // Address lookup
            commands::address::address_search,
            commands::address::address_describe,
            commands::address::address_open_directions,
            // Reports
            commands::reports::report_available_months,
            commands::reports::report_generate_monthly,
            commands::reports::report_export_csv,
            commands::reports::insights_generate,
        ])
        .run(tauri::generate_context!())
        .expect("error while running Bella Flor dashboard");
}
