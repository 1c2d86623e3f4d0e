use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::{parse_payload, to_json, DashboardState};
use crate::insights::InsightsClient;
use crate::models::UserRole;
use crate::report;

const EXPORT_DIR: &str = "exports";

#[derive(Debug, Deserialize)]
struct MonthPayload {
    month: String,
}

#[tauri::command]
pub async fn report_available_months(
    state: tauri::State<'_, DashboardState>,
) -> Result<Value, String> {
    let ctx = state.with_role(UserRole::Admin)?;
    to_json(ctx.with_store(|s| report::available_months(s.sales.rows())))
}

/// Write the printable report for one month and return its path.
#[tauri::command]
pub async fn report_generate_monthly(
    arg0: Option<Value>,
    state: tauri::State<'_, DashboardState>,
) -> Result<Value, String> {
    let ctx = state.with_role(UserRole::Admin)?;
    let MonthPayload { month } = parse_payload(arg0)?;
    let sales = ctx
        .with_store(|s| s.sales.rows().to_vec())
        .map_err(|e| e.to_string())?;
    let built = report::build_report(&sales, &month, ctx.config.report_rows_per_page)
        .map_err(|e| e.to_string())?;
    let path = report::write_report(&state.data_dir.join(EXPORT_DIR), &built)
        .map_err(|e| e.to_string())?;
    Ok(json!({
        "path": path.to_string_lossy(),
        "pages": built.pages.len(),
        "totals": built.totals,
    }))
}

#[tauri::command]
pub async fn report_export_csv(state: tauri::State<'_, DashboardState>) -> Result<Value, String> {
    let ctx = state.with_role(UserRole::Admin)?;
    let (sales, payments) = ctx
        .with_store(|s| (s.sales.rows().to_vec(), s.payments.rows().to_vec()))
        .map_err(|e| e.to_string())?;
    to_json(
        report::write_csv(&state.data_dir.join(EXPORT_DIR), &sales, &payments)
            .map(|path| json!({ "path": path.to_string_lossy() })),
    )
}

#[tauri::command]
pub async fn insights_generate(state: tauri::State<'_, DashboardState>) -> Result<Value, String> {
    let ctx = state.with_role(UserRole::Admin)?;
    let client = InsightsClient::new(&ctx.config).map_err(|e| e.to_string())?;
    let sales = ctx
        .with_store(|s| s.sales.rows().to_vec())
        .map_err(|e| e.to_string())?;
    let html = client.analyze(&sales).await.map_err(|e| e.to_string())?;
    info!(chars = html.len(), "insights ready");
    Ok(json!({ "html": html }))
}
