use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_payload, to_json, DashboardState};
use crate::models::{StaffMember, UserRole};
use crate::sales::SaleInput;
use crate::{payments, sales, stats};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaleUpdatePayload {
    id: i64,
    value: f64,
    #[serde(default)]
    delivery_fee: f64,
    justification: String,
}

#[derive(Debug, Deserialize)]
struct PaymentPayload {
    person: String,
    date: NaiveDate,
    value: f64,
}

#[derive(Debug, Deserialize)]
struct IdPayload {
    id: i64,
}

#[tauri::command]
pub async fn sales_list(state: tauri::State<'_, DashboardState>) -> Result<Value, String> {
    let ctx = state.with_role(UserRole::Admin)?;
    to_json(ctx.with_store(|s| s.sales.rows().to_vec()))
}

#[tauri::command]
pub async fn sales_add(
    arg0: Option<Value>,
    state: tauri::State<'_, DashboardState>,
) -> Result<Value, String> {
    let ctx = state.with_role(UserRole::Admin)?;
    let input: SaleInput = parse_payload(arg0)?;
    to_json(sales::add_sale(&ctx, input).await)
}

#[tauri::command]
pub async fn sales_update(
    arg0: Option<Value>,
    state: tauri::State<'_, DashboardState>,
) -> Result<Value, String> {
    let ctx = state.with_role(UserRole::Admin)?;
    let p: SaleUpdatePayload = parse_payload(arg0)?;
    to_json(sales::update_sale(&ctx, p.id, p.value, p.delivery_fee, &p.justification).await)
}

#[tauri::command]
pub async fn sales_delete(
    arg0: Option<Value>,
    state: tauri::State<'_, DashboardState>,
) -> Result<Value, String> {
    let ctx = state.with_role(UserRole::Admin)?;
    let IdPayload { id } = parse_payload(arg0)?;
    to_json(sales::delete_sale(&ctx, id).await.map(|()| json!({ "success": true })))
}

#[tauri::command]
pub async fn payments_list(state: tauri::State<'_, DashboardState>) -> Result<Value, String> {
    let ctx = state.with_role(UserRole::Admin)?;
    to_json(ctx.with_store(|s| s.payments.rows().to_vec()))
}

#[tauri::command]
pub async fn payments_add(
    arg0: Option<Value>,
    state: tauri::State<'_, DashboardState>,
) -> Result<Value, String> {
    let ctx = state.with_role(UserRole::Admin)?;
    let p: PaymentPayload = parse_payload(arg0)?;
    let person = StaffMember::parse(&p.person).ok_or_else(|| format!("Unknown staff member: {}", p.person))?;
    to_json(payments::add_payment(&ctx, person, p.date, p.value).await)
}

#[tauri::command]
pub async fn payments_delete(
    arg0: Option<Value>,
    state: tauri::State<'_, DashboardState>,
) -> Result<Value, String> {
    let ctx = state.with_role(UserRole::Admin)?;
    let IdPayload { id } = parse_payload(arg0)?;
    to_json(payments::delete_payment(&ctx, id).await.map(|()| json!({ "success": true })))
}

/// Summary cards, the three-month comparison and the seven-day chart.
#[tauri::command]
pub async fn dashboard_get_stats(state: tauri::State<'_, DashboardState>) -> Result<Value, String> {
    let ctx = state.with_role(UserRole::Admin)?;
    to_json(ctx.with_store(|s| {
        json!({
            "summary": stats::summary_stats(s.sales.rows(), s.payments.rows()),
            "monthly": stats::monthly_comparison(s.sales.rows(), 3),
            "daily": stats::daily_series(s.sales.rows(), 7),
        })
    }))
}

#[tauri::command]
pub async fn sales_grouped_by_month(
    state: tauri::State<'_, DashboardState>,
) -> Result<Value, String> {
    let ctx = state.with_role(UserRole::Admin)?;
    to_json(ctx.with_store(|s| stats::group_by_month(s.sales.rows())))
}
