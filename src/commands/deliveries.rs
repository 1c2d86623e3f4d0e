use chrono::Local;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_payload, to_json, DashboardState};
use crate::models::{DeliveryKey, UserRole};
use crate::money::parse_cents_input;
use crate::{deliveries, stats};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartPayload {
    #[serde(alias = "order_id")]
    order_id: String,
    address: String,
    /// Street number typed separately from the picked address.
    #[serde(default)]
    number: Option<String>,
    /// Fee as typed in the form (digits only, last two are cents).
    #[serde(default, alias = "delivery_fee")]
    delivery_fee: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KeyPayload {
    key: DeliveryKey,
}

#[tauri::command]
pub async fn deliveries_list(state: tauri::State<'_, DashboardState>) -> Result<Value, String> {
    let ctx = state.with_session()?;
    to_json(deliveries::list(&ctx))
}

#[tauri::command]
pub async fn deliveries_start(
    arg0: Option<Value>,
    state: tauri::State<'_, DashboardState>,
) -> Result<Value, String> {
    let ctx = state.with_role(UserRole::Driver)?;
    let p: StartPayload = parse_payload(arg0)?;
    let address = crate::address::full_destination(&p.address, p.number.as_deref().unwrap_or(""));
    let fee = p.delivery_fee.as_deref().and_then(parse_cents_input);
    to_json(deliveries::start_delivery(&ctx, &p.order_id, &address, fee).await)
}

#[tauri::command]
pub async fn deliveries_confirm(
    arg0: Option<Value>,
    state: tauri::State<'_, DashboardState>,
) -> Result<Value, String> {
    let ctx = state.with_session()?;
    let KeyPayload { key } = parse_payload(arg0)?;
    to_json(deliveries::confirm_delivery(&ctx, key).await)
}

#[tauri::command]
pub async fn deliveries_cancel(
    arg0: Option<Value>,
    state: tauri::State<'_, DashboardState>,
) -> Result<Value, String> {
    let ctx = state.with_session()?;
    let KeyPayload { key } = parse_payload(arg0)?;
    to_json(
        deliveries::cancel_delivery(&ctx, key)
            .await
            .map(|()| json!({ "success": true })),
    )
}

/// Today's deliveries, counters and the recent list for the signed-in driver.
#[tauri::command]
pub async fn driver_get_summary(state: tauri::State<'_, DashboardState>) -> Result<Value, String> {
    let ctx = state.with_role(UserRole::Driver)?;
    let email = ctx.auth.email().unwrap_or_default();
    let now = Local::now();
    let entries = deliveries::list(&ctx).map_err(|e| e.to_string())?;
    let summary = stats::driver_summary(&entries, &email, now.date_naive(), *now.offset());
    serde_json::to_value(summary).map_err(|e| e.to_string())
}
