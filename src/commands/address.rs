use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_payload, to_json, DashboardState};
use crate::address::{self, AddressCandidate, AddressLookup};
use crate::config::GeoPoint;

#[derive(Debug, Deserialize)]
struct SearchPayload {
    query: String,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct DescribePayload {
    candidate: AddressCandidate,
}

#[derive(Debug, Deserialize)]
struct DirectionsPayload {
    address: String,
    #[serde(default)]
    number: String,
}

/// Candidates for the address field, each with its display lines and the
/// text the field takes when it is picked.
#[tauri::command]
pub async fn address_search(
    arg0: Option<Value>,
    state: tauri::State<'_, DashboardState>,
) -> Result<Value, String> {
    let ctx = state.with_session()?;
    let p: SearchPayload = parse_payload(arg0)?;
    let near = match (p.lat, p.lon) {
        (Some(lat), Some(lon)) => Some(GeoPoint { lat, lon }),
        _ => None,
    };
    let lookup = AddressLookup::new(&ctx.config).map_err(|e| e.to_string())?;
    let candidates = lookup.search(&p.query, near).await.map_err(|e| e.to_string())?;
    Ok(Value::Array(
        candidates
            .iter()
            .map(|c| {
                json!({
                    "candidate": c,
                    "display": address::display(c),
                    "selectedText": address::selected_text(c),
                })
            })
            .collect(),
    ))
}

#[tauri::command]
pub async fn address_describe(arg0: Option<Value>) -> Result<Value, String> {
    let DescribePayload { candidate } = parse_payload(arg0)?;
    Ok(json!({
        "display": address::display(&candidate),
        "selectedText": address::selected_text(&candidate),
    }))
}

/// Open driving directions in the system browser.
#[tauri::command]
pub async fn address_open_directions(arg0: Option<Value>) -> Result<Value, String> {
    let p: DirectionsPayload = parse_payload(arg0)?;
    let destination = address::full_destination(&p.address, &p.number);
    to_json(address::open_directions(&destination).map(|url| json!({ "url": url })))
}
