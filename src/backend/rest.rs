//! PostgREST client for the hosted `sales`, `payments` and `deliveries`
//! tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::{Backend, Table};
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::models::{Delivery, NewDelivery, NewPayment, NewSale, Payment, Sale, SalePatch};

/// Default timeout for backend requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const SALES_ORDER: &str = "date.desc,created_at.desc";
const PAYMENTS_ORDER: &str = "date.desc,created_at.desc";
const DELIVERIES_ORDER: &str = "start_time.desc";

pub struct RestBackend {
    client: Client,
    base_url: String,
    anon_key: Zeroizing<String>,
    access_token: RwLock<Option<Zeroizing<String>>>,
}

impl RestBackend {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| AppError::Network(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.supabase_url.clone(),
            anon_key: Zeroizing::new(config.supabase_anon_key.clone()),
            access_token: RwLock::new(None),
        })
    }

    fn table_url(&self, table: Table) -> String {
        format!("{}/rest/v1/{}", self.base_url, table.name())
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let bearer = self
            .access_token
            .read()
            .ok()
            .and_then(|t| t.as_ref().map(|t| t.to_string()))
            .unwrap_or_else(|| self.anon_key.to_string());
        self.client
            .request(method, url)
            .header("apikey", self.anon_key.as_str())
            .header("Authorization", format!("Bearer {bearer}"))
            .header("Content-Type", "application/json")
    }

    async fn send(&self, req: RequestBuilder) -> AppResult<String> {
        let resp = req
            .send()
            .await
            .map_err(|e| AppError::Network(friendly_error(&self.base_url, &e)))?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(error_from_response(status, &body));
        }
        Ok(body)
    }

    async fn select<T: DeserializeOwned>(&self, table: Table, order: &str) -> AppResult<Vec<T>> {
        let url = self.table_url(table);
        let req = self
            .request(Method::GET, &url)
            .query(&[("select", "*"), ("order", order)]);
        let body = self.send(req).await?;
        let rows: Vec<T> = serde_json::from_str(&body)?;
        debug!(table = table.name(), rows = rows.len(), "fetched rows");
        Ok(rows)
    }

    async fn insert<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        table: Table,
        body: &B,
    ) -> AppResult<T> {
        let url = self.table_url(table);
        let req = self
            .request(Method::POST, &url)
            .header("Prefer", "return=representation")
            .json(body);
        let text = self.send(req).await?;
        first_row(table, &text)
    }

    async fn patch<T: DeserializeOwned>(&self, table: Table, id: i64, body: &Value) -> AppResult<T> {
        let url = self.table_url(table);
        let req = self
            .request(Method::PATCH, &url)
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=representation")
            .json(body);
        let text = self.send(req).await?;
        first_row(table, &text).map_err(|err| match err {
            AppError::NotFound(_) => AppError::NotFound(format!("{} {id}", table.name())),
            other => other,
        })
    }

    async fn delete(&self, table: Table, id: i64) -> AppResult<()> {
        let url = self.table_url(table);
        let req = self
            .request(Method::DELETE, &url)
            .query(&[("id", format!("eq.{id}"))]);
        self.send(req).await?;
        Ok(())
    }
}

#[async_trait]
impl Backend for RestBackend {
    fn set_access_token(&self, token: Option<String>) {
        match self.access_token.write() {
            Ok(mut slot) => *slot = token.map(Zeroizing::new),
            Err(e) => warn!(error = %e, "access token lock poisoned"),
        }
    }

    async fn list_sales(&self) -> AppResult<Vec<Sale>> {
        self.select(Table::Sales, SALES_ORDER).await
    }

    async fn insert_sale(&self, sale: &NewSale) -> AppResult<Sale> {
        self.insert(Table::Sales, sale).await
    }

    async fn update_sale(&self, id: i64, patch: &SalePatch) -> AppResult<Sale> {
        self.patch(Table::Sales, id, &serde_json::to_value(patch)?)
            .await
    }

    async fn delete_sale(&self, id: i64) -> AppResult<()> {
        self.delete(Table::Sales, id).await
    }

    async fn list_payments(&self) -> AppResult<Vec<Payment>> {
        self.select(Table::Payments, PAYMENTS_ORDER).await
    }

    async fn insert_payment(&self, payment: &NewPayment) -> AppResult<Payment> {
        self.insert(Table::Payments, payment).await
    }

    async fn delete_payment(&self, id: i64) -> AppResult<()> {
        self.delete(Table::Payments, id).await
    }

    async fn list_deliveries(&self) -> AppResult<Vec<Delivery>> {
        self.select(Table::Deliveries, DELIVERIES_ORDER).await
    }

    async fn insert_delivery(&self, delivery: &NewDelivery) -> AppResult<Delivery> {
        self.insert(Table::Deliveries, delivery).await
    }

    async fn mark_delivered(&self, id: i64, at: DateTime<Utc>) -> AppResult<Delivery> {
        let body = json!({ "status": "delivered", "delivered_at": at.to_rfc3339() });
        self.patch(Table::Deliveries, id, &body).await
    }

    async fn delete_delivery(&self, id: i64) -> AppResult<()> {
        self.delete(Table::Deliveries, id).await
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
pub(crate) fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach backend at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid backend URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Session expired, sign in again".to_string(),
        403 => "Not allowed by the backend access rules".to_string(),
        404 => "Backend endpoint not found".to_string(),
        s if s >= 500 => format!("Backend server error (HTTP {s})"),
        s => format!("Unexpected response from backend (HTTP {s})"),
    }
}

/// Build an error from a non-2xx response. PostgREST bodies look like
/// `{"code":"PGRST204","message":"...","details":null,"hint":null}`.
pub(crate) fn error_from_response(status: StatusCode, body: &str) -> AppError {
    let detail = match serde_json::from_str::<Value>(body) {
        Ok(json) => {
            let message = json
                .get("message")
                .or_else(|| json.get("error_description"))
                .or_else(|| json.get("msg"))
                .or_else(|| json.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| status_error(status));
            match json.get("code").and_then(Value::as_str) {
                Some(code) if !code.is_empty() => format!("{message} ({code})"),
                _ => message,
            }
        }
        Err(_) if !body.trim().is_empty() => format!("{}: {}", status_error(status), body.trim()),
        Err(_) => status_error(status),
    };
    if status == StatusCode::UNAUTHORIZED {
        return AppError::Unauthorized(detail);
    }
    AppError::from_remote(status.as_u16(), detail)
}

/// `return=representation` answers with an array; take its single row.
fn first_row<T: DeserializeOwned>(table: Table, body: &str) -> AppResult<T> {
    let mut rows: Vec<T> = serde_json::from_str(body)?;
    if rows.is_empty() {
        return Err(AppError::NotFound(format!("no {} row returned", table.name())));
    }
    Ok(rows.swap_remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeliveryStatus;
    use crate::test_support::serve_once;
    use chrono::{NaiveDate, TimeZone};
    use tokio::net::TcpListener;

    fn backend(url: &str) -> RestBackend {
        RestBackend::new(&AppConfig::with_backend(url, "anon-key")).unwrap()
    }

    #[tokio::test]
    async fn test_list_sales_sends_order_and_keys() {
        let (url, server) = serve_once(
            200,
            r#"[{"id":1,"order_id":"5","date":"2025-03-02","value":100,"delivery_fee":null,"created_at":"2025-03-02T10:00:00+00:00","justification":null}]"#,
        )
        .await;
        let sales = backend(&url).list_sales().await.unwrap();
        let request = server.await.unwrap();

        assert_eq!(sales.len(), 1);
        assert_eq!(sales[0].date, NaiveDate::from_ymd_opt(2025, 3, 2).unwrap());
        assert!(request.starts_with("GET /rest/v1/sales?select=*&order=date.desc%2Ccreated_at.desc"));
        assert!(request.contains("apikey: anon-key"));
        assert!(request.contains("authorization: Bearer anon-key"));
    }

    #[tokio::test]
    async fn test_insert_delivery_uses_access_token_and_representation() {
        let (url, server) = serve_once(
            201,
            r#"[{"id":42,"order_id":"77","address":"Rua X, 10","status":"in_route","start_time":"2025-03-14T10:00:00Z","delivered_at":null,"created_at":"2025-03-14T10:00:00Z","driver_email":"moto@bellaflor.test"}]"#,
        )
        .await;
        let backend = backend(&url);
        backend.set_access_token(Some("user-jwt".into()));
        let created = backend
            .insert_delivery(&NewDelivery {
                order_id: "77".into(),
                address: "Rua X, 10".into(),
                status: DeliveryStatus::InRoute,
                start_time: Utc.with_ymd_and_hms(2025, 3, 14, 10, 0, 0).unwrap(),
                delivered_at: None,
                driver_email: Some("moto@bellaflor.test".into()),
                delivery_fee: None,
            })
            .await
            .unwrap();
        let request = server.await.unwrap();

        assert_eq!(created.id, 42);
        assert!(request.starts_with("POST /rest/v1/deliveries "));
        assert!(request.contains("authorization: Bearer user-jwt"));
        assert!(request.contains("prefer: return=representation"));
        assert!(request.contains(r#""order_id":"77""#));
    }

    #[tokio::test]
    async fn test_mark_delivered_filters_by_id() {
        let (url, server) = serve_once(
            200,
            r#"[{"id":7,"order_id":"9","address":"A","status":"delivered","start_time":"2025-03-14T10:00:00Z","delivered_at":"2025-03-14T10:30:00Z"}]"#,
        )
        .await;
        let at = Utc.with_ymd_and_hms(2025, 3, 14, 10, 30, 0).unwrap();
        let updated = backend(&url).mark_delivered(7, at).await.unwrap();
        let request = server.await.unwrap();

        assert_eq!(updated.status, DeliveryStatus::Delivered);
        assert!(request.starts_with("PATCH /rest/v1/deliveries?id=eq.7 "));
        assert!(request.contains(r#""status":"delivered""#));
    }

    #[tokio::test]
    async fn test_update_of_missing_row_is_not_found() {
        let (url, server) = serve_once(200, "[]").await;
        let err = backend(&url)
            .update_sale(
                99,
                &SalePatch {
                    value: 10.0,
                    delivery_fee: 0.0,
                    justification: "ajuste".into(),
                },
            )
            .await
            .unwrap_err();
        server.await.unwrap();
        assert!(matches!(err, AppError::NotFound(ref m) if m == "sales 99"));
    }

    #[tokio::test]
    async fn test_missing_column_becomes_setup_instruction() {
        let (url, server) = serve_once(
            400,
            r#"{"code":"PGRST204","message":"Could not find the 'delivery_fee' column of 'sales' in the schema cache","details":null,"hint":null}"#,
        )
        .await;
        let err = backend(&url)
            .insert_sale(&NewSale {
                order_id: None,
                date: NaiveDate::from_ymd_opt(2025, 3, 2).unwrap(),
                value: 10.0,
                delivery_fee: 5.0,
            })
            .await
            .unwrap_err();
        server.await.unwrap();
        match err {
            AppError::SchemaMissing { object, hint } => {
                assert_eq!(object, "sales.delivery_fee");
                assert!(hint.contains("ALTER TABLE"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_error_from_response_variants() {
        let err = error_from_response(StatusCode::UNAUTHORIZED, r#"{"message":"JWT expired"}"#);
        assert!(matches!(err, AppError::Unauthorized(ref m) if m == "JWT expired"));

        let err = error_from_response(StatusCode::BAD_GATEWAY, "");
        assert!(err.is_transient());

        let err = error_from_response(StatusCode::CONFLICT, "duplicate");
        assert!(matches!(err, AppError::Remote { status: 409, .. }));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = backend(&format!("http://{addr}"))
            .list_payments()
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Network(_)));
    }
}
