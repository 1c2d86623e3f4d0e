//! Error type shared by the services and the backend clients.
//!
//! Tauri commands keep the `Result<Value, String>` IPC convention; they call
//! `to_string()` on an `AppError` at the boundary.

use thiserror::Error;

/// Substrings PostgREST / Postgres use when a table or column is missing.
const SCHEMA_MISSING_MARKERS: &[&str] = &[
    "schema cache",
    "does not exist",
    "pgrst204",
    "pgrst205",
    "42p01",
    "42703",
];

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Backend not configured: {0}")]
    NotConfigured(String),

    #[error("{0}")]
    Validation(String),

    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Backend rejected the request (HTTP {status}): {message}")]
    Remote { status: u16, message: String },

    #[error("Database setup incomplete: {object} is missing. {hint}")]
    SchemaMissing { object: String, hint: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Local cache error: {0}")]
    Cache(String),

    #[error("Credential store error: {0}")]
    Credential(String),

    #[error("Invalid response: {0}")]
    Decode(String),

    #[error("State lock poisoned: {0}")]
    State(String),
}

impl AppError {
    /// Build the error for a non-2xx backend response, upgrading it to
    /// `SchemaMissing` when the body names a missing table or column.
    pub fn from_remote(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if is_schema_missing(&message) {
            let object = missing_object(&message).unwrap_or_else(|| "a table or column".into());
            let hint = setup_hint(&object);
            return AppError::SchemaMissing { object, hint };
        }
        AppError::Remote { status, message }
    }

    /// Failures the poll / realtime loops only log.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Network(_) => true,
            AppError::Remote { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return AppError::Decode(err.to_string());
        }
        AppError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Decode(err.to_string())
    }
}

impl From<keyring::Error> for AppError {
    fn from(err: keyring::Error) -> Self {
        AppError::Credential(err.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::Cache(err.to_string())
    }
}

pub fn is_schema_missing(message: &str) -> bool {
    let lower = message.to_lowercase();
    SCHEMA_MISSING_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Pull the quoted object name out of a PostgREST/Postgres error, e.g.
/// `Could not find the 'delivery_fee' column of 'sales' in the schema cache`
/// yields `sales.delivery_fee`.
fn missing_object(message: &str) -> Option<String> {
    let quoted: Vec<&str> = message
        .split(['\'', '"'])
        .skip(1)
        .step_by(2)
        .filter(|s| !s.trim().is_empty())
        .collect();
    let lower = message.to_lowercase();
    if lower.contains("column") && quoted.len() >= 2 {
        let table = quoted[1].trim_start_matches("public.");
        return Some(format!("{table}.{}", quoted[0]));
    }
    quoted
        .first()
        .map(|s| s.trim_start_matches("public.").to_string())
}

/// Actionable setup instruction for a missing table or column.
pub fn setup_hint(object: &str) -> String {
    let sql = match object {
        "sales.delivery_fee" => "ALTER TABLE sales ADD COLUMN delivery_fee numeric DEFAULT 0;",
        "sales.justification" => "ALTER TABLE sales ADD COLUMN justification text;",
        "sales.order_id" => "ALTER TABLE sales ADD COLUMN order_id text;",
        "deliveries.driver_email" => "ALTER TABLE deliveries ADD COLUMN driver_email text;",
        "deliveries.delivery_fee" => {
            "ALTER TABLE deliveries ADD COLUMN delivery_fee numeric DEFAULT 0;"
        }
        "deliveries" => {
            "CREATE TABLE deliveries (id bigserial primary key, order_id text not null, \
             address text not null, status text not null default 'in_route', \
             start_time timestamptz not null default now(), delivered_at timestamptz, \
             created_at timestamptz not null default now(), driver_email text, \
             delivery_fee numeric default 0);"
        }
        "payments" => {
            "CREATE TABLE payments (id bigserial primary key, person text not null, \
             date date not null, value numeric not null, \
             created_at timestamptz not null default now());"
        }
        "sales" => {
            "CREATE TABLE sales (id bigserial primary key, order_id text, date date not null, \
             value numeric not null, delivery_fee numeric default 0, justification text, \
             created_at timestamptz not null default now());"
        }
        _ => return "Run the database setup script in the backend SQL editor.".to_string(),
    };
    format!("Run this in the backend SQL editor: {sql}")
}

pub type AppResult<T> = Result<T, AppError>;
