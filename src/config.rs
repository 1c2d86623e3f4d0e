//! Runtime configuration.
//!
//! Values come from `BELLAFLOR_*` environment variables first, then from the
//! OS credential store (see `storage`) for the backend URL and keys.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::models::UserRole;
use crate::storage;

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
const MIN_POLL_INTERVAL_SECS: u64 = 2;
pub const DEFAULT_AI_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org";
pub const DEFAULT_POSTAL_URL: &str = "https://viacep.com.br/ws";
/// Sorocaba/SP, used when the driver's position is unknown.
pub const DEFAULT_LOCATION: GeoPoint = GeoPoint {
    lat: -23.5015,
    lon: -47.4521,
};
pub const DEFAULT_REPORT_ROWS_PER_PAGE: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn parse(raw: &str) -> Option<Self> {
        let (lat, lon) = raw.split_once(',')?;
        let lat: f64 = lat.trim().parse().ok()?;
        let lon: f64 = lon.trim().parse().ok()?;
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return None;
        }
        Some(GeoPoint { lat, lon })
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub poll_interval: Duration,
    pub realtime_enabled: bool,
    pub ai_api_key: Option<String>,
    pub ai_model: String,
    /// Static email -> role table, consulted before profile metadata.
    pub role_table: HashMap<String, UserRole>,
    pub nominatim_url: String,
    pub postal_url: String,
    pub default_location: GeoPoint,
    pub report_rows_per_page: usize,
}

impl AppConfig {
    /// Load from the process environment and the OS credential store.
    pub fn load() -> AppResult<Self> {
        Self::from_sources(|key| std::env::var(key).ok(), storage::get_credential)
    }

    /// Load from arbitrary lookups; `env` is consulted before `credentials`.
    pub fn from_sources<E, C>(env: E, credentials: C) -> AppResult<Self>
    where
        E: Fn(&str) -> Option<String>,
        C: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let supabase_url = var("BELLAFLOR_SUPABASE_URL")
            .or_else(|| credentials(storage::KEY_SUPABASE_URL))
            .map(|u| normalize_base_url(&u))
            .filter(|u| !u.is_empty())
            .ok_or_else(|| AppError::NotConfigured("missing Supabase URL".into()))?;
        let supabase_anon_key = var("BELLAFLOR_SUPABASE_ANON_KEY")
            .or_else(|| credentials(storage::KEY_SUPABASE_ANON_KEY))
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| AppError::NotConfigured("missing Supabase anon key".into()))?;

        let poll_secs = var("BELLAFLOR_POLL_INTERVAL_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS)
            .max(MIN_POLL_INTERVAL_SECS);

        let realtime_enabled = var("BELLAFLOR_REALTIME")
            .map(|v| parse_bool(&v))
            .unwrap_or(true);

        let ai_api_key = var("BELLAFLOR_AI_API_KEY")
            .or_else(|| var("API_KEY"))
            .or_else(|| credentials(storage::KEY_AI_API_KEY));

        let role_table = var("BELLAFLOR_ROLE_TABLE")
            .map(|raw| parse_role_table(&raw))
            .unwrap_or_default();

        let default_location = var("BELLAFLOR_DEFAULT_LOCATION")
            .and_then(|v| GeoPoint::parse(&v))
            .unwrap_or(DEFAULT_LOCATION);

        let report_rows_per_page = var("BELLAFLOR_REPORT_ROWS_PER_PAGE")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_REPORT_ROWS_PER_PAGE);

        Ok(Self {
            supabase_url,
            supabase_anon_key,
            poll_interval: Duration::from_secs(poll_secs),
            realtime_enabled,
            ai_api_key,
            ai_model: var("BELLAFLOR_AI_MODEL").unwrap_or_else(|| DEFAULT_AI_MODEL.to_string()),
            role_table,
            nominatim_url: var("BELLAFLOR_NOMINATIM_URL")
                .map(|u| normalize_base_url(&u))
                .unwrap_or_else(|| DEFAULT_NOMINATIM_URL.to_string()),
            postal_url: var("BELLAFLOR_POSTAL_URL")
                .map(|u| normalize_base_url(&u))
                .unwrap_or_else(|| DEFAULT_POSTAL_URL.to_string()),
            default_location,
            report_rows_per_page,
        })
    }

    /// Config pointing at a backend URL with defaults everywhere else.
    pub fn with_backend(supabase_url: &str, supabase_anon_key: &str) -> Self {
        Self {
            supabase_url: normalize_base_url(supabase_url),
            supabase_anon_key: supabase_anon_key.to_string(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            realtime_enabled: true,
            ai_api_key: None,
            ai_model: DEFAULT_AI_MODEL.to_string(),
            role_table: HashMap::new(),
            nominatim_url: DEFAULT_NOMINATIM_URL.to_string(),
            postal_url: DEFAULT_POSTAL_URL.to_string(),
            default_location: DEFAULT_LOCATION,
            report_rows_per_page: DEFAULT_REPORT_ROWS_PER_PAGE,
        }
    }

    /// `wss://` endpoint of the realtime service for this project.
    pub fn realtime_url(&self) -> String {
        let ws_base = if let Some(rest) = self.supabase_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.supabase_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            format!("wss://{}", self.supabase_url)
        };
        format!(
            "{ws_base}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            self.supabase_anon_key
        )
    }
}

/// Normalise a service base URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/rest/v1` segment
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/rest/v1") {
        url.truncate(url.len() - "/rest/v1".len());
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// Parse `email:role,email:role`; malformed pairs are skipped.
pub fn parse_role_table(raw: &str) -> HashMap<String, UserRole> {
    raw.split([',', ';'])
        .filter_map(|pair| {
            let (email, role) = pair.split_once(':')?;
            let email = email.trim().to_lowercase();
            if email.is_empty() {
                return None;
            }
            Some((email, UserRole::parse(role)?))
        })
        .collect()
}

fn parse_bool(raw: &str) -> bool {
    !matches!(
        raw.trim().to_lowercase().as_str(),
        "0" | "false" | "off" | "no"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn lookup(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn test_env_takes_precedence_over_credentials() {
        let config = AppConfig::from_sources(
            lookup(&[
                ("BELLAFLOR_SUPABASE_URL", "demo.supabase.co/"),
                ("BELLAFLOR_SUPABASE_ANON_KEY", "anon-env"),
            ]),
            lookup(&[
                ("supabase_url", "https://other.supabase.co"),
                ("supabase_anon_key", "anon-keyring"),
                ("ai_api_key", "ai-keyring"),
            ]),
        )
        .unwrap();
        assert_eq!(config.supabase_url, "https://demo.supabase.co");
        assert_eq!(config.supabase_anon_key, "anon-env");
        assert_eq!(config.ai_api_key.as_deref(), Some("ai-keyring"));
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert!(config.realtime_enabled);
        assert_eq!(config.default_location, DEFAULT_LOCATION);
    }

    #[test]
    fn test_missing_backend_is_not_configured() {
        let err = AppConfig::from_sources(lookup(&[]), lookup(&[])).unwrap_err();
        assert!(matches!(err, AppError::NotConfigured(_)));
    }

    #[test]
    fn test_tuning_values() {
        let config = AppConfig::from_sources(
            lookup(&[
                ("BELLAFLOR_SUPABASE_URL", "http://localhost:54321/rest/v1/"),
                ("BELLAFLOR_SUPABASE_ANON_KEY", "anon"),
                ("BELLAFLOR_POLL_INTERVAL_SECS", "1"),
                ("BELLAFLOR_REALTIME", "off"),
                ("BELLAFLOR_ROLE_TABLE", "Dona@BellaFlor.test:admin, moto@bellaflor.test:driver,bad"),
                ("BELLAFLOR_DEFAULT_LOCATION", "-22.9, -43.2"),
                ("BELLAFLOR_REPORT_ROWS_PER_PAGE", "0"),
            ]),
            lookup(&[]),
        )
        .unwrap();
        assert_eq!(config.supabase_url, "http://localhost:54321");
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert!(!config.realtime_enabled);
        assert_eq!(
            config.role_table.get("dona@bellaflor.test"),
            Some(&UserRole::Admin)
        );
        assert_eq!(config.role_table.len(), 2);
        assert_eq!(config.default_location, GeoPoint { lat: -22.9, lon: -43.2 });
        assert_eq!(config.report_rows_per_page, DEFAULT_REPORT_ROWS_PER_PAGE);
        assert_eq!(
            config.realtime_url(),
            "ws://localhost:54321/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
    }

    #[test]
    #[serial]
    fn test_load_reads_process_environment() {
        std::env::set_var("BELLAFLOR_SUPABASE_URL", "https://env-test.supabase.co");
        std::env::set_var("BELLAFLOR_SUPABASE_ANON_KEY", "anon-from-env");
        std::env::set_var("BELLAFLOR_AI_MODEL", "gemini-test");
        let config = AppConfig::load();
        std::env::remove_var("BELLAFLOR_SUPABASE_URL");
        std::env::remove_var("BELLAFLOR_SUPABASE_ANON_KEY");
        std::env::remove_var("BELLAFLOR_AI_MODEL");

        let config = config.unwrap();
        assert_eq!(config.supabase_url, "https://env-test.supabase.co");
        assert_eq!(config.ai_model, "gemini-test");
    }

    #[test]
    fn test_geo_point_rejects_out_of_range() {
        assert!(GeoPoint::parse("95,10").is_none());
        assert!(GeoPoint::parse("nope").is_none());
    }
}
