//! Address lookup for the driver's start-delivery form.
//!
//! Free text goes to Nominatim (Brazil only, bounded to a box around the
//! driver); a postal code goes to ViaCEP for an exact match. The helpers
//! below shape a candidate into what the form shows and what the maps app
//! receives.

use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, GeoPoint};
use crate::error::{AppError, AppResult};

pub const MIN_QUERY_LEN: usize = 3;
pub const MAX_CANDIDATES: usize = 5;
/// Half-width of the search box in degrees (about 20 km).
pub const VIEWBOX_DELTA: f64 = 0.2;
const MAPS_DIRECTIONS_URL: &str = "https://www.google.com/maps/dir/";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddressParts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub road: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suburb: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub town: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postcode: Option<String>,
}

/// One ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressCandidate {
    #[serde(default)]
    pub place_id: i64,
    pub display_name: String,
    #[serde(default)]
    pub lat: String,
    #[serde(default)]
    pub lon: String,
    #[serde(default)]
    pub address: AddressParts,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateDisplay {
    pub main: String,
    pub secondary: String,
}

#[derive(Debug, Deserialize)]
struct PostalRecord {
    #[serde(default)]
    cep: String,
    #[serde(default)]
    logradouro: String,
    #[serde(default)]
    bairro: String,
    #[serde(default)]
    localidade: String,
    #[serde(default)]
    uf: String,
    #[serde(default)]
    erro: Option<serde_json::Value>,
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

impl From<PostalRecord> for AddressCandidate {
    fn from(r: PostalRecord) -> Self {
        let display_name = [&r.logradouro, &r.bairro, &r.localidade, &r.uf, &r.cep]
            .iter()
            .filter(|p| !p.trim().is_empty())
            .map(|p| p.trim())
            .collect::<Vec<_>>()
            .join(", ");
        AddressCandidate {
            place_id: 0,
            display_name,
            lat: String::new(),
            lon: String::new(),
            address: AddressParts {
                road: non_empty(&r.logradouro),
                suburb: non_empty(&r.bairro),
                city: non_empty(&r.localidade),
                town: None,
                state: non_empty(&r.uf),
                postcode: non_empty(&r.cep),
            },
        }
    }
}

/// `NNNNN-NNN` or eight bare digits.
pub fn is_postal_code(query: &str) -> bool {
    postal_digits(query).is_some()
}

fn postal_digits(query: &str) -> Option<String> {
    let q = query.trim();
    let bytes = q.as_bytes();
    let shaped = match bytes.len() {
        8 => bytes.iter().all(u8::is_ascii_digit),
        9 => {
            bytes[5] == b'-'
                && bytes[..5].iter().all(u8::is_ascii_digit)
                && bytes[6..].iter().all(u8::is_ascii_digit)
        }
        _ => false,
    };
    shaped.then(|| q.replace('-', ""))
}

/// `left,top,right,bottom` around `center`.
pub fn viewbox(center: GeoPoint) -> String {
    format!(
        "{},{},{},{}",
        center.lon - VIEWBOX_DELTA,
        center.lat + VIEWBOX_DELTA,
        center.lon + VIEWBOX_DELTA,
        center.lat - VIEWBOX_DELTA
    )
}

pub struct AddressLookup {
    client: Client,
    nominatim_url: String,
    postal_url: String,
    fallback: GeoPoint,
}

impl AddressLookup {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(concat!("bellaflor-dashboard/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            nominatim_url: config.nominatim_url.trim_end_matches('/').to_string(),
            postal_url: config.postal_url.trim_end_matches('/').to_string(),
            fallback: config.default_location,
        })
    }

    /// Candidates for `query`. Short queries return nothing without a
    /// request; `near` defaults to the configured fallback location.
    pub async fn search(&self, query: &str, near: Option<GeoPoint>) -> AppResult<Vec<AddressCandidate>> {
        let query = query.trim();
        if query.chars().count() < MIN_QUERY_LEN {
            return Ok(Vec::new());
        }
        if let Some(digits) = postal_digits(query) {
            return Ok(self.postal_lookup(&digits).await?.into_iter().collect());
        }

        let center = near.unwrap_or(self.fallback);
        let url = format!("{}/search", self.nominatim_url);
        let limit = MAX_CANDIDATES.to_string();
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("format", "json"),
                ("q", query),
                ("addressdetails", "1"),
                ("limit", limit.as_str()),
                ("countrycodes", "br"),
                ("viewbox", viewbox(center).as_str()),
                ("bounded", "1"),
            ])
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            warn!(status, "address search failed");
            return Err(AppError::Remote {
                status,
                message: format!("Address search failed (HTTP {status})"),
            });
        }
        let mut candidates: Vec<AddressCandidate> = resp.json().await?;
        candidates.truncate(MAX_CANDIDATES);
        debug!(count = candidates.len(), "address candidates");
        Ok(candidates)
    }

    /// Exact postal-code lookup. An unknown code is `Ok(None)`.
    pub async fn postal_lookup(&self, digits: &str) -> AppResult<Option<AddressCandidate>> {
        let url = format!("{}/{}/json/", self.postal_url, digits);
        let resp = self.client.get(&url).send().await?;
        match resp.status().as_u16() {
            200 => {}
            // ViaCEP answers 400 for malformed codes.
            400 | 404 => return Ok(None),
            status => {
                return Err(AppError::Remote {
                    status,
                    message: format!("Postal code lookup failed (HTTP {status})"),
                })
            }
        }
        let record: PostalRecord = resp.json().await?;
        if record.erro.is_some() {
            info!(postal_code = digits, "postal code not found");
            return Ok(None);
        }
        Ok(Some(record.into()))
    }
}

/// Main line (the road) and secondary line (suburb, city or town, state)
/// shown for a candidate.
pub fn display(candidate: &AddressCandidate) -> CandidateDisplay {
    let parts: Vec<&str> = candidate.display_name.split(", ").collect();
    let first = parts.first().copied().unwrap_or_default();
    let main = candidate
        .address
        .road
        .clone()
        .unwrap_or_else(|| first.to_string());

    let a = &candidate.address;
    let details: Vec<&str> = [
        a.suburb.as_deref(),
        a.city.as_deref().or(a.town.as_deref()),
        a.state.as_deref(),
    ]
    .into_iter()
    .flatten()
    .filter(|s| !s.is_empty())
    .collect();
    let secondary = if details.is_empty() {
        parts.iter().skip(1).take(3).copied().collect::<Vec<_>>().join(", ")
    } else {
        details.join(", ")
    };
    CandidateDisplay { main, secondary }
}

/// Text placed in the address field once a candidate is picked:
/// `road, suburb`.
pub fn selected_text(candidate: &AddressCandidate) -> String {
    let mut text = match candidate.address.road.as_deref().filter(|r| !r.is_empty()) {
        Some(road) => road.to_string(),
        None => candidate
            .display_name
            .split(',')
            .next()
            .unwrap_or_default()
            .trim()
            .to_string(),
    };
    if let Some(suburb) = candidate.address.suburb.as_deref().filter(|s| !s.is_empty()) {
        text.push_str(", ");
        text.push_str(suburb);
    }
    text
}

/// `address, number`, or just the address when no number was typed.
pub fn full_destination(address: &str, number: &str) -> String {
    let address = address.trim();
    match number.trim() {
        "" => address.to_string(),
        n => format!("{address}, {n}"),
    }
}

pub fn maps_url(destination: &str) -> AppResult<String> {
    let url = Url::parse_with_params(
        MAPS_DIRECTIONS_URL,
        &[
            ("api", "1"),
            ("destination", destination),
            ("travelmode", "driving"),
        ],
    )
    .map_err(|e| AppError::Validation(format!("Invalid destination: {e}")))?;
    Ok(url.to_string())
}

/// Open driving directions to `destination` in the system browser.
pub fn open_directions(destination: &str) -> AppResult<String> {
    let url = maps_url(destination)?;
    webbrowser::open(&url)
        .map_err(|e| AppError::State(format!("Could not open the browser: {e}")))?;
    info!(destination, "opened directions");
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serve_once;

    const NOMINATIM_BODY: &str = r#"[
        {"place_id": 1, "display_name": "Rua XV de Novembro, Centro, Sorocaba, São Paulo, Brasil",
         "lat": "-23.50", "lon": "-47.45",
         "address": {"road": "Rua XV de Novembro", "suburb": "Centro", "city": "Sorocaba", "state": "São Paulo"}},
        {"place_id": 2, "display_name": "Praça Coronel Fernando Prestes, Votorantim, São Paulo",
         "lat": "-23.54", "lon": "-47.44", "address": {"town": "Votorantim"}}
    ]"#;

    fn lookup(url: &str) -> AddressLookup {
        let mut config = AppConfig::with_backend("http://127.0.0.1:9", "anon");
        config.nominatim_url = url.to_string();
        config.postal_url = format!("{url}/ws");
        AddressLookup::new(&config).unwrap()
    }

    #[test]
    fn test_postal_code_shapes() {
        assert!(is_postal_code("18035-000"));
        assert!(is_postal_code(" 18035000 "));
        assert!(!is_postal_code("1803-5000"));
        assert!(!is_postal_code("Rua 18035000"));
        assert!(!is_postal_code("1803500"));
    }

    #[test]
    fn test_viewbox_around_point() {
        let vb = viewbox(GeoPoint { lat: -23.5, lon: -47.5 });
        assert_eq!(vb, "-47.7,-23.3,-47.3,-23.7");
    }

    #[tokio::test]
    async fn test_search_sends_bounded_brazil_query() {
        let (url, request) = serve_once(200, NOMINATIM_BODY).await;
        let found = lookup(&url).search("Rua XV", None).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].address.suburb.as_deref(), Some("Centro"));

        let request = request.await.unwrap();
        let line = request.lines().next().unwrap();
        assert!(line.starts_with("GET /search?format=json&q=Rua+XV&addressdetails=1&limit=5&countrycodes=br&viewbox="));
        assert!(line.contains("&bounded=1"));
    }

    #[tokio::test]
    async fn test_short_query_makes_no_request() {
        let found = lookup("http://127.0.0.1:9").search(" ab ", None).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_postal_code_goes_to_postal_service() {
        let (url, request) = serve_once(
            200,
            r#"{"cep": "18035-000", "logradouro": "Avenida Dom Aguirre", "bairro": "Santa Rosália",
                "localidade": "Sorocaba", "uf": "SP"}"#,
        )
        .await;
        let found = lookup(&url).search("18035-000", None).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(selected_text(&found[0]), "Avenida Dom Aguirre, Santa Rosália");
        assert!(request.await.unwrap().starts_with("GET /ws/18035000/json/ "));
    }

    #[tokio::test]
    async fn test_unknown_postal_code_is_empty() {
        let (url, _request) = serve_once(200, r#"{"erro": true}"#).await;
        assert!(lookup(&url).postal_lookup("99999999").await.unwrap().is_none());
    }

    #[test]
    fn test_display_and_selection_fallbacks() {
        let candidates: Vec<AddressCandidate> = serde_json::from_str(NOMINATIM_BODY).unwrap();
        let first = display(&candidates[0]);
        assert_eq!(first.main, "Rua XV de Novembro");
        assert_eq!(first.secondary, "Centro, Sorocaba, São Paulo");

        let second = display(&candidates[1]);
        assert_eq!(second.main, "Praça Coronel Fernando Prestes");
        assert_eq!(second.secondary, "Votorantim");
        assert_eq!(selected_text(&candidates[1]), "Praça Coronel Fernando Prestes");
    }

    #[test]
    fn test_destination_and_maps_url() {
        assert_eq!(full_destination("Rua X", " 10 "), "Rua X, 10");
        assert_eq!(full_destination("Rua X ", ""), "Rua X");
        let url = maps_url("Rua X, 10").unwrap();
        assert_eq!(
            url,
            "https://www.google.com/maps/dir/?api=1&destination=Rua+X%2C+10&travelmode=driving"
        );
    }
}
