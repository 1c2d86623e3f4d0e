//! Short sales insights generated by the Gemini `generateContent` API.

use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::backend::rest::error_from_response;
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::models::Sale;
use crate::money::round_cents;
use crate::stats::commission;

pub const MIN_SALES: usize = 3;
pub const DEFAULT_API_URL: &str = "https://generativelanguage.googleapis.com";
const ALLOWED_TAGS: [&str; 4] = ["p", "strong", "ul", "li"];
/// Elements whose content is dropped along with the tags.
const DROPPED_ELEMENTS: [&str; 2] = ["script", "style"];

#[derive(Debug, Serialize)]
struct SaleSummary {
    data: String,
    valor: f64,
    comissao: f64,
}

pub struct InsightsClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: Zeroizing<String>,
}

impl InsightsClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        Self::with_base_url(config, DEFAULT_API_URL)
    }

    pub fn with_base_url(config: &AppConfig, base_url: &str) -> AppResult<Self> {
        let api_key = config
            .ai_api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| AppError::NotConfigured("Chave da API de IA não configurada.".into()))?;
        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: config.ai_model.clone(),
            api_key: Zeroizing::new(api_key),
        })
    }

    /// Ask for insights on `sales` and return sanitised HTML.
    pub async fn analyze(&self, sales: &[Sale]) -> AppResult<String> {
        if sales.len() < MIN_SALES {
            return Err(AppError::Validation(format!(
                "São necessárias pelo menos {MIN_SALES} vendas para a análise."
            )));
        }
        let prompt = build_prompt(sales)?;
        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, self.model);
        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", self.api_key.as_str())
            .json(&json!({ "contents": [{ "parts": [{ "text": prompt }] }] }))
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            warn!(status = status.as_u16(), "insights request failed");
            return Err(error_from_response(status, &body));
        }
        let text = extract_text(&serde_json::from_str(&body)?)
            .ok_or_else(|| AppError::Decode("insights response has no text".into()))?;
        info!(sales = sales.len(), model = %self.model, "insights generated");
        Ok(sanitize_html(&text))
    }
}

pub fn build_prompt(sales: &[Sale]) -> AppResult<String> {
    let summary: Vec<SaleSummary> = sales
        .iter()
        .map(|s| SaleSummary {
            data: s.date.to_string(),
            valor: s.value,
            comissao: round_cents(commission(s.value)),
        })
        .collect();
    let data = serde_json::to_string(&summary)?;
    Ok(format!(
        "Analise os seguintes dados de vendas de uma loja (formato JSON).\n\
         O objetivo é dar insights curtos e motivacionais para a equipe (Bruno e Daniele).\n\n\
         Dados: {data}\n\n\
         Por favor, forneça:\n\
         1. O dia com melhor performance.\n\
         2. Uma breve tendência (se está subindo ou descendo).\n\
         3. Uma mensagem curta de parabéns sobre o faturamento total.\n\n\
         Mantenha a resposta em HTML simples (sem tags html/body, apenas p, strong, ul, li).\n\
         Use um tom profissional mas amigável."
    ))
}

/// Concatenated text parts of the first candidate.
fn extract_text(response: &Value) -> Option<String> {
    let parts = response.pointer("/candidates/0/content/parts")?.as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    (!text.trim().is_empty()).then_some(text)
}

/// Keep only `p`, `strong`, `ul` and `li` tags, without attributes. Other
/// tags are removed and their text kept, except script and style content.
pub fn sanitize_html(raw: &str) -> String {
    let input = strip_code_fence(raw.trim());
    let mut out = String::with_capacity(input.len());
    let mut dropping: Option<String> = None;
    let mut rest = input;

    while let Some(start) = rest.find('<') {
        let (text, tail) = rest.split_at(start);
        if dropping.is_none() {
            out.push_str(text);
        }
        let Some(end) = tail.find('>') else {
            if dropping.is_none() {
                out.push_str(&tail.replace('<', "&lt;"));
            }
            return out;
        };
        let tag = &tail[1..end];
        rest = &tail[end + 1..];

        let closing = tag.starts_with('/');
        let name: String = tag
            .trim_start_matches('/')
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();

        if let Some(dropped) = &dropping {
            if closing && *dropped == name {
                dropping = None;
            }
            continue;
        }
        if DROPPED_ELEMENTS.contains(&name.as_str()) && !closing {
            dropping = Some(name);
            continue;
        }
        if ALLOWED_TAGS.contains(&name.as_str()) {
            out.push('<');
            if closing {
                out.push('/');
            }
            out.push_str(&name);
            out.push('>');
        }
    }
    if dropping.is_none() {
        out.push_str(rest);
    }
    out.trim().to_string()
}

fn strip_code_fence(text: &str) -> &str {
    let Some(body) = text.strip_prefix("```") else {
        return text;
    };
    let body = body.split_once('\n').map(|(_, b)| b).unwrap_or("");
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}
