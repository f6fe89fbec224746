//! Model server discovery.
//!
//! Pings the configured OpenAI-compatible endpoint and lists the models it
//! serves through `GET /v1/models`.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ServedModel {
    pub id: String,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ServedModel>,
}

pub(crate) fn parse_models(raw: &str) -> Result<Vec<ServedModel>, String> {
    serde_json::from_str::<ModelsResponse>(raw)
        .map(|r| r.data)
        .map_err(|e| format!("Failed to parse model list: {}", e))
}

/// Return the models served at `base_url`, or why they could not be listed.
///
/// Blocking; call it outside the async runtime.
pub fn fetch_models(base_url: &str) -> Result<Vec<ServedModel>, String> {
    if base_url.trim().is_empty() {
        return Err("no model server configured".to_string());
    }
    let url = format!("{}/v1/models", base_url.trim_end_matches('/'));
    let response = reqwest::blocking::get(&url)
        .map_err(|e| format!("Model server unreachable at {}: {}", url, e))?;

    if !response.status().is_success() {
        return Err(format!("Model server returned HTTP {}", response.status()));
    }
    let body = response
        .text()
        .map_err(|e| format!("Failed to read model list: {}", e))?;
    parse_models(&body)
}
