//! Paginated category fetching against the Oura usercollection API.

use oura_core::{Category, ConfigError, FetchWindow, Record};
use oura_storage::{FetchError, JsonTransport};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "oura-api";

pub const DEFAULT_BASE_URL: &str = "https://api.ouraring.com/v2/usercollection";

/// Page size requested on every call.
pub const PAGE_LIMIT: u32 = 200;

/// Body keys that conventionally hold the record list, in lookup order.
const RECORD_KEYS: [&str; 2] = ["data", "items"];

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

pub struct CategoryFetcher {
    transport: Box<dyn JsonTransport>,
    base_url: String,
    page_limit: u32,
}

impl CategoryFetcher {
    pub fn new(transport: Box<dyn JsonTransport>) -> Self {
        Self {
            transport,
            base_url: DEFAULT_BASE_URL.to_string(),
            page_limit: PAGE_LIMIT,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn endpoint_url(&self, category: Category) -> String {
        format!("{}{}", self.base_url, category.endpoint())
    }

    /// Fetches every page of `category` inside `window`, following `next_token`
    /// until the API stops returning one. Any failed page fails the whole fetch.
    pub async fn fetch_category(
        &self,
        category: Category,
        window: &FetchWindow,
    ) -> Result<Vec<Record>, FetchError> {
        let url = self.endpoint_url(category);
        let base_query = vec![
            ("start_date".to_string(), window.start_param()),
            ("end_date".to_string(), window.end_param()),
            ("limit".to_string(), self.page_limit.to_string()),
        ];

        let mut records = Vec::new();
        let mut token: Option<String> = None;
        let mut pages = 0usize;
        let mut skipped = 0usize;

        loop {
            let mut query = base_query.clone();
            if let Some(token) = &token {
                query.push(("next_token".to_string(), token.clone()));
            }

            let payload = self.transport.get_json(&url, &query).await?;
            pages += 1;

            let next = next_token(&payload);
            let items = extract_records(payload);
            debug!(category = %category, page = pages, records = items.len(), "fetched page");

            for item in items {
                match Record::from_json(item) {
                    Some(record) => records.push(record),
                    None => skipped += 1,
                }
            }

            match next {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        if skipped > 0 {
            warn!(category = %category, skipped, "ignored list entries that are not JSON objects");
        }
        debug!(category = %category, pages, records = records.len(), "category fetch complete");
        Ok(records)
    }

    /// Resolves `name` before any request is issued, then fetches it.
    pub async fn fetch_named(&self, name: &str, window: &FetchWindow) -> Result<Vec<Record>, ApiError> {
        let category = name.parse::<Category>()?;
        Ok(self.fetch_category(category, window).await?)
    }
}

/// Non-empty continuation token of a response body, if any.
pub fn next_token(payload: &JsonValue) -> Option<String> {
    payload
        .get("next_token")
        .and_then(JsonValue::as_str)
        .filter(|token| !token.is_empty())
        .map(ToString::to_string)
}

/// Pulls the record list out of a response body: `data`, then `items`, then
/// the first list-valued field (endpoints that nest the list under their own name).
pub fn extract_records(payload: JsonValue) -> Vec<JsonValue> {
    let JsonValue::Object(mut body) = payload else {
        return Vec::new();
    };

    for key in RECORD_KEYS {
        if let Some(JsonValue::Array(_)) = body.get(key) {
            if let Some(JsonValue::Array(items)) = body.remove(key) {
                return items;
            }
        }
    }

    body.into_iter()
        .find_map(|(_, value)| match value {
            JsonValue::Array(items) => Some(items),
            _ => None,
        })
        .unwrap_or_default()
}
