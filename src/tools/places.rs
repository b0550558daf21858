//! search_places：SerpStack（Google 搜索）商家查询
//!
//! 解析优先级：local_results（结构化最好）→ related_places → organic_results；
//! 都没有时返回一条 "No results found" 占位记录。API 报错以 `[{"error": ...}]` 返回。

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::{configured, SerpSection};
use crate::tools::{Tool, SEARCH_PLACES_TOOL};

const MAX_PLACES: usize = 10;

static PHONE_RE: OnceLock<Regex> = OnceLock::new();
static RATING_RE: OnceLock<Regex> = OnceLock::new();
static ADDRESS_RE: OnceLock<Regex> = OnceLock::new();

#[derive(Debug, Deserialize)]
struct SearchPlacesArgs {
    city: String,
    place_type: String,
    #[serde(default)]
    query: Option<String>,
}

pub struct PlaceSearchTool {
    client: Client,
    cfg: SerpSection,
}

impl PlaceSearchTool {
    pub fn new(cfg: SerpSection) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { client, cfg }
    }

    async fn search(&self, args: SearchPlacesArgs) -> Result<Value, String> {
        let api_key = configured(&self.cfg.api_key)
            .ok_or_else(|| "SerpStack API key not configured".to_string())?;
        let search_query = args
            .query
            .filter(|q| !q.trim().is_empty())
            .unwrap_or_else(|| format!("{} in {}", args.place_type, args.city));

        let num = self.cfg.num.to_string();
        let resp = self
            .client
            .get(&self.cfg.api_url)
            .query(&[
                ("access_key", api_key),
                ("query", search_query.as_str()),
                ("type", "web"),
                ("num", num.as_str()),
                ("auto_location", "1"),
                ("google_domain", self.cfg.google_domain.as_str()),
                ("gl", self.cfg.country.as_str()),
                ("hl", "en"),
            ])
            .send()
            .await
            .map_err(|e| format!("SerpStack API request error: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("SerpStack API request error: HTTP {}", resp.status()));
        }
        let data: Value = resp
            .json()
            .await
            .map_err(|e| format!("SerpStack API error: {e}"))?;

        Ok(Value::Array(parse_serpstack(&data, &args.place_type, &search_query)))
    }
}

/// 从文本中提取印度格式电话：+91 XXXXX XXXXX 或 XXXXX XXXXX
pub fn extract_phone(text: &str) -> String {
    let re = PHONE_RE
        .get_or_init(|| Regex::new(r"(\+91\s*\d{5}\s*\d{5}|\d{5}\s*\d{5})").unwrap());
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

/// 从 "4.8(407)" 形式提取评分与评价数
fn extract_rating(text: &str) -> (Option<f64>, u64) {
    let re = RATING_RE.get_or_init(|| Regex::new(r"(\d+\.\d+)\((\d+)\)").unwrap());
    match re.captures(text) {
        Some(c) => (
            c.get(1).and_then(|m| m.as_str().parse().ok()),
            c.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0),
        ),
        None => (None, 0),
    }
}

fn extract_address(text: &str) -> String {
    let re = ADDRESS_RE
        .get_or_init(|| Regex::new(r"business\s*·\s*([^·]+?)(?:Closed|Open)").unwrap());
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}

fn str_field<'a>(v: &'a Value, key: &str) -> &'a str {
    v.get(key).and_then(Value::as_str).unwrap_or("")
}

/// 把 SerpStack 响应解析为商家记录列表
pub fn parse_serpstack(data: &Value, place_type: &str, search_query: &str) -> Vec<Value> {
    let success = data
        .get("request")
        .and_then(|r| r.get("success"))
        .and_then(Value::as_bool)
        .unwrap_or(true);
    if !success {
        let info = data
            .get("error")
            .and_then(|e| e.get("info"))
            .and_then(Value::as_str)
            .unwrap_or("Unknown error");
        return vec![json!({"error": format!("SerpStack API error: {info}")})];
    }

    let related = data.get("related_places").and_then(Value::as_array);
    let phone_by_title: HashMap<String, String> = related
        .into_iter()
        .flatten()
        .filter_map(|p| {
            let phone = extract_phone(str_field(p, "places"));
            (!phone.is_empty()).then(|| (str_field(p, "title").trim().to_lowercase(), phone))
        })
        .collect();

    let mut results = Vec::new();
    if let Some(local) = data.get("local_results").and_then(Value::as_array) {
        for place in local.iter().take(MAX_PLACES) {
            let name = place.get("title").and_then(Value::as_str).unwrap_or("Unknown");
            let mut phone = phone_by_title
                .get(&name.trim().to_lowercase())
                .cloned()
                .unwrap_or_default();
            if phone.is_empty() {
                phone = extract_phone(str_field(place, "type"));
            }
            if phone.is_empty() {
                phone = extract_phone(str_field(place, "address"));
            }
            results.push(json!({
                "name": name,
                "address": str_field(place, "address"),
                "phone": phone,
                "rating": place.get("rating").cloned().unwrap_or(Value::Null),
                "reviews_count": place.get("reviews").cloned().unwrap_or(json!(0)),
                "price_level": place.get("price").cloned().unwrap_or(json!({})),
                "type": place_type,
                "extensions": place.get("extensions").cloned().unwrap_or(json!({})),
            }));
        }
    } else if let Some(related) = related {
        for place in related.iter().take(MAX_PLACES) {
            let text = str_field(place, "places");
            let (rating, reviews) = extract_rating(text);
            results.push(json!({
                "name": place.get("title").and_then(Value::as_str).unwrap_or("Unknown"),
                "address": extract_address(text),
                "phone": extract_phone(text),
                "rating": rating,
                "reviews_count": reviews,
                "price_level": {},
                "type": place_type,
                "extensions": {},
            }));
        }
    }

    if results.is_empty() {
        if let Some(organic) = data.get("organic_results").and_then(Value::as_array) {
            for (idx, result) in organic.iter().take(MAX_PLACES).enumerate() {
                results.push(json!({
                    "name": result.get("title").and_then(Value::as_str).unwrap_or("Unknown"),
                    "address": str_field(result, "snippet").chars().take(100).collect::<String>(),
                    "phone": "",
                    "rating": null,
                    "reviews_count": 0,
                    "price_level": {},
                    "type": place_type,
                    "url": str_field(result, "url"),
                    "position": idx + 1,
                    "extensions": {},
                }));
            }
        }
    }

    if results.is_empty() {
        results.push(json!({
            "name": "No results found",
            "address": format!("Try searching for '{search_query}' manually"),
            "type": place_type,
            "placeholder": true,
        }));
    }
    results
}

#[async_trait]
impl Tool for PlaceSearchTool {
    fn name(&self) -> &str {
        SEARCH_PLACES_TOOL
    }

    fn description(&self) -> &str {
        "Search local places via Google (SerpStack). Args: {\"city\": \"Pune\", \"place_type\": \"gym\", \"query\": optional}."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "city": {"type": "string"},
                "place_type": {"type": "string"},
                "query": {"type": "string"}
            },
            "required": ["city", "place_type"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let args: SearchPlacesArgs =
            serde_json::from_value(args).map_err(|e| format!("Invalid args: {e}"))?;
        tracing::info!(city = %args.city, place_type = %args.place_type, "search_places");
        self.search(args).await
    }
}
