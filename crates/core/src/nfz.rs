//! NFZ Public API Client
//!
//! A thin async client for the treatment waiting-times API of the Polish
//! National Health Fund (`app-itl-api`). It backs the visit-search tool and,
//! through its locality dictionary, the [`RegionLookup`] used by the
//! locality resolver.

use crate::resolver::{RegionLookup, find_province};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::{debug, error};

pub const DEFAULT_BASE_URL: &str = "https://api.nfz.gov.pl/app-itl-api";
pub const DEFAULT_API_VERSION: &str = "1.3";

/// Most visits included in a formatted answer.
const MAX_FORMATTED_VISITS: usize = 5;

/// Benefit names the API knows, keyed by their canonical upper-case form.
pub const COMMON_BENEFITS: [(&str, &str); 25] = [
    ("PORADNIA KARDIOLOGICZNA", "Poradnia kardiologiczna"),
    ("PORADNIA OKULISTYCZNA", "Poradnia okulistyczna"),
    ("PORADNIA NEUROLOGICZNA", "Poradnia neurologiczna"),
    ("PORADNIA ORTOPEDYCZNA", "Poradnia ortopedyczna"),
    ("PORADNIA GINEKOLOGICZNO-POŁOŻNICZA", "Poradnia ginekologiczno-położnicza"),
    ("PORADNIA UROLOGICZNA", "Poradnia urologiczna"),
    ("PORADNIA CHIRURGII OGÓLNEJ", "Poradnia chirurgii ogólnej"),
    ("PORADNIA OTOLARYNGOLOGICZNA", "Poradnia otolaryngologiczna"),
    ("PORADNIA DERMATOLOGICZNA", "Poradnia dermatologiczna"),
    ("PORADNIA ENDOKRYNOLOGICZNA", "Poradnia endokrynologiczna"),
    ("PORADNIA DIABETOLOGICZNA", "Poradnia diabetologiczna"),
    ("PORADNIA GASTROENTEROLOGICZNA", "Poradnia gastroenterologiczna"),
    ("PORADNIA REUMATOLOGICZNA", "Poradnia reumatologiczna"),
    ("PORADNIA PULMONOLOGICZNA", "Poradnia pulmonologiczna"),
    ("PORADNIA ZDROWIA PSYCHICZNEGO", "Poradnia zdrowia psychicznego"),
    ("ODDZIAŁ CHORÓB WEWNĘTRZNYCH", "Oddział chorób wewnętrznych"),
    ("ODDZIAŁ KARDIOLOGICZNY", "Oddział kardiologiczny"),
    ("REHABILITACJA KARDIOLOGICZNA", "Rehabilitacja kardiologiczna"),
    ("ODDZIAŁ CHIRURGII OGÓLNEJ", "Oddział chirurgii ogólnej"),
    ("ODDZIAŁ ORTOPEDYCZNY", "Oddział ortopedyczny"),
    ("TOMOGRAFIA KOMPUTEROWA", "Tomografia komputerowa"),
    ("REZONANS MAGNETYCZNY", "Rezonans magnetyczny"),
    (
        "BADANIA ENDOSKOPOWE PRZEWODU POKARMOWEGO - GASTROSKOPIA",
        "Gastroskopia",
    ),
    (
        "BADANIA ENDOSKOPOWE PRZEWODU POKARMOWEGO - KOLONOSKOPIA",
        "Kolonoskopia",
    ),
    ("PORADNIA STOMATOLOGICZNA", "Poradnia stomatologiczna"),
];

/// Urgency of the referral: stable (1) or urgent (2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseType {
    Stable = 1,
    Urgent = 2,
}

/// Query parameters of `GET /queues`. `None` fields are left out.
#[derive(Debug, Clone, Default)]
pub struct QueueSearchParams {
    pub case: Option<CaseType>,
    pub province: Option<String>,
    pub benefit: Option<String>,
    pub benefit_for_children: Option<bool>,
    pub provider: Option<String>,
    pub place: Option<String>,
    pub street: Option<String>,
    pub locality: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl QueueSearchParams {
    fn query(&self) -> Vec<(&'static str, Option<String>)> {
        vec![
            ("case", self.case.map(|c| (c as u8).to_string())),
            ("province", self.province.clone()),
            ("benefit", self.benefit.clone()),
            ("benefitForChildren", self.benefit_for_children.map(|b| b.to_string())),
            ("provider", self.provider.clone()),
            ("place", self.place.clone()),
            ("street", self.street.clone()),
            ("locality", self.locality.clone()),
            ("page", self.page.map(|p| p.to_string())),
            ("limit", self.limit.map(|l| l.to_string())),
            ("format", Some("json".to_string())),
        ]
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct QueueDates {
    #[serde(default)]
    pub applicable: bool,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub date_situation_as_at: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProviderStatistics {
    #[serde(default)]
    pub awaiting: Option<i64>,
    #[serde(default)]
    pub removed: Option<i64>,
    #[serde(default)]
    pub average_period: Option<i64>,
    #[serde(default)]
    pub update: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct QueueStatistics {
    #[serde(default)]
    pub provider_data: Option<ProviderStatistics>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct QueueAttributes {
    #[serde(default)]
    pub case: Option<u8>,
    #[serde(default)]
    pub benefit: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub place: Option<String>,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub locality: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub benefits_for_children: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub statistics: Option<QueueStatistics>,
    #[serde(default)]
    pub dates: Option<QueueDates>,
}

/// One provider's waiting list for a benefit.
#[derive(Debug, Clone, Deserialize)]
pub struct Queue {
    #[serde(default)]
    pub r#type: String,
    pub id: String,
    pub attributes: QueueAttributes,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueuesResponse {
    #[serde(default)]
    pub meta: Value,
    #[serde(default)]
    pub links: Value,
    #[serde(default)]
    pub data: Vec<Queue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueResponse {
    #[serde(default)]
    pub meta: Value,
    pub data: Queue,
}

#[derive(Debug, Clone, Deserialize)]
struct DictionaryResponse {
    #[serde(default)]
    data: Vec<Value>,
}

pub struct NfzApiClient {
    http: reqwest::Client,
    base_url: String,
    api_version: String,
}

impl Default for NfzApiClient {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL, DEFAULT_API_VERSION)
    }
}

impl NfzApiClient {
    pub fn new(base_url: impl Into<String>, api_version: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_version: api_version.into(),
        }
    }

    fn build_url(&self, endpoint: &str, params: &[(&str, Option<String>)]) -> Result<Url> {
        let mut url = Url::parse(&format!("{}{}", self.base_url, endpoint))
            .with_context(|| format!("Invalid NFZ API URL for endpoint '{endpoint}'"))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("api-version", &self.api_version);
            for (key, value) in params {
                if let Some(value) = value {
                    query.append_pair(key, value);
                }
            }
        }
        Ok(url)
    }

    async fn request<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, Option<String>)],
    ) -> Result<T> {
        let url = self.build_url(endpoint, params)?;
        debug!(%url, "NFZ API request");

        let response = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("NFZ API request to '{endpoint}' failed"))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read NFZ API response body")?;
        if !status.is_success() {
            error!(%status, endpoint, "NFZ API request failed");
            bail!("NFZ API request failed: {status} - {body}");
        }

        let value: Value =
            serde_json::from_str(&body).context("NFZ API returned invalid JSON")?;
        check_api_errors(&value)?;
        serde_json::from_value(value)
            .with_context(|| format!("Unexpected NFZ API response shape from '{endpoint}'"))
    }

    /// Treatment waiting lists matching `params`.
    pub async fn get_queues(&self, params: &QueueSearchParams) -> Result<QueuesResponse> {
        self.request("/queues", &params.query()).await
    }

    pub async fn get_queue(&self, queue_id: &str) -> Result<QueueResponse> {
        self.request(&format!("/queues/{queue_id}"), &[]).await
    }

    /// API version information, returned as-is.
    pub async fn get_api_info(&self) -> Result<Value> {
        self.request("/version", &[]).await
    }

    /// Whether the locality dictionary of `province` holds `locality`.
    pub async fn find_locality(&self, locality: &str, province: &str) -> Result<bool> {
        let response: DictionaryResponse = self
            .request(
                "/localities",
                &[
                    ("province", Some(province.to_string())),
                    ("name", Some(locality.to_string())),
                    ("format", Some("json".to_string())),
                ],
            )
            .await?;
        Ok(response
            .data
            .iter()
            .filter_map(dictionary_entry_name)
            .any(|name| name.to_lowercase() == locality.to_lowercase()))
    }
}

#[async_trait]
impl RegionLookup for NfzApiClient {
    async fn locality_exists(&self, locality: &str, region_code: &str) -> Result<bool> {
        self.find_locality(locality, region_code).await
    }
}

/// Dictionary entries are plain strings; tolerate `{ "attributes": { "name": .. } }` too.
fn dictionary_entry_name(entry: &Value) -> Option<&str> {
    entry.as_str().or_else(|| {
        entry
            .get("attributes")
            .and_then(|a| a.get("name"))
            .or_else(|| entry.get("name"))
            .and_then(Value::as_str)
    })
}

/// Turns an `errors` payload into an error carrying its reason and solution.
fn check_api_errors(value: &Value) -> Result<()> {
    let Some(errors) = value.get("errors") else {
        return Ok(());
    };
    let first = errors.get(0).unwrap_or(errors);
    let reason = first
        .get("error-reason")
        .and_then(Value::as_str)
        .unwrap_or("unknown reason");
    let solution = first
        .get("error-solution")
        .and_then(Value::as_str)
        .unwrap_or("no solution given");
    bail!("NFZ API error: {reason} - {solution}")
}

/// Normalises a free-text service name to a benefit key: an exact key, then
/// a known display name containing the text, else the upper-cased input.
pub fn benefit_key(medical_service: &str) -> String {
    let service = medical_service.trim();
    let upper = service.to_uppercase();
    if COMMON_BENEFITS.iter().any(|(key, _)| *key == upper) {
        return upper;
    }
    let lower = service.to_lowercase();
    COMMON_BENEFITS
        .iter()
        .find(|(_, display)| display.to_lowercase().contains(&lower))
        .map(|(key, _)| key.to_string())
        .unwrap_or(upper)
}

/// Normalises a province name to its code; anything unrecognised is passed
/// through for the API to judge.
pub fn province_code(province: &str) -> String {
    find_province(province)
        .map(|p| p.code.to_string())
        .unwrap_or_else(|| province.trim().to_string())
}

/// Stable-case waiting lists for a service in a province.
pub async fn find_available_visits(
    client: &NfzApiClient,
    province: &str,
    medical_service: &str,
    for_children: bool,
    limit: u32,
) -> Result<Vec<Queue>> {
    let params = QueueSearchParams {
        case: Some(CaseType::Stable),
        province: Some(province_code(province)),
        benefit: Some(benefit_key(medical_service)),
        benefit_for_children: Some(for_children),
        limit: Some(limit),
        ..Default::default()
    };
    Ok(client.get_queues(&params).await?.data)
}

pub fn format_visit_results(queues: &[Queue]) -> String {
    if queues.is_empty() {
        return "No available visits found for the specified criteria.".to_string();
    }

    let mut result = format!("Found {} available visits:\n\n", queues.len());
    for (i, queue) in queues.iter().take(MAX_FORMATTED_VISITS).enumerate() {
        let attrs = &queue.attributes;
        let date = attrs
            .dates
            .as_ref()
            .and_then(|d| d.date.as_deref())
            .unwrap_or("unknown");
        result.push_str(&format!("{}. {} in {}\n", i + 1, attrs.provider, attrs.locality));
        result.push_str(&format!("   Address: {}\n", attrs.address));
        result.push_str(&format!("   Phone: {}\n", attrs.phone));
        result.push_str(&format!("   Available date: {date}\n\n"));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue(provider: &str, date: &str) -> Queue {
        serde_json::from_value(json!({
            "type": "queue",
            "id": format!("id-{provider}"),
            "attributes": {
                "case": 1,
                "benefit": "PORADNIA KARDIOLOGICZNA",
                "provider": provider,
                "address": "UL. DŁUGA 1",
                "locality": "KRAKÓW",
                "phone": "+48 12 000 00 00",
                "many-places": "N",
                "dates": { "applicable": true, "date": date, "date-situation-as-at": "2024-05-01" }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_build_url_adds_version_and_skips_missing_params() {
        let client = NfzApiClient::new("https://example.test/api/", "1.3");
        let params = QueueSearchParams {
            case: Some(CaseType::Stable),
            benefit: Some("PORADNIA CHIRURGII OGÓLNEJ".into()),
            benefit_for_children: Some(false),
            ..Default::default()
        };
        let url = client.build_url("/queues", &params.query()).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();

        assert_eq!(url.path(), "/api/queues");
        assert_eq!(pairs[0], ("api-version".into(), "1.3".into()));
        assert!(pairs.contains(&("case".into(), "1".into())));
        assert!(pairs.contains(&("benefit".into(), "PORADNIA CHIRURGII OGÓLNEJ".into())));
        assert!(pairs.contains(&("benefitForChildren".into(), "false".into())));
        assert!(pairs.contains(&("format".into(), "json".into())));
        assert!(!pairs.iter().any(|(k, _)| k == "province"));
    }

    #[test]
    fn test_api_errors_are_reported() {
        assert!(check_api_errors(&json!({ "data": [] })).is_ok());
        let err = check_api_errors(&json!({
            "errors": [{ "error-reason": "Bad province", "error-solution": "Use 01-16" }]
        }))
        .unwrap_err();
        assert_eq!(err.to_string(), "NFZ API error: Bad province - Use 01-16");
    }

    #[test]
    fn test_benefit_key_normalisation() {
        assert_eq!(benefit_key("poradnia kardiologiczna"), "PORADNIA KARDIOLOGICZNA");
        assert_eq!(
            benefit_key("kolonoskopia"),
            "BADANIA ENDOSKOPOWE PRZEWODU POKARMOWEGO - KOLONOSKOPIA"
        );
        assert_eq!(benefit_key("okulist"), "PORADNIA OKULISTYCZNA");
        assert_eq!(benefit_key("Poradnia alergologiczna"), "PORADNIA ALERGOLOGICZNA");
    }

    #[test]
    fn test_province_code_normalisation() {
        assert_eq!(province_code("Małopolskie"), "06");
        assert_eq!(province_code("07"), "07");
        assert_eq!(province_code("Nowhere"), "Nowhere");
    }

    #[test]
    fn test_dictionary_entries() {
        assert_eq!(dictionary_entry_name(&json!("KRAKÓW")), Some("KRAKÓW"));
        assert_eq!(
            dictionary_entry_name(&json!({ "attributes": { "name": "SUCHA" } })),
            Some("SUCHA")
        );
        assert_eq!(dictionary_entry_name(&json!(42)), None);
    }

    #[test]
    fn test_format_visit_results() {
        assert_eq!(
            format_visit_results(&[]),
            "No available visits found for the specified criteria."
        );

        let queues: Vec<Queue> = (1..=7).map(|i| queue(&format!("SZPITAL {i}"), "2024-06-01")).collect();
        let text = format_visit_results(&queues);
        assert!(text.starts_with("Found 7 available visits:"));
        assert!(text.contains("1. SZPITAL 1 in KRAKÓW\n   Address: UL. DŁUGA 1\n"));
        assert!(text.contains("5. SZPITAL 5"));
        assert!(!text.contains("6. SZPITAL 6"));
        assert!(text.contains("Available date: 2024-06-01"));
    }
}
