//! Emissions source adapters: request shaping, payload decoding, and fetchers
//! for the Global Emissions API plus a fixture-backed offline variant.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use ghgi_core::{GpcReferenceNumber, InventoryTarget};
use ghgi_storage::{HttpError, HttpFetcher};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

mod fixture;

pub use fixture::{FixtureFetcher, FixtureResponse};

pub const CRATE_NAME: &str = "ghgi-adapters";

/// Which payload shape a source is expected to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadKind {
    Emissions,
    NotationKey,
}

/// Which geography code fills `{locode}` in the endpoint template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchGeography {
    City,
    Region,
    Country,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchRequest {
    pub datasource_id: String,
    pub endpoint: Option<String>,
    pub kind: PayloadKind,
    pub geography: FetchGeography,
    pub city_code: String,
    pub region_code: Option<String>,
    pub country_code: String,
    pub year: i32,
    pub gpc_reference_number: GpcReferenceNumber,
}

impl FetchRequest {
    pub fn new(
        datasource_id: impl Into<String>,
        endpoint: Option<String>,
        kind: PayloadKind,
        geography: FetchGeography,
        target: &InventoryTarget,
        year: i32,
        gpc_reference_number: GpcReferenceNumber,
    ) -> Self {
        Self {
            datasource_id: datasource_id.into(),
            endpoint,
            kind,
            geography,
            city_code: target.city_code.clone(),
            region_code: target.region_code.clone(),
            country_code: target.country_code.clone(),
            year,
            gpc_reference_number,
        }
    }

    pub fn locode(&self) -> Result<&str, FetchError> {
        match self.geography {
            FetchGeography::City => Ok(self.city_code.as_str()),
            FetchGeography::Country => Ok(self.country_code.as_str()),
            FetchGeography::Region => self
                .region_code
                .as_deref()
                .ok_or(FetchError::MissingGeography("region")),
        }
    }

    /// Expand the endpoint template, joining relative templates onto `base_url`.
    pub fn url(&self, base_url: &str) -> Result<String, FetchError> {
        let template = self
            .endpoint
            .as_deref()
            .ok_or_else(|| FetchError::MissingEndpoint(self.datasource_id.clone()))?;
        let locode = self.locode()?;

        let mut url = template
            .replace("{locode}", &path_segment(locode))
            .replace("{city}", &path_segment(&self.city_code))
            .replace("{country}", &path_segment(&self.country_code))
            .replace("{year}", &self.year.to_string())
            .replace("{gpc}", &self.gpc_reference_number.to_string());
        if url.contains("{region}") {
            let region = self
                .region_code
                .as_deref()
                .ok_or(FetchError::MissingGeography("region"))?;
            url = url.replace("{region}", &path_segment(region));
        }

        if url.starts_with("http://") || url.starts_with("https://") {
            Ok(url)
        } else {
            Ok(format!(
                "{}/{}",
                base_url.trim_end_matches('/'),
                url.trim_start_matches('/')
            ))
        }
    }
}

fn path_segment(code: &str) -> String {
    code.trim().replace(' ', "%20")
}

/// Every way a fetch can fail. Never escapes as a panic or a bare string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("no data available")]
    NoData,
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("notation-key payload is missing its reason or explanation")]
    InvalidNotationKey,
    #[error("data source {0} has no api endpoint")]
    MissingEndpoint(String),
    #[error("inventory has no {0} code for this source")]
    MissingGeography(&'static str),
}

impl FetchError {
    /// Stable issue code reported for a failed candidate.
    pub fn issue(&self) -> String {
        match self {
            Self::Request(_) => "fetch_failed".to_string(),
            Self::HttpStatus { status, .. } => format!("http_status_{status}"),
            Self::NoData => "no_data_available".to_string(),
            Self::Malformed(_) => "malformed_payload".to_string(),
            Self::InvalidNotationKey => "invalid_notation_key_data".to_string(),
            Self::MissingEndpoint(_) => "missing_api_endpoint".to_string(),
            Self::MissingGeography(kind) => format!("missing_{kind}_code"),
        }
    }
}

impl From<HttpError> for FetchError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::Status { status: 404, .. } => Self::NoData,
            HttpError::Status { status, url, .. } => Self::HttpStatus { status, url },
            HttpError::Request { .. } => Self::Request(err.to_string()),
        }
    }
}

/// Per-gas totals in kilograms plus CO2e for the reference number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmissionTotals {
    #[serde(default)]
    pub co2_mass: Decimal,
    #[serde(default)]
    pub ch4_mass: Decimal,
    #[serde(default)]
    pub n2o_mass: Decimal,
    pub co2eq_100yr: Decimal,
    #[serde(default)]
    pub co2eq_20yr: Option<Decimal>,
    #[serde(default)]
    pub gpc_quality: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityGasPayload {
    pub gas: String,
    pub mass: Decimal,
    #[serde(default)]
    pub emission_factor_value: Option<Decimal>,
    #[serde(default)]
    pub emission_factor_units: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityPayload {
    pub activity_value: Decimal,
    pub activity_units: String,
    #[serde(default)]
    pub co2eq_100yr: Option<Decimal>,
    #[serde(default)]
    pub gases: Vec<ActivityGasPayload>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmissionsPayload {
    pub totals: EmissionTotals,
    pub records: Vec<ActivityPayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotationKeyPayload {
    pub unavailable_reason: String,
    pub unavailable_explanation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SourcePayload {
    Emissions(EmissionsPayload),
    NotationKey(NotationKeyPayload),
}

#[derive(Debug, Deserialize)]
struct RawTotals {
    emissions: EmissionTotals,
}

#[derive(Debug, Deserialize)]
struct RawEmissionsBody {
    totals: RawTotals,
    #[serde(default)]
    records: Vec<ActivityPayload>,
}

fn non_empty_str<'a>(value: &'a JsonValue, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Decode a response body into the payload shape `kind` expects.
pub fn decode_payload(kind: PayloadKind, body: &[u8]) -> Result<SourcePayload, FetchError> {
    let value: JsonValue =
        serde_json::from_slice(body).map_err(|err| FetchError::Malformed(err.to_string()))?;

    match kind {
        PayloadKind::NotationKey => {
            match (
                non_empty_str(&value, "unavailable_reason"),
                non_empty_str(&value, "unavailable_explanation"),
            ) {
                (Some(reason), Some(explanation)) => {
                    Ok(SourcePayload::NotationKey(NotationKeyPayload {
                        unavailable_reason: reason.to_string(),
                        unavailable_explanation: explanation.to_string(),
                    }))
                }
                _ => Err(FetchError::InvalidNotationKey),
            }
        }
        PayloadKind::Emissions => {
            if value.get("totals").map_or(true, JsonValue::is_null) {
                return Err(FetchError::NoData);
            }
            let raw: RawEmissionsBody = serde_json::from_value(value)
                .map_err(|err| FetchError::Malformed(err.to_string()))?;
            Ok(SourcePayload::Emissions(EmissionsPayload {
                totals: raw.totals.emissions,
                records: raw.records,
            }))
        }
    }
}

#[async_trait]
pub trait EmissionsFetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<SourcePayload, FetchError>;
}

/// Fetcher for the Global Emissions API, sharing one rate-limited HTTP client.
#[derive(Debug, Clone)]
pub struct GlobalApiFetcher {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl GlobalApiFetcher {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl EmissionsFetcher for GlobalApiFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<SourcePayload, FetchError> {
        let url = request.url(&self.base_url)?;
        debug!(datasource_id = %request.datasource_id, %url, "fetching source payload");
        let response = self.http.get(&request.datasource_id, &url).await?;
        decode_payload(request.kind, &response.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ghgi_core::ReportingLevel;
    use rust_decimal_macros::dec;

    fn target() -> InventoryTarget {
        InventoryTarget {
            inventory_id: Default::default(),
            city_id: Default::default(),
            year: Some(2023),
            city_code: "BR SAO".into(),
            region_code: Some("BR-SP".into()),
            country_code: "BR".into(),
            reporting_level: ReportingLevel::Basic,
        }
    }

    fn request(endpoint: &str, geography: FetchGeography) -> FetchRequest {
        FetchRequest::new(
            "edgar-city",
            Some(endpoint.to_string()),
            PayloadKind::Emissions,
            geography,
            &target(),
            2023,
            "I.1.1".parse().unwrap(),
        )
    }

    #[test]
    fn url_template_resolves_locode_per_geography() {
        let template = "/api/v0/source/edgar/city/{locode}/{year}/{gpc}";
        assert_eq!(
            request(template, FetchGeography::City)
                .url("https://api.example.org/")
                .unwrap(),
            "https://api.example.org/api/v0/source/edgar/city/BR%20SAO/2023/I.1.1"
        );
        assert_eq!(
            request(template, FetchGeography::Country)
                .url("https://api.example.org")
                .unwrap(),
            "https://api.example.org/api/v0/source/edgar/city/BR/2023/I.1.1"
        );
        assert_eq!(
            request("https://other.example.org/{region}/{gpc}", FetchGeography::Region)
                .url("https://ignored")
                .unwrap(),
            "https://other.example.org/BR-SP/I.1.1"
        );
    }

    #[test]
    fn missing_endpoint_and_region_are_reported() {
        let mut req = request("/x/{locode}", FetchGeography::Region);
        req.region_code = None;
        assert_eq!(req.url("http://h"), Err(FetchError::MissingGeography("region")));
        req.endpoint = None;
        assert!(matches!(req.url("http://h"), Err(FetchError::MissingEndpoint(_))));
    }

    #[test]
    fn decodes_emissions_with_string_and_number_masses() {
        let body = br#"{
            "totals": {"emissions": {
                "co2_mass": "1500.5", "ch4_mass": 2, "co2eq_100yr": "1600.25",
                "gpc_quality": "medium"
            }},
            "records": [{
                "activity_value": "100", "activity_units": "GJ",
                "gases": [{"gas": "CO2", "mass": "1500.5",
                           "emission_factor_value": "15.005", "emission_factor_units": "kg/GJ"}]
            }]
        }"#;
        let SourcePayload::Emissions(payload) = decode_payload(PayloadKind::Emissions, body).unwrap()
        else {
            panic!("expected emissions payload");
        };
        assert_eq!(payload.totals.co2_mass, dec!(1500.5));
        assert_eq!(payload.totals.ch4_mass, dec!(2));
        assert_eq!(payload.totals.n2o_mass, Decimal::ZERO);
        assert_eq!(payload.totals.co2eq_100yr, dec!(1600.25));
        assert_eq!(payload.records.len(), 1);
        assert_eq!(payload.records[0].gases[0].emission_factor_value, Some(dec!(15.005)));
    }

    #[test]
    fn missing_totals_means_no_data() {
        assert_eq!(
            decode_payload(PayloadKind::Emissions, br#"{"detail": "No data available"}"#),
            Err(FetchError::NoData)
        );
        assert_eq!(
            decode_payload(PayloadKind::Emissions, br#"{"totals": null}"#),
            Err(FetchError::NoData)
        );
    }

    #[test]
    fn malformed_bodies_are_typed_errors() {
        assert!(matches!(
            decode_payload(PayloadKind::Emissions, b"<html>bad gateway</html>"),
            Err(FetchError::Malformed(_))
        ));
        assert!(matches!(
            decode_payload(PayloadKind::Emissions, br#"{"totals": {"emissions": {"co2_mass": "1"}}}"#),
            Err(FetchError::Malformed(_))
        ));
    }

    #[test]
    fn notation_key_requires_both_fields() {
        let ok = decode_payload(
            PayloadKind::NotationKey,
            br#"{"unavailable_reason": "NO", "unavailable_explanation": "no landfills"}"#,
        )
        .unwrap();
        assert_eq!(
            ok,
            SourcePayload::NotationKey(NotationKeyPayload {
                unavailable_reason: "NO".into(),
                unavailable_explanation: "no landfills".into(),
            })
        );

        let missing = decode_payload(PayloadKind::NotationKey, br#"{"unavailable_reason": "NO"}"#);
        assert_eq!(missing, Err(FetchError::InvalidNotationKey));
        assert_eq!(FetchError::InvalidNotationKey.issue(), "invalid_notation_key_data");
    }
}
