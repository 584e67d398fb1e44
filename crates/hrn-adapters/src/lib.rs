//! External collaborators: survey data source, geocoder, map-layer publisher.

use std::collections::BTreeMap;

use async_trait::async_trait;
use hrn_core::{Coordinates, RawRecord};
use hrn_storage::{FetchError, HttpFetcher, SnapshotTable};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// One row of the survey project's data dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMetadata {
    pub field_name: String,
    pub field_type: String,
    pub select_choices: String,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed {what} payload: {detail}")]
    Malformed { what: &'static str, detail: String },
}

/// Inbound survey system. Fetch returns the raw payload bytes so the
/// pipeline can archive them before parsing.
#[async_trait]
pub trait SiteSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_metadata(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
    ) -> Result<Vec<u8>, SourceError>;

    async fn fetch_records(&self, http: &HttpFetcher, run_id: Uuid)
        -> Result<Vec<u8>, SourceError>;
}

/// REDCap API client: flat JSON record export plus the metadata export.
#[derive(Debug, Clone)]
pub struct RedcapClient {
    api_url: String,
    api_token: String,
}

impl RedcapClient {
    pub fn new(api_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            api_token: api_token.into(),
        }
    }

    fn export_form(&self, content: &str) -> Vec<(String, String)> {
        let mut form = vec![
            ("token".to_string(), self.api_token.clone()),
            ("content".to_string(), content.to_string()),
            ("format".to_string(), "json".to_string()),
        ];
        if content == "record" {
            form.push(("type".to_string(), "flat".to_string()));
        }
        form
    }
}

#[async_trait]
impl SiteSource for RedcapClient {
    fn source_id(&self) -> &'static str {
        "redcap"
    }

    async fn fetch_metadata(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
    ) -> Result<Vec<u8>, SourceError> {
        let response = http
            .post_form(run_id, self.source_id(), &self.api_url, &self.export_form("metadata"))
            .await?;
        Ok(response.body)
    }

    async fn fetch_records(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
    ) -> Result<Vec<u8>, SourceError> {
        let response = http
            .post_form(run_id, self.source_id(), &self.api_url, &self.export_form("record"))
            .await?;
        Ok(response.body)
    }
}

fn coerce_value(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        JsonValue::Bool(true) => "1".to_string(),
        JsonValue::Bool(false) => "0".to_string(),
        other => other.to_string(),
    }
}

/// Parses the flat record export. Every field value is coerced to the raw
/// string form the rest of the pipeline works with.
pub fn parse_records(bytes: &[u8]) -> Result<Vec<RawRecord>, SourceError> {
    let rows: Vec<BTreeMap<String, JsonValue>> =
        serde_json::from_slice(bytes).map_err(|err| SourceError::Malformed {
            what: "record",
            detail: err.to_string(),
        })?;

    Ok(rows
        .into_iter()
        .map(|row| RawRecord::from_pairs(row.iter().map(|(k, v)| (k.clone(), coerce_value(v)))))
        .collect())
}

/// Parses the metadata export into dictionary rows. Entries without a field
/// name are skipped rather than failing the export.
pub fn parse_metadata(bytes: &[u8]) -> Result<Vec<FieldMetadata>, SourceError> {
    let rows: Vec<BTreeMap<String, JsonValue>> =
        serde_json::from_slice(bytes).map_err(|err| SourceError::Malformed {
            what: "metadata",
            detail: err.to_string(),
        })?;

    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let field_name = row
                .get("field_name")
                .map(coerce_value)
                .filter(|name| !name.trim().is_empty())?;
            Some(FieldMetadata {
                field_name,
                field_type: row.get("field_type").map(coerce_value).unwrap_or_default(),
                select_choices: row
                    .get("select_choices_or_calculations")
                    .map(coerce_value)
                    .unwrap_or_default(),
            })
        })
        .collect())
}

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed geocoder response: {0}")]
    Malformed(String),
}

/// Paid coordinate lookup. An empty candidate list is a valid "not found"
/// response, not an error.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
        address: &str,
    ) -> Result<Option<Coordinates>, GeocodeError>;
}

const MAPBOX_PLACES_URL: &str = "https://api.mapbox.com/geocoding/v5/mapbox.places/";

#[derive(Debug, Clone)]
pub struct MapboxGeocoder {
    access_token: String,
}

impl MapboxGeocoder {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
        }
    }

    fn request_url(&self, address: &str) -> reqwest::Url {
        let mut url = reqwest::Url::parse(MAPBOX_PLACES_URL).expect("places base url is valid");
        url.path_segments_mut()
            .expect("places base url can be a base")
            .push(&format!("{address}.json"));
        url.query_pairs_mut()
            .append_pair("access_token", &self.access_token)
            .append_pair("limit", "1");
        url
    }
}

#[derive(Debug, Deserialize)]
struct PlacesResponse {
    #[serde(default)]
    features: Vec<PlaceFeature>,
}

#[derive(Debug, Deserialize)]
struct PlaceFeature {
    geometry: PlaceGeometry,
}

#[derive(Debug, Deserialize)]
struct PlaceGeometry {
    // Mapbox order: [longitude, latitude].
    coordinates: [f64; 2],
}

/// Top-ranked candidate's coordinates, or `None` when nothing matched.
pub fn parse_geocode_response(bytes: &[u8]) -> Result<Option<Coordinates>, GeocodeError> {
    let response: PlacesResponse =
        serde_json::from_slice(bytes).map_err(|err| GeocodeError::Malformed(err.to_string()))?;
    Ok(response.features.first().map(|feature| Coordinates {
        latitude: feature.geometry.coordinates[1],
        longitude: feature.geometry.coordinates[0],
    }))
}

#[async_trait]
impl Geocoder for MapboxGeocoder {
    async fn geocode(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
        address: &str,
    ) -> Result<Option<Coordinates>, GeocodeError> {
        let url = self.request_url(address);
        let response = http.get(run_id, "mapbox", url.as_str()).await?;
        parse_geocode_response(&response.body)
    }
}

const ARCGIS_PUBLIC_PORTAL: &str = "https://www.arcgis.com";
const ARCGIS_ADD_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone)]
pub struct ArcgisConfig {
    pub username: String,
    pub password: String,
    pub org_url: String,
    pub layer_url: String,
}

impl ArcgisConfig {
    /// `None` when the publisher is not configured; publication is optional
    /// and never blocks the snapshot.
    pub fn from_env() -> Option<Self> {
        let username = std::env::var("ARCGIS_USERNAME").ok()?;
        let password = std::env::var("ARCGIS_PASSWORD").ok()?;
        let layer_url = std::env::var("ARCGIS_LAYER_URL").ok()?;
        let org_url = std::env::var("ARCGIS_ORG_URL")
            .unwrap_or_else(|_| ARCGIS_PUBLIC_PORTAL.to_string());
        Some(Self {
            username,
            password,
            org_url,
            layer_url,
        })
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("arcgis login failed: {0}")]
    Login(String),
    #[error("malformed arcgis response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Default)]
pub struct PublishSummary {
    pub features_total: usize,
    pub features_added: usize,
    pub batches: usize,
    pub failed_batches: usize,
}

/// One feature per geocoded snapshot row, carrying every snapshot column as
/// an attribute. Identity and coordinate columns keep their numeric types;
/// everything else publishes as the snapshot's string form.
pub fn feature_from_row(headers: &[String], row: &[String]) -> Option<JsonValue> {
    let cell = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .and_then(|i| row.get(i))
            .map(String::as_str)
    };

    if cell("geocoded") != Some("true") {
        return None;
    }
    let latitude: f64 = cell("latitude")?.parse().ok()?;
    let longitude: f64 = cell("longitude")?.parse().ok()?;

    let mut attributes = serde_json::Map::new();
    for (header, value) in headers.iter().zip(row.iter()) {
        let typed = match header.as_str() {
            "record_id" | "zip_code" => json!(value.parse::<i64>().unwrap_or(0)),
            "latitude" | "longitude" => json!(value.parse::<f64>().unwrap_or(0.0)),
            _ => json!(value),
        };
        attributes.insert(header.clone(), typed);
    }

    Some(json!({
        "geometry": {
            "x": longitude,
            "y": latitude,
            "spatialReference": {"wkid": 4326},
        },
        "attributes": JsonValue::Object(attributes),
    }))
}

/// Publication sink: full delete-then-insert re-sync of the hosted feature
/// layer from the accepted snapshot.
#[derive(Debug, Clone)]
pub struct ArcgisPublisher {
    config: ArcgisConfig,
}

impl ArcgisPublisher {
    pub fn new(config: ArcgisConfig) -> Self {
        Self { config }
    }

    async fn generate_token(&self, http: &HttpFetcher, run_id: Uuid) -> Result<String, PublishError> {
        let mut portals = vec![ARCGIS_PUBLIC_PORTAL.to_string()];
        if self.config.org_url != ARCGIS_PUBLIC_PORTAL {
            portals.push(self.config.org_url.clone());
        }

        let mut last_error = String::from("no portal responded");
        for portal in portals {
            let url = format!("{portal}/sharing/rest/generateToken");
            let form = vec![
                ("username".to_string(), self.config.username.clone()),
                ("password".to_string(), self.config.password.clone()),
                ("referer".to_string(), portal.clone()),
                ("f".to_string(), "json".to_string()),
            ];
            let response = http.post_form(run_id, "arcgis", &url, &form).await?;
            let value: JsonValue = serde_json::from_slice(&response.body)
                .map_err(|err| PublishError::Malformed(err.to_string()))?;

            if let Some(token) = value.get("token").and_then(|t| t.as_str()) {
                return Ok(token.to_string());
            }

            last_error = value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("missing token in response")
                .to_string();
            warn!(%portal, error = %last_error, "arcgis token request rejected");
        }

        Err(PublishError::Login(last_error))
    }

    /// Replaces the layer's features with the geocoded rows of the given
    /// snapshot table. Per-batch insert failures are counted, not fatal.
    pub async fn publish(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
        table: &SnapshotTable,
    ) -> Result<PublishSummary, PublishError> {
        let features: Vec<JsonValue> = table
            .rows
            .iter()
            .filter_map(|row| feature_from_row(&table.headers, row))
            .collect();
        let token = self.generate_token(http, run_id).await?;

        let delete_url = format!("{}/deleteFeatures", self.config.layer_url);
        let delete_form = vec![
            ("where".to_string(), "1=1".to_string()),
            ("f".to_string(), "json".to_string()),
            ("token".to_string(), token.clone()),
        ];
        let delete_response = http.post_form(run_id, "arcgis", &delete_url, &delete_form).await?;
        if let Ok(value) = serde_json::from_slice::<JsonValue>(&delete_response.body) {
            if let Some(error) = value.get("error") {
                warn!(%error, "arcgis deleteFeatures reported an error; continuing with insert");
            }
        }

        let mut summary = PublishSummary {
            features_total: features.len(),
            ..PublishSummary::default()
        };

        let add_url = format!("{}/addFeatures", self.config.layer_url);
        for batch in features.chunks(ARCGIS_ADD_BATCH_SIZE) {
            summary.batches += 1;
            let payload = serde_json::to_string(batch)
                .map_err(|err| PublishError::Malformed(err.to_string()))?;
            let form = vec![
                ("features".to_string(), payload),
                ("f".to_string(), "json".to_string()),
                ("token".to_string(), token.clone()),
            ];
            let response = http.post_form(run_id, "arcgis", &add_url, &form).await?;
            let value: JsonValue = serde_json::from_slice(&response.body)
                .map_err(|err| PublishError::Malformed(err.to_string()))?;

            match value.get("addResults").and_then(|r| r.as_array()) {
                Some(results) => {
                    summary.features_added += results
                        .iter()
                        .filter(|r| r.get("success").and_then(|s| s.as_bool()).unwrap_or(false))
                        .count();
                }
                None => {
                    summary.failed_batches += 1;
                    warn!(body = %value, "arcgis addFeatures batch rejected");
                }
            }
        }

        Ok(summary)
    }
}
