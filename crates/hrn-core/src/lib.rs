//! Core domain model for the Heat Relief Network site registry.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Weekday display names, Monday-first to match the survey's 1-indexed
/// `days_open` checkbox group.
pub const DAY_NAMES: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

/// One flat row from the survey export: every field is a raw string or code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    values: BTreeMap<String, String>,
}

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.values.insert(field.into(), value.into());
    }

    /// Missing fields and empty-after-trim values both read as absent.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.values
            .get(field)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Whether the column exists on this row at all, populated or not.
    pub fn has_column(&self, field: &str) -> bool {
        self.values.contains_key(field)
    }

    pub fn is_checked(&self, field: &str) -> bool {
        self.get(field) == Some("1")
    }

    /// The upstream-assigned site identity. Zero and unparseable values are
    /// treated as absent.
    pub fn record_id(&self) -> Option<u32> {
        self.get("record_id")
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|id| *id > 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// Review lifecycle of a submitted site. Codes are resolved through the
/// fetched data dictionary; anything unmapped falls back to `Pending`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewStatus {
    #[default]
    #[serde(rename = "Pending")]
    Pending,
    #[serde(rename = "Under Review")]
    UnderReview,
    #[serde(rename = "Accepted")]
    Accepted,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "Pending",
            ReviewStatus::UnderReview => "Under Review",
            ReviewStatus::Accepted => "Accepted",
        }
    }

    /// Maps a decoded choice label onto the lifecycle enum. Unrecognized
    /// labels never fail a record; they resolve to `Pending`.
    pub fn from_label(label: &str) -> Self {
        let normalized = label.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "accepted" => ReviewStatus::Accepted,
            "under review" => ReviewStatus::UnderReview,
            _ => ReviewStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSource {
    #[default]
    #[serde(rename = "preseason")]
    Preseason,
    #[serde(rename = "in-season update")]
    InSeasonUpdate,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::Preseason => "preseason",
            DataSource::InSeasonUpdate => "in-season update",
        }
    }
}

/// Weekly operating hours. `open_days` and `day_hours` are Monday-first.
/// Per-day ranges keep the raw 24-hour form (`"08:00 - 17:00"`); the
/// human-readable `full_schedule` uses 12-hour rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklySchedule {
    pub same_hours_everyday: bool,
    pub opening_time: String,
    pub closing_time: String,
    pub open_days: [bool; 7],
    pub day_hours: [String; 7],
    pub full_schedule: String,
}

impl Default for WeeklySchedule {
    fn default() -> Self {
        Self {
            same_hours_everyday: false,
            opening_time: String::new(),
            closing_time: String::new(),
            open_days: [false; 7],
            day_hours: std::array::from_fn(|_| String::new()),
            full_schedule: String::new(),
        }
    }
}

impl WeeklySchedule {
    /// Open day names as a display list, e.g. `"Monday, Wednesday"`.
    pub fn days_open_list(&self) -> String {
        DAY_NAMES
            .iter()
            .zip(self.open_days.iter())
            .filter(|(_, open)| **open)
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// One boolean capability derived from a checkbox-group member, e.g.
/// `has_charging` for the "Charging" option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceFlag {
    pub key: String,
    pub label: String,
    pub enabled: bool,
}

impl ServiceFlag {
    /// Flag key for a choice label: lower-cased, spaces and hyphens folded
    /// to underscores, prefixed with `has_`.
    pub fn key_for_label(label: &str) -> String {
        let mut key = String::from("has_");
        for ch in label.trim().chars() {
            if ch.is_ascii_alphanumeric() {
                key.push(ch.to_ascii_lowercase());
            } else if ch == ' ' || ch == '-' || ch == '_' {
                key.push('_');
            }
        }
        key
    }
}

/// Canonical reconciled representation of one service site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteRecord {
    pub record_id: u32,
    pub organization_name: String,
    pub site_name: String,
    pub site_type: String,
    pub contact_email: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    pub full_address: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub geocoded: bool,
    pub schedule: WeeklySchedule,
    pub services: Vec<ServiceFlag>,
    pub special_closure_dates: String,
    pub review_status: ReviewStatus,
    pub data_source: DataSource,
    pub last_updated: DateTime<Utc>,
}

impl SiteRecord {
    /// Empty shell for a site identity; the normalizer fills every field.
    pub fn new(record_id: u32, last_updated: DateTime<Utc>) -> Self {
        Self {
            record_id,
            organization_name: String::new(),
            site_name: String::new(),
            site_type: String::new(),
            contact_email: String::new(),
            address: String::new(),
            city: String::new(),
            state: String::new(),
            zip_code: String::new(),
            full_address: String::new(),
            latitude: None,
            longitude: None,
            geocoded: false,
            schedule: WeeklySchedule::default(),
            services: Vec::new(),
            special_closure_dates: String::new(),
            review_status: ReviewStatus::Pending,
            data_source: DataSource::Preseason,
            last_updated,
        }
    }

    pub fn compose_full_address(address: &str, city: &str, state: &str, zip: &str) -> String {
        format!("{address}, {city}, {state} {zip}")
    }

    /// Comma list of enabled service labels, in data-dictionary order.
    pub fn services_offered(&self) -> String {
        self.services
            .iter()
            .filter(|flag| flag.enabled)
            .map(|flag| flag.label.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn coordinates(&self) -> Option<Coordinates> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(Coordinates {
                latitude,
                longitude,
            }),
            _ => None,
        }
    }

    pub fn set_coordinates(&mut self, coords: Coordinates) {
        self.latitude = Some(coords.latitude);
        self.longitude = Some(coords.longitude);
        self.geocoded = true;
    }
}
