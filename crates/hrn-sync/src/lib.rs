//! Reconciliation pipeline: schema mapping, base/update partitioning, site
//! normalization, most-recent-wins update folding, cached geocoding, and
//! snapshot publication.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Utc, Weekday};
use hrn_adapters::{
    parse_metadata, parse_records, FieldMetadata, Geocoder, MapboxGeocoder, RedcapClient,
    SiteSource,
};
use hrn_core::{
    DataSource, RawRecord, ReviewStatus, ServiceFlag, SiteRecord, WeeklySchedule, DAY_NAMES,
};
use hrn_storage::{GeocodeCache, HttpClientConfig, HttpFetcher, PayloadArchive, SnapshotStore};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub redcap_api_url: String,
    pub redcap_api_token: String,
    pub mapbox_token: Option<String>,
    pub data_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub season_year: i32,
    pub default_state: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            redcap_api_url: std::env::var("REDCAP_API_URL").unwrap_or_default(),
            redcap_api_token: std::env::var("REDCAP_API_TOKEN").unwrap_or_default(),
            mapbox_token: std::env::var("MAPBOX_API_TOKEN")
                .ok()
                .filter(|token| !token.is_empty()),
            data_dir: std::env::var("HRN_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            artifacts_dir: std::env::var("HRN_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
            season_year: std::env::var("HRN_SEASON_YEAR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(|| Utc::now().year()),
            default_state: std::env::var("HRN_DEFAULT_STATE").unwrap_or_else(|_| "AZ".to_string()),
            user_agent: std::env::var("HRN_USER_AGENT")
                .unwrap_or_else(|_| "hrn-pipeline/0.1".to_string()),
            http_timeout_secs: std::env::var("HRN_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }
}

/// A non-fatal problem local to one record, surfaced in the run summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordIssue {
    pub record_id: Option<u32>,
    pub message: String,
}

impl RecordIssue {
    fn new(record_id: Option<u32>, message: impl Into<String>) -> Self {
        Self {
            record_id,
            message: message.into(),
        }
    }
}

/// Integer-looking codes compare by numeric value (`"01"` matches `"1"`);
/// anything else by its trimmed text.
fn normalize_code(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.parse::<i64>() {
        Ok(code) => code.to_string(),
        Err(_) => trimmed.to_string(),
    }
}

/// `"code1, Label1 | code2, Label2 | ..."`. Entries without a comma are
/// skipped; blank codes or labels likewise.
fn parse_choice_spec(spec: &str) -> Vec<(String, String)> {
    spec.split('|')
        .filter_map(|entry| {
            let (code, label) = entry.split_once(',')?;
            let code = code.trim();
            let label = label.trim();
            if code.is_empty() || label.is_empty() {
                return None;
            }
            Some((code.to_string(), label.to_string()))
        })
        .collect()
}

/// Lookup tables built once per run from the fetched data dictionary and
/// threaded as an explicit argument into every component that decodes.
#[derive(Debug, Default)]
pub struct FieldMappings {
    selects: HashMap<String, HashMap<String, String>>,
    checkboxes: HashMap<String, Vec<(String, String)>>,
}

impl FieldMappings {
    pub fn from_metadata(metadata: &[FieldMetadata]) -> Self {
        let mut mappings = Self::default();
        for field in metadata {
            let choices = parse_choice_spec(&field.select_choices);
            if choices.is_empty() {
                continue;
            }
            match field.field_type.as_str() {
                "checkbox" => {
                    let members = choices
                        .into_iter()
                        .map(|(code, label)| {
                            (
                                format!("{}___{}", field.field_name, code.to_ascii_lowercase()),
                                label,
                            )
                        })
                        .collect();
                    mappings.checkboxes.insert(field.field_name.clone(), members);
                }
                "dropdown" | "radio" => {
                    let choices = choices
                        .into_iter()
                        .map(|(code, label)| (normalize_code(&code), label))
                        .collect();
                    mappings.selects.insert(field.field_name.clone(), choices);
                }
                // calc expressions and free-text fields carry no decodable choices
                _ => {}
            }
        }
        mappings
    }

    /// `None` means no decoding is available; callers pass the raw value
    /// through.
    pub fn decode(&self, field: &str, raw_code: &str) -> Option<&str> {
        self.selects
            .get(field)?
            .get(&normalize_code(raw_code))
            .map(String::as_str)
    }

    /// `(member column key, choice label)` pairs for a checkbox group, in
    /// dictionary order. Empty when the group is unknown.
    pub fn checkbox_members(&self, field: &str) -> &[(String, String)] {
        self.checkboxes
            .get(field)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

pub const OVERRIDE_INSTRUMENT: &str = "in_season_updates";
const REPEAT_INSTRUMENT_FIELD: &str = "redcap_repeat_instrument";

#[derive(Debug, Default)]
pub struct SplitRecords {
    pub base: Vec<RawRecord>,
    pub overrides: Vec<RawRecord>,
}

/// Partitions the flat export: empty repeat instrument = preseason base row,
/// the update instrument = override row. Anything else is skipped loudly.
pub fn split_records(rows: Vec<RawRecord>) -> (SplitRecords, Vec<RecordIssue>) {
    let mut split = SplitRecords::default();
    let mut issues = Vec::new();
    for row in rows {
        match row.get(REPEAT_INSTRUMENT_FIELD) {
            None => split.base.push(row),
            Some(OVERRIDE_INSTRUMENT) => split.overrides.push(row),
            Some(other) => {
                let message = format!("unknown repeat instrument {other:?}; row skipped");
                warn!(record_id = ?row.record_id(), %message);
                issues.push(RecordIssue::new(row.record_id(), message));
            }
        }
    }
    (split, issues)
}

struct ScheduleFields {
    same_hours: &'static str,
    standard_open: &'static str,
    standard_close: &'static str,
    days_open: [&'static str; 7],
    day_starts: [&'static str; 7],
    day_closes: [&'static str; 7],
}

const BASE_SCHEDULE: ScheduleFields = ScheduleFields {
    same_hours: "same_hours_everyday",
    standard_open: "standard_start_time",
    standard_close: "standard_close_time",
    days_open: [
        "days_open___1",
        "days_open___2",
        "days_open___3",
        "days_open___4",
        "days_open___5",
        "days_open___6",
        "days_open___7",
    ],
    day_starts: [
        "mon_start",
        "tues_start",
        "wed_start",
        "thurs_start",
        "fri_start",
        "sat_start",
        "sun_start",
    ],
    day_closes: [
        "mon_close",
        "tues_close",
        "wed_close",
        "thurs_close",
        "fri_close",
        "sat_close",
        "sun_close",
    ],
};

const OVERRIDE_SCHEDULE: ScheduleFields = ScheduleFields {
    same_hours: "temp_same_hours_everyday",
    standard_open: "temp_standard_open",
    standard_close: "temp_standard_close",
    days_open: [
        "temp_days_open___1",
        "temp_days_open___2",
        "temp_days_open___3",
        "temp_days_open___4",
        "temp_days_open___5",
        "temp_days_open___6",
        "temp_days_open___7",
    ],
    day_starts: [
        "temp_mon_start",
        "temp_tues_start",
        "temp_wed_start",
        "temp_thurs_start",
        "temp_fri_start",
        "temp_sat_start",
        "temp_sun_start",
    ],
    day_closes: [
        "temp_mon_close",
        "temp_tues_close",
        "temp_wed_close",
        "temp_thurs_close",
        "temp_fri_close",
        "temp_sat_close",
        "temp_sun_close",
    ],
};

fn parse_survey_time(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .ok()
}

fn display_time(raw: &str, record_id: u32, issues: &mut Vec<RecordIssue>) -> String {
    match parse_survey_time(raw) {
        Some(time) => time.format("%-I:%M %P").to_string(),
        None => {
            issues.push(RecordIssue::new(
                Some(record_id),
                format!("unparseable time {raw:?}; keeping raw value"),
            ));
            raw.to_string()
        }
    }
}

fn display_range(start: &str, close: &str, record_id: u32, issues: &mut Vec<RecordIssue>) -> String {
    format!(
        "{} - {}",
        display_time(start, record_id, issues),
        display_time(close, record_id, issues)
    )
}

/// Builds the weekly-schedule sub-structure from one row. Used for base rows
/// and for update rows, which replace the whole structure as a unit through
/// the same branching.
fn build_schedule(
    row: &RawRecord,
    fields: &ScheduleFields,
    record_id: u32,
    issues: &mut Vec<RecordIssue>,
) -> WeeklySchedule {
    let mut schedule = WeeklySchedule::default();
    schedule.same_hours_everyday = row.is_checked(fields.same_hours);
    for (day, field) in schedule.open_days.iter_mut().zip(fields.days_open.iter()) {
        *day = row.is_checked(field);
    }

    if schedule.same_hours_everyday {
        if let (Some(open), Some(close)) = (
            row.get(fields.standard_open),
            row.get(fields.standard_close),
        ) {
            schedule.opening_time = open.to_string();
            schedule.closing_time = close.to_string();
            let range = format!("{open} - {close}");
            for i in 0..7 {
                if schedule.open_days[i] {
                    schedule.day_hours[i] = range.clone();
                }
            }
            let days = schedule.days_open_list();
            if !days.is_empty() {
                let rendered = display_range(open, close, record_id, issues);
                schedule.full_schedule = format!("{days}: {rendered}");
            }
        }
    } else {
        let mut parts = Vec::new();
        for i in 0..7 {
            if let (Some(start), Some(close)) = (
                row.get(fields.day_starts[i]),
                row.get(fields.day_closes[i]),
            ) {
                schedule.day_hours[i] = format!("{start} - {close}");
                if schedule.open_days[i] {
                    let rendered = display_range(start, close, record_id, issues);
                    parts.push(format!("{}: {rendered}", DAY_NAMES[i]));
                }
            }
        }
        schedule.full_schedule = parts.join("; ");
    }
    schedule
}

pub fn memorial_day(year: i32) -> NaiveDate {
    let mut date = NaiveDate::from_ymd_opt(year, 5, 31).expect("May 31 is a valid date");
    while date.weekday() != Weekday::Mon {
        date = date.pred_opt().expect("date within May");
    }
    date
}

pub fn labor_day(year: i32) -> NaiveDate {
    let mut date = NaiveDate::from_ymd_opt(year, 9, 1).expect("September 1 is a valid date");
    while date.weekday() != Weekday::Mon {
        date = date.succ_opt().expect("date within September");
    }
    date
}

// Holiday radios export "1" (open) / "2" (closed); only the explicit closed
// code appends the computed date.
const HOLIDAY_CLOSED_CODE: &str = "2";

fn holiday_closures(row: &RawRecord, season_year: i32) -> Vec<String> {
    let holidays: [(&str, NaiveDate); 4] = [
        ("memorial_day", memorial_day(season_year)),
        (
            "juneteenth",
            NaiveDate::from_ymd_opt(season_year, 6, 19).expect("June 19 is a valid date"),
        ),
        (
            "independence_day",
            NaiveDate::from_ymd_opt(season_year, 7, 4).expect("July 4 is a valid date"),
        ),
        ("labor_day", labor_day(season_year)),
    ];
    holidays
        .iter()
        .filter(|(field, _)| row.get(field) == Some(HOLIDAY_CLOSED_CODE))
        .map(|(_, date)| date.to_string())
        .collect()
}

const MAX_EXPLICIT_CLOSURES: usize = 10;

fn explicit_closures(row: &RawRecord, prefix: &str) -> Vec<String> {
    (1..=MAX_EXPLICIT_CLOSURES)
        .filter_map(|i| {
            row.get(&format!("{prefix}closure_date_{i}"))
                .map(str::to_string)
        })
        .collect()
}

const SERVICES_GROUP: &str = "services";

/// One flag per checkbox member the dictionary knows about that also exists
/// as a column on the row.
fn build_service_flags(row: &RawRecord, mappings: &FieldMappings) -> Vec<ServiceFlag> {
    mappings
        .checkbox_members(SERVICES_GROUP)
        .iter()
        .filter(|(member_key, _)| row.has_column(member_key))
        .map(|(member_key, label)| ServiceFlag {
            key: ServiceFlag::key_for_label(label),
            label: label.clone(),
            enabled: row.is_checked(member_key),
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct NormalizeContext {
    pub season_year: i32,
    pub default_state: String,
    pub now: DateTime<Utc>,
}

fn raw_text(row: &RawRecord, field: &str) -> String {
    row.get(field).unwrap_or_default().to_string()
}

fn decode_or_raw(row: &RawRecord, mappings: &FieldMappings, field: &str) -> String {
    match row.get(field) {
        Some(code) => mappings.decode(field, code).unwrap_or(code).to_string(),
        None => String::new(),
    }
}

fn normalize_state(
    row: &RawRecord,
    mappings: &FieldMappings,
    ctx: &NormalizeContext,
    record_id: u32,
    issues: &mut Vec<RecordIssue>,
) -> String {
    let value = match row.get("site_state") {
        Some(code) => mappings.decode("site_state", code).unwrap_or(code).to_string(),
        None => return ctx.default_state.clone(),
    };
    if value.len() == 2 && value.chars().all(|c| c.is_ascii_alphabetic()) {
        value.to_ascii_uppercase()
    } else {
        issues.push(RecordIssue::new(
            Some(record_id),
            format!("state {value:?} is not a 2-letter code; keeping raw value"),
        ));
        value
    }
}

fn normalize_zip(raw: Option<&str>, record_id: u32, issues: &mut Vec<RecordIssue>) -> String {
    let Some(raw) = raw else {
        return String::new();
    };
    if !raw.is_empty() && raw.len() <= 5 && raw.chars().all(|c| c.is_ascii_digit()) {
        format!("{raw:0>5}")
    } else {
        issues.push(RecordIssue::new(
            Some(record_id),
            format!("zip {raw:?} is not a parseable 5-digit code; keeping raw value"),
        ));
        raw.to_string()
    }
}

fn normalize_site(
    record_id: u32,
    row: &RawRecord,
    mappings: &FieldMappings,
    ctx: &NormalizeContext,
    issues: &mut Vec<RecordIssue>,
) -> SiteRecord {
    let mut site = SiteRecord::new(record_id, ctx.now);

    site.organization_name = raw_text(row, "hrs_org");
    site.site_name = raw_text(row, "hrs_location");
    site.contact_email = raw_text(row, "site_email");
    site.site_type = decode_or_raw(row, mappings, "site_type");

    site.address = raw_text(row, "site_address");
    site.city = raw_text(row, "site_city");
    site.state = normalize_state(row, mappings, ctx, record_id, issues);
    site.zip_code = normalize_zip(row.get("site_zip"), record_id, issues);
    site.full_address =
        SiteRecord::compose_full_address(&site.address, &site.city, &site.state, &site.zip_code);

    site.schedule = build_schedule(row, &BASE_SCHEDULE, record_id, issues);
    site.services = build_service_flags(row, mappings);

    let mut closures = explicit_closures(row, "");
    closures.extend(holiday_closures(row, ctx.season_year));
    site.special_closure_dates = closures.join(", ");

    site.review_status = row
        .get("review_status")
        .and_then(|code| mappings.decode("review_status", code))
        .map(ReviewStatus::from_label)
        .unwrap_or_default();

    site
}

/// Builds the canonical site table from the base rows. A row without a
/// usable identity is dropped with a warning; everything else is emitted
/// best-effort, with validation problems accumulated per record.
pub fn normalize_sites(
    rows: &[RawRecord],
    mappings: &FieldMappings,
    ctx: &NormalizeContext,
) -> (Vec<SiteRecord>, Vec<RecordIssue>) {
    let mut sites = Vec::with_capacity(rows.len());
    let mut issues = Vec::new();
    for row in rows {
        let Some(record_id) = row.record_id() else {
            issues.push(RecordIssue::new(
                None,
                "base row without a usable record_id; row dropped",
            ));
            continue;
        };
        sites.push(normalize_site(record_id, row, mappings, ctx, &mut issues));
    }
    (sites, issues)
}

#[derive(Debug, Clone)]
struct OverrideRecord {
    record_id: u32,
    update_date: DateTime<Utc>,
    input_index: usize,
    row: RawRecord,
}

fn parse_update_date(
    raw: Option<&str>,
    record_id: u32,
    fallback: DateTime<Utc>,
    issues: &mut Vec<RecordIssue>,
) -> DateTime<Utc> {
    let Some(raw) = raw else {
        return fallback;
    };
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M") {
        return dt.and_utc();
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return dt.and_utc();
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .expect("midnight is a valid time")
            .and_utc();
    }
    issues.push(RecordIssue::new(
        Some(record_id),
        format!("unparseable update_date {raw:?}; treating as submitted now"),
    ));
    fallback
}

fn has_schedule_update(row: &RawRecord) -> bool {
    row.get(OVERRIDE_SCHEDULE.same_hours).is_some()
        || row.get(OVERRIDE_SCHEDULE.standard_open).is_some()
        || row.get(OVERRIDE_SCHEDULE.standard_close).is_some()
        || OVERRIDE_SCHEDULE
            .days_open
            .iter()
            .any(|field| row.get(field).is_some())
        || (0..7).any(|i| {
            row.get(OVERRIDE_SCHEDULE.day_starts[i]).is_some()
                || row.get(OVERRIDE_SCHEDULE.day_closes[i]).is_some()
        })
}

fn apply_override(
    site: &mut SiteRecord,
    override_record: &OverrideRecord,
    mappings: &FieldMappings,
    ctx: &NormalizeContext,
    issues: &mut Vec<RecordIssue>,
) -> bool {
    let row = &override_record.row;
    let mut applied = false;

    if has_schedule_update(row) {
        site.schedule = build_schedule(row, &OVERRIDE_SCHEDULE, site.record_id, issues);
        applied = true;
    }

    let service_updates: Vec<(String, String, bool)> = mappings
        .checkbox_members(SERVICES_GROUP)
        .iter()
        .filter_map(|(member_key, label)| {
            row.get(&format!("temp_{member_key}"))
                .map(|value| (ServiceFlag::key_for_label(label), label.clone(), value == "1"))
        })
        .collect();
    if !service_updates.is_empty() {
        for (key, label, enabled) in service_updates {
            match site.services.iter_mut().find(|flag| flag.key == key) {
                Some(flag) => flag.enabled = enabled,
                None => site.services.push(ServiceFlag {
                    key,
                    label,
                    enabled,
                }),
            }
        }
        applied = true;
    }

    let closure_updates = explicit_closures(row, "temp_");
    if !closure_updates.is_empty() {
        site.special_closure_dates = closure_updates.join(", ");
        applied = true;
    }

    if applied {
        site.data_source = DataSource::InSeasonUpdate;
        site.last_updated = ctx.now;
    }
    applied
}

/// Folds the update rows into the canonical table. Per site, the single
/// winning update is the maximum of `(update_date, input index)`, so
/// reordering the input cannot silently change outcomes. Returns how many
/// sites actually changed.
pub fn apply_overrides(
    sites: &mut [SiteRecord],
    override_rows: &[RawRecord],
    mappings: &FieldMappings,
    ctx: &NormalizeContext,
) -> (usize, Vec<RecordIssue>) {
    let mut issues = Vec::new();
    let mut winners: BTreeMap<u32, OverrideRecord> = BTreeMap::new();

    for (input_index, row) in override_rows.iter().enumerate() {
        let Some(record_id) = row.record_id() else {
            issues.push(RecordIssue::new(
                None,
                "update row without a usable record_id; row skipped",
            ));
            continue;
        };
        let update_date =
            parse_update_date(row.get("update_date"), record_id, ctx.now, &mut issues);
        let candidate = OverrideRecord {
            record_id,
            update_date,
            input_index,
            row: row.clone(),
        };
        match winners.entry(record_id) {
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                if (candidate.update_date, candidate.input_index)
                    >= (current.update_date, current.input_index)
                {
                    entry.insert(candidate);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(candidate);
            }
        }
    }

    let mut applied_count = 0;
    for override_record in winners.values() {
        let Some(site) = sites
            .iter_mut()
            .find(|site| site.record_id == override_record.record_id)
        else {
            let message = "update for a site with no preseason record; skipped";
            warn!(record_id = override_record.record_id, message);
            issues.push(RecordIssue::new(Some(override_record.record_id), message));
            continue;
        };
        if apply_override(site, override_record, mappings, ctx, &mut issues) {
            applied_count += 1;
        }
    }

    (applied_count, issues)
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GeocodeStats {
    pub reused: usize,
    pub geocoded: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Fills coordinates in priority order: previous-snapshot cache first (never
/// spends a credit, regardless of status), then one external lookup for
/// newly accepted sites. With no geocoder configured the pass is a no-op.
pub async fn geocode_sites(
    sites: &mut [SiteRecord],
    cache: &GeocodeCache,
    geocoder: Option<&dyn Geocoder>,
    http: &HttpFetcher,
    run_id: Uuid,
    issues: &mut Vec<RecordIssue>,
) -> GeocodeStats {
    let mut stats = GeocodeStats::default();
    let Some(geocoder) = geocoder else {
        info!("geocoding credentials absent; leaving coordinates untouched");
        return stats;
    };

    for site in sites.iter_mut() {
        if let Some(coords) = cache.lookup(site.record_id) {
            site.set_coordinates(coords);
            stats.reused += 1;
            continue;
        }
        if site.review_status != ReviewStatus::Accepted {
            stats.skipped += 1;
            continue;
        }
        match geocoder.geocode(http, run_id, &site.full_address).await {
            Ok(Some(coords)) => {
                site.set_coordinates(coords);
                stats.geocoded += 1;
            }
            Ok(None) => {
                stats.failed += 1;
                issues.push(RecordIssue::new(
                    Some(site.record_id),
                    format!("no geocoding result for {:?}", site.full_address),
                ));
            }
            Err(err) => {
                stats.failed += 1;
                issues.push(RecordIssue::new(
                    Some(site.record_id),
                    format!("geocoding failed: {err}"),
                ));
            }
        }
    }
    stats
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_sites: usize,
    pub accepted: usize,
    pub pending: usize,
    pub under_review: usize,
    pub overrides_applied: usize,
    pub geocode: GeocodeStats,
    pub with_coordinates: usize,
    pub missing_coordinates: usize,
    pub warnings: Vec<RecordIssue>,
    pub snapshot_path: String,
    pub accepted_snapshot_path: String,
    pub archive_path: String,
}

pub fn render_summary_text(summary: &RunSummary) -> String {
    format!(
        "Heat Relief Network Data\n\
         Updated: {}\n\
         \n\
         Total Sites: {}\n\
         Accepted: {}\n\
         Pending: {}\n\
         Under Review: {}\n\
         \n\
         Geocoded: {}\n\
         Missing Coordinates: {}\n\
         \n\
         In-season updates applied: {}\n\
         Warnings: {}\n",
        summary.finished_at.format("%Y-%m-%d %H:%M:%S"),
        summary.total_sites,
        summary.accepted,
        summary.pending,
        summary.under_review,
        summary.with_coordinates,
        summary.missing_coordinates,
        summary.overrides_applied,
        summary.warnings.len(),
    )
}

pub struct SyncPipeline {
    config: PipelineConfig,
    http: HttpFetcher,
    source: Box<dyn SiteSource>,
    geocoder: Option<Box<dyn Geocoder>>,
    archive: PayloadArchive,
    snapshots: SnapshotStore,
}

impl SyncPipeline {
    /// Wires the production collaborators from configuration. A missing
    /// geocoding token disables the geocode pass; missing survey credentials
    /// are an error because nothing can run without the base record set.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        anyhow::ensure!(!config.redcap_api_url.is_empty(), "REDCAP_API_URL is not set");
        anyhow::ensure!(
            !config.redcap_api_token.is_empty(),
            "REDCAP_API_TOKEN is not set"
        );
        let source = Box::new(RedcapClient::new(
            config.redcap_api_url.clone(),
            config.redcap_api_token.clone(),
        ));
        let geocoder: Option<Box<dyn Geocoder>> = config
            .mapbox_token
            .as_ref()
            .map(|token| Box::new(MapboxGeocoder::new(token.clone())) as Box<dyn Geocoder>);
        Self::with_collaborators(config, source, geocoder)
    }

    pub fn with_collaborators(
        config: PipelineConfig,
        source: Box<dyn SiteSource>,
        geocoder: Option<Box<dyn Geocoder>>,
    ) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let archive = PayloadArchive::new(config.artifacts_dir.clone());
        let snapshots = SnapshotStore::new(config.data_dir.clone());
        Ok(Self {
            config,
            http,
            source,
            geocoder,
            archive,
            snapshots,
        })
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, "starting pipeline run");

        // Upstream fetch or parse failures abort here, before any output is
        // written; the previous snapshot stays the last known good state.
        let metadata_bytes = self
            .source
            .fetch_metadata(&self.http, run_id)
            .await
            .context("fetching field metadata")?;
        let record_bytes = self
            .source
            .fetch_records(&self.http, run_id)
            .await
            .context("fetching records")?;

        self.archive
            .store_payload(started_at, "metadata", "json", &metadata_bytes)
            .await?;
        self.archive
            .store_payload(started_at, "records", "json", &record_bytes)
            .await?;

        let metadata = parse_metadata(&metadata_bytes).context("parsing field metadata")?;
        let rows = parse_records(&record_bytes).context("parsing records")?;

        let mappings = FieldMappings::from_metadata(&metadata);
        let (split, mut issues) = split_records(rows);
        info!(
            base = split.base.len(),
            overrides = split.overrides.len(),
            "partitioned records"
        );

        let ctx = NormalizeContext {
            season_year: self.config.season_year,
            default_state: self.config.default_state.clone(),
            now: started_at,
        };
        let (mut sites, normalize_issues) = normalize_sites(&split.base, &mappings, &ctx);
        issues.extend(normalize_issues);

        let (overrides_applied, reconcile_issues) =
            apply_overrides(&mut sites, &split.overrides, &mappings, &ctx);
        issues.extend(reconcile_issues);

        let cache = match self.snapshots.read_seed_coordinates().await {
            Some(seeds) => GeocodeCache::from_seeds(seeds),
            None => {
                info!("no previous snapshot; geocode cache starts empty");
                GeocodeCache::default()
            }
        };
        info!(cached = cache.len(), "seeded geocode cache");

        let geocode = geocode_sites(
            &mut sites,
            &cache,
            self.geocoder.as_deref(),
            &self.http,
            run_id,
            &mut issues,
        )
        .await;

        let total_sites = sites.len();
        let count_status = |status: ReviewStatus| {
            sites
                .iter()
                .filter(|site| site.review_status == status)
                .count()
        };
        let with_coordinates = sites
            .iter()
            .filter(|site| site.coordinates().is_some())
            .count();

        let finished_at = Utc::now();
        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at,
            total_sites,
            accepted: count_status(ReviewStatus::Accepted),
            pending: count_status(ReviewStatus::Pending),
            under_review: count_status(ReviewStatus::UnderReview),
            overrides_applied,
            geocode,
            with_coordinates,
            missing_coordinates: total_sites - with_coordinates,
            warnings: issues,
            snapshot_path: String::new(),
            accepted_snapshot_path: String::new(),
            archive_path: String::new(),
        };

        let summary_text = render_summary_text(&summary);
        let paths = self
            .snapshots
            .write(&sites, &summary_text, finished_at.date_naive())
            .await
            .context("writing snapshot set")?;
        summary.snapshot_path = paths.snapshot.display().to_string();
        summary.accepted_snapshot_path = paths.accepted.display().to_string();
        summary.archive_path = paths.archive.display().to_string();

        info!(
            total = summary.total_sites,
            accepted = summary.accepted,
            reused = summary.geocode.reused,
            geocoded = summary.geocode.geocoded,
            warnings = summary.warnings.len(),
            "pipeline run complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use hrn_adapters::{GeocodeError, SourceError};
    use hrn_core::Coordinates;
    use hrn_storage::SeedCoordinate;
    use serde_json::json;
    use tempfile::tempdir;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).single().unwrap()
    }

    fn test_ctx() -> NormalizeContext {
        NormalizeContext {
            season_year: 2026,
            default_state: "AZ".into(),
            now: fixed_now(),
        }
    }

    fn fixture_metadata() -> Vec<FieldMetadata> {
        vec![
            FieldMetadata {
                field_name: "review_status".into(),
                field_type: "dropdown".into(),
                select_choices: "0, Pending | 1, Accepted | 2, Under Review".into(),
            },
            FieldMetadata {
                field_name: "site_type".into(),
                field_type: "dropdown".into(),
                select_choices: "1, Library | 2, Community Center".into(),
            },
            FieldMetadata {
                field_name: "services".into(),
                field_type: "checkbox".into(),
                select_choices: "1, Charging | 2, Showers | 3, Storage for Belongings".into(),
            },
        ]
    }

    fn fixture_mappings() -> FieldMappings {
        FieldMappings::from_metadata(&fixture_metadata())
    }

    fn base_row(record_id: &str) -> RawRecord {
        RawRecord::from_pairs([
            ("record_id", record_id),
            ("redcap_repeat_instrument", ""),
            ("hrs_org", "Relief Org"),
            ("hrs_location", "Main Library"),
            ("site_type", "1"),
            ("site_email", "site@example.org"),
            ("site_address", "1 Main St"),
            ("site_city", "Phoenix"),
            ("site_zip", "85001"),
            ("review_status", "1"),
            ("same_hours_everyday", "1"),
            ("standard_start_time", "08:00"),
            ("standard_close_time", "17:00"),
            ("days_open___1", "1"),
            ("days_open___2", "0"),
            ("days_open___3", "1"),
            ("days_open___4", "0"),
            ("days_open___5", "0"),
            ("days_open___6", "0"),
            ("days_open___7", "0"),
            ("services___1", "1"),
            ("services___2", "0"),
            ("services___3", "0"),
        ])
    }

    fn hours_override(record_id: &str, date: &str, open: &str, close: &str) -> RawRecord {
        RawRecord::from_pairs([
            ("record_id", record_id),
            ("redcap_repeat_instrument", OVERRIDE_INSTRUMENT),
            ("update_date", date),
            ("temp_same_hours_everyday", "1"),
            ("temp_standard_open", open),
            ("temp_standard_close", close),
            ("temp_days_open___1", "1"),
        ])
    }

    #[test]
    fn choice_specs_parse_tolerantly() {
        let metadata = vec![FieldMetadata {
            field_name: "site_type".into(),
            field_type: "dropdown".into(),
            select_choices: "1, Library | garbage-no-comma | 02, Community Center".into(),
        }];
        let mappings = FieldMappings::from_metadata(&metadata);
        assert_eq!(mappings.decode("site_type", "1"), Some("Library"));
        assert_eq!(mappings.decode("site_type", "2"), Some("Community Center"));
        assert_eq!(mappings.decode("site_type", "02"), Some("Community Center"));
        assert_eq!(mappings.decode("site_type", "3"), None);
        assert_eq!(mappings.decode("unknown_field", "1"), None);
    }

    #[test]
    fn empty_choice_specs_yield_empty_mappings() {
        let metadata = vec![
            FieldMetadata {
                field_name: "site_type".into(),
                field_type: "dropdown".into(),
                select_choices: String::new(),
            },
            FieldMetadata {
                field_name: "heat_index".into(),
                field_type: "calc".into(),
                select_choices: "[temp]*1.8, 32".into(),
            },
        ];
        let mappings = FieldMappings::from_metadata(&metadata);
        assert_eq!(mappings.decode("site_type", "1"), None);
        assert_eq!(mappings.decode("heat_index", "[temp]*1.8"), None);
    }

    #[test]
    fn checkbox_groups_synthesize_member_keys() {
        let mappings = fixture_mappings();
        let members = mappings.checkbox_members("services");
        assert_eq!(members.len(), 3);
        assert_eq!(members[0], ("services___1".to_string(), "Charging".to_string()));
        assert_eq!(
            members[2],
            (
                "services___3".to_string(),
                "Storage for Belongings".to_string()
            )
        );
        assert!(mappings.checkbox_members("days_open").is_empty());
    }

    #[test]
    fn splitter_partitions_on_the_repeat_instrument() {
        let rows = vec![
            base_row("1"),
            hours_override("1", "2026-06-01", "06:00", "10:00"),
            RawRecord::from_pairs([
                ("record_id", "2"),
                ("redcap_repeat_instrument", "site_visits"),
            ]),
        ];
        let (split, issues) = split_records(rows);
        assert_eq!(split.base.len(), 1);
        assert_eq!(split.overrides.len(), 1);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].record_id, Some(2));
    }

    #[test]
    fn unmapped_status_codes_default_to_pending() {
        let mut unmapped = base_row("5");
        unmapped.insert("review_status", "9");
        let mut missing = base_row("6");
        missing.insert("review_status", "");

        let (sites, _) =
            normalize_sites(&[unmapped, missing], &fixture_mappings(), &test_ctx());
        assert_eq!(sites[0].review_status, ReviewStatus::Pending);
        assert_eq!(sites[1].review_status, ReviewStatus::Pending);
    }

    #[test]
    fn mapped_status_codes_resolve_through_the_dictionary() {
        let mut row = base_row("5");
        row.insert("review_status", "2");
        let (sites, _) = normalize_sites(&[row], &fixture_mappings(), &test_ctx());
        assert_eq!(sites[0].review_status, ReviewStatus::UnderReview);
    }

    #[test]
    fn same_hours_schedule_fills_open_days_only() {
        let (sites, issues) =
            normalize_sites(&[base_row("1")], &fixture_mappings(), &test_ctx());
        let schedule = &sites[0].schedule;
        assert!(schedule.same_hours_everyday);
        assert_eq!(schedule.day_hours[0], "08:00 - 17:00");
        assert_eq!(schedule.day_hours[1], "");
        assert_eq!(schedule.day_hours[2], "08:00 - 17:00");
        assert_eq!(schedule.opening_time, "08:00");
        assert_eq!(schedule.closing_time, "17:00");
        assert_eq!(
            schedule.full_schedule,
            "Monday, Wednesday: 8:00 am - 5:00 pm"
        );
        assert!(issues.is_empty());
    }

    #[test]
    fn per_day_schedule_populates_pairs_independently() {
        let mut row = base_row("2");
        row.insert("same_hours_everyday", "0");
        row.insert("mon_start", "08:00");
        row.insert("mon_close", "12:00");
        // Tuesday has hours but is not an open day; Friday has only a start.
        row.insert("tues_start", "09:00");
        row.insert("tues_close", "13:00");
        row.insert("fri_start", "10:00");

        let (sites, _) = normalize_sites(&[row], &fixture_mappings(), &test_ctx());
        let schedule = &sites[0].schedule;
        assert!(!schedule.same_hours_everyday);
        assert_eq!(schedule.day_hours[0], "08:00 - 12:00");
        assert_eq!(schedule.day_hours[1], "09:00 - 13:00");
        assert_eq!(schedule.day_hours[4], "");
        assert_eq!(schedule.opening_time, "");
        assert_eq!(schedule.full_schedule, "Monday: 8:00 am - 12:00 pm");
    }

    #[test]
    fn sites_with_no_usable_hours_have_an_empty_schedule_summary() {
        let mut row = base_row("2");
        row.insert("standard_start_time", "");
        let (sites, _) = normalize_sites(&[row], &fixture_mappings(), &test_ctx());
        assert_eq!(sites[0].schedule.full_schedule, "");
        assert_eq!(sites[0].schedule.day_hours[0], "");
    }

    #[test]
    fn closures_combine_explicit_dates_then_closed_holidays() {
        let mut row = base_row("3");
        row.insert("closure_date_1", "2026-07-01");
        row.insert("memorial_day", "2");
        row.insert("juneteenth", "1");

        let (sites, _) = normalize_sites(&[row], &fixture_mappings(), &test_ctx());
        assert_eq!(sites[0].special_closure_dates, "2026-07-01, 2026-05-25");
    }

    #[test]
    fn floating_holidays_compute_for_the_season_year() {
        assert_eq!(
            memorial_day(2026),
            NaiveDate::from_ymd_opt(2026, 5, 25).unwrap()
        );
        assert_eq!(
            memorial_day(2025),
            NaiveDate::from_ymd_opt(2025, 5, 26).unwrap()
        );
        assert_eq!(labor_day(2026), NaiveDate::from_ymd_opt(2026, 9, 7).unwrap());
        assert_eq!(labor_day(2025), NaiveDate::from_ymd_opt(2025, 9, 1).unwrap());
    }

    #[test]
    fn service_flags_cover_discovered_members_present_on_the_row() {
        let (sites, _) = normalize_sites(&[base_row("4")], &fixture_mappings(), &test_ctx());
        let site = &sites[0];
        assert_eq!(site.services.len(), 3);
        assert_eq!(site.services[0].key, "has_charging");
        assert!(site.services[0].enabled);
        assert!(!site.services[1].enabled);
        assert_eq!(site.services[2].key, "has_storage_for_belongings");
        assert_eq!(site.services_offered(), "Charging");
    }

    #[test]
    fn dictionary_members_missing_from_the_export_get_no_flag() {
        let row = RawRecord::from_pairs([
            ("record_id", "4"),
            ("services___1", "1"),
            ("services___2", "0"),
        ]);
        let flags = build_service_flags(&row, &fixture_mappings());
        assert_eq!(flags.len(), 2);
        assert!(flags.iter().all(|flag| flag.key != "has_storage_for_belongings"));
    }

    #[test]
    fn zips_left_pad_and_flag_unparseable_values() {
        let mut short = base_row("7");
        short.insert("site_zip", "850");
        let mut bad = base_row("8");
        bad.insert("site_zip", "8500x");

        let (sites, issues) = normalize_sites(&[short, bad], &fixture_mappings(), &test_ctx());
        assert_eq!(sites[0].zip_code, "00850");
        assert_eq!(sites[1].zip_code, "8500x");
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].record_id, Some(8));
    }

    #[test]
    fn state_defaults_when_absent_and_flags_bad_values() {
        let (sites, issues) = normalize_sites(&[base_row("1")], &fixture_mappings(), &test_ctx());
        assert_eq!(sites[0].state, "AZ");
        assert!(issues.is_empty());

        let mut bad = base_row("2");
        bad.insert("site_state", "Ariz");
        let (sites, issues) = normalize_sites(&[bad], &fixture_mappings(), &test_ctx());
        assert_eq!(sites[0].state, "Ariz");
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].record_id, Some(2));
    }

    #[test]
    fn full_address_concatenates_the_location_fields() {
        let (sites, _) = normalize_sites(&[base_row("1")], &fixture_mappings(), &test_ctx());
        assert_eq!(sites[0].full_address, "1 Main St, Phoenix, AZ 85001");
        assert_eq!(sites[0].site_type, "Library");
        assert_eq!(sites[0].organization_name, "Relief Org");
    }

    #[test]
    fn rows_without_a_record_id_are_dropped_with_a_warning() {
        let row = RawRecord::from_pairs([("hrs_location", "Nameless Site")]);
        let (sites, issues) = normalize_sites(&[row], &fixture_mappings(), &test_ctx());
        assert!(sites.is_empty());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].record_id, None);
    }

    #[test]
    fn the_most_recent_update_wins() {
        let mappings = fixture_mappings();
        let ctx = test_ctx();
        let (mut sites, _) = normalize_sites(&[base_row("1")], &mappings, &ctx);
        let overrides = vec![
            hours_override("1", "2026-05-01", "06:00", "10:00"),
            hours_override("1", "2026-05-10", "07:00", "11:00"),
        ];

        let (applied, issues) = apply_overrides(&mut sites, &overrides, &mappings, &ctx);
        assert_eq!(applied, 1);
        assert!(issues.is_empty());
        assert_eq!(sites[0].schedule.opening_time, "07:00");
        assert_eq!(sites[0].data_source, DataSource::InSeasonUpdate);
    }

    #[test]
    fn input_reordering_does_not_change_the_winner() {
        let mappings = fixture_mappings();
        let ctx = test_ctx();
        let (mut sites, _) = normalize_sites(&[base_row("1")], &mappings, &ctx);
        let overrides = vec![
            hours_override("1", "2026-05-10", "07:00", "11:00"),
            hours_override("1", "2026-05-01", "06:00", "10:00"),
        ];

        apply_overrides(&mut sites, &overrides, &mappings, &ctx);
        assert_eq!(sites[0].schedule.opening_time, "07:00");
    }

    #[test]
    fn date_ties_break_by_input_order() {
        let mappings = fixture_mappings();
        let ctx = test_ctx();
        let (mut sites, _) = normalize_sites(&[base_row("1")], &mappings, &ctx);
        let overrides = vec![
            hours_override("1", "2026-05-10", "06:00", "10:00"),
            hours_override("1", "2026-05-10", "07:00", "11:00"),
        ];

        apply_overrides(&mut sites, &overrides, &mappings, &ctx);
        assert_eq!(sites[0].schedule.opening_time, "07:00");
    }

    #[test]
    fn orphan_updates_are_skipped_with_a_warning() {
        let mappings = fixture_mappings();
        let ctx = test_ctx();
        let (mut sites, _) = normalize_sites(&[base_row("1")], &mappings, &ctx);
        let overrides = vec![hours_override("99", "2026-05-10", "07:00", "11:00")];

        let (applied, issues) = apply_overrides(&mut sites, &overrides, &mappings, &ctx);
        assert_eq!(applied, 0);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].record_id, Some(99));
        assert_eq!(sites[0].data_source, DataSource::Preseason);
    }

    #[test]
    fn schedule_updates_replace_the_whole_substructure() {
        let mappings = fixture_mappings();
        let ctx = test_ctx();
        let (mut sites, _) = normalize_sites(&[base_row("1")], &mappings, &ctx);

        let override_row = RawRecord::from_pairs([
            ("record_id", "1"),
            ("redcap_repeat_instrument", OVERRIDE_INSTRUMENT),
            ("update_date", "2026-06-20"),
            ("temp_same_hours_everyday", "0"),
            ("temp_days_open___5", "1"),
            ("temp_fri_start", "18:00"),
            ("temp_fri_close", "22:00"),
        ]);
        apply_overrides(&mut sites, &[override_row], &mappings, &ctx);

        let schedule = &sites[0].schedule;
        assert!(!schedule.same_hours_everyday);
        assert_eq!(schedule.opening_time, "");
        assert_eq!(schedule.day_hours[0], "");
        assert_eq!(schedule.day_hours[4], "18:00 - 22:00");
        assert_eq!(schedule.days_open_list(), "Friday");
        assert_eq!(schedule.full_schedule, "Friday: 6:00 pm - 10:00 pm");
    }

    #[test]
    fn service_updates_overwrite_each_flag_explicitly() {
        let mappings = fixture_mappings();
        let ctx = test_ctx();
        let (mut sites, _) = normalize_sites(&[base_row("1")], &mappings, &ctx);

        let override_row = RawRecord::from_pairs([
            ("record_id", "1"),
            ("redcap_repeat_instrument", OVERRIDE_INSTRUMENT),
            ("update_date", "2026-06-20"),
            ("temp_services___1", "0"),
            ("temp_services___2", "1"),
        ]);
        let (applied, _) = apply_overrides(&mut sites, &[override_row], &mappings, &ctx);

        assert_eq!(applied, 1);
        let site = &sites[0];
        assert!(!site.services[0].enabled);
        assert!(site.services[1].enabled);
        assert!(!site.services[2].enabled);
        assert_eq!(site.services_offered(), "Showers");
        assert_eq!(site.data_source, DataSource::InSeasonUpdate);
    }

    #[test]
    fn closure_updates_replace_the_list_wholesale() {
        let mappings = fixture_mappings();
        let ctx = test_ctx();
        let mut row = base_row("1");
        row.insert("closure_date_1", "2026-07-01");
        row.insert("memorial_day", "2");
        let (mut sites, _) = normalize_sites(&[row], &mappings, &ctx);
        assert_eq!(sites[0].special_closure_dates, "2026-07-01, 2026-05-25");

        let override_row = RawRecord::from_pairs([
            ("record_id", "1"),
            ("redcap_repeat_instrument", OVERRIDE_INSTRUMENT),
            ("update_date", "2026-08-01"),
            ("temp_closure_date_1", "2026-08-15"),
            ("temp_closure_date_2", "2026-08-16"),
        ]);
        apply_overrides(&mut sites, &[override_row], &mappings, &ctx);
        assert_eq!(sites[0].special_closure_dates, "2026-08-15, 2026-08-16");
    }

    #[test]
    fn updates_without_applicable_fields_leave_the_site_untouched() {
        let mappings = fixture_mappings();
        let ctx = test_ctx();
        let (mut sites, _) = normalize_sites(&[base_row("1")], &mappings, &ctx);
        let before = sites[0].clone();

        let override_row = RawRecord::from_pairs([
            ("record_id", "1"),
            ("redcap_repeat_instrument", OVERRIDE_INSTRUMENT),
            ("update_date", "2026-06-20"),
        ]);
        let (applied, _) = apply_overrides(&mut sites, &[override_row], &mappings, &ctx);

        assert_eq!(applied, 0);
        assert_eq!(sites[0], before);
        assert_eq!(sites[0].data_source, DataSource::Preseason);
    }

    #[test]
    fn reconciliation_is_deterministic_and_idempotent() {
        let mappings = fixture_mappings();
        let ctx = test_ctx();
        let base = [base_row("1"), base_row("2")];
        let overrides = vec![
            hours_override("1", "2026-05-01", "06:00", "10:00"),
            hours_override("1", "2026-05-10", "07:00", "11:00"),
        ];

        let run = || {
            let (mut sites, _) = normalize_sites(&base, &mappings, &ctx);
            apply_overrides(&mut sites, &overrides, &mappings, &ctx);
            sites
        };
        assert_eq!(run(), run());
    }

    struct ScriptedGeocoder {
        calls: Arc<AtomicUsize>,
        response: Option<Coordinates>,
        fail: bool,
    }

    #[async_trait]
    impl Geocoder for ScriptedGeocoder {
        async fn geocode(
            &self,
            _http: &HttpFetcher,
            _run_id: Uuid,
            _address: &str,
        ) -> Result<Option<Coordinates>, GeocodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(GeocodeError::Malformed("scripted failure".into()));
            }
            Ok(self.response)
        }
    }

    fn test_fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig::default()).expect("fetcher")
    }

    fn downtown() -> Coordinates {
        Coordinates {
            latitude: 33.448376,
            longitude: -112.074036,
        }
    }

    #[tokio::test]
    async fn cached_coordinates_never_spend_a_credit() {
        let mappings = fixture_mappings();
        let ctx = test_ctx();
        let mut row = base_row("1");
        row.insert("review_status", "0");
        let (mut sites, mut issues) = normalize_sites(&[row], &mappings, &ctx);

        let cache = GeocodeCache::from_seeds(vec![SeedCoordinate {
            record_id: 1,
            coords: downtown(),
        }]);
        let calls = Arc::new(AtomicUsize::new(0));
        let geocoder = ScriptedGeocoder {
            calls: calls.clone(),
            response: Some(downtown()),
            fail: false,
        };

        let stats = geocode_sites(
            &mut sites,
            &cache,
            Some(&geocoder),
            &test_fetcher(),
            Uuid::new_v4(),
            &mut issues,
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(stats.reused, 1);
        assert!(sites[0].geocoded);
        assert_eq!(sites[0].coordinates(), Some(downtown()));
    }

    #[tokio::test]
    async fn only_accepted_sites_reach_the_geocoder() {
        let mappings = fixture_mappings();
        let ctx = test_ctx();
        let mut pending = base_row("2");
        pending.insert("review_status", "0");
        let (mut sites, mut issues) =
            normalize_sites(&[base_row("1"), pending], &mappings, &ctx);

        let calls = Arc::new(AtomicUsize::new(0));
        let geocoder = ScriptedGeocoder {
            calls: calls.clone(),
            response: Some(downtown()),
            fail: false,
        };
        let stats = geocode_sites(
            &mut sites,
            &GeocodeCache::default(),
            Some(&geocoder),
            &test_fetcher(),
            Uuid::new_v4(),
            &mut issues,
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stats.geocoded, 1);
        assert_eq!(stats.skipped, 1);
        assert!(sites[0].geocoded);
        assert!(!sites[1].geocoded);
        assert_eq!(sites[1].coordinates(), None);
    }

    #[tokio::test]
    async fn geocoder_failures_are_per_site_warnings() {
        let mappings = fixture_mappings();
        let ctx = test_ctx();
        let (mut sites, mut issues) = normalize_sites(&[base_row("1")], &mappings, &ctx);

        let geocoder = ScriptedGeocoder {
            calls: Arc::new(AtomicUsize::new(0)),
            response: None,
            fail: true,
        };
        let stats = geocode_sites(
            &mut sites,
            &GeocodeCache::default(),
            Some(&geocoder),
            &test_fetcher(),
            Uuid::new_v4(),
            &mut issues,
        )
        .await;

        assert_eq!(stats.failed, 1);
        assert!(!sites[0].geocoded);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].record_id, Some(1));
    }

    #[tokio::test]
    async fn missing_credentials_disable_the_geocode_pass() {
        let mappings = fixture_mappings();
        let ctx = test_ctx();
        let (mut sites, mut issues) = normalize_sites(&[base_row("1")], &mappings, &ctx);

        let stats = geocode_sites(
            &mut sites,
            &GeocodeCache::default(),
            None,
            &test_fetcher(),
            Uuid::new_v4(),
            &mut issues,
        )
        .await;

        assert_eq!(stats.reused + stats.geocoded + stats.skipped + stats.failed, 0);
        assert!(!sites[0].geocoded);
        assert!(issues.is_empty());
    }

    struct FixtureSource {
        metadata: Vec<u8>,
        records: Vec<u8>,
    }

    #[async_trait]
    impl SiteSource for FixtureSource {
        fn source_id(&self) -> &'static str {
            "fixture"
        }

        async fn fetch_metadata(
            &self,
            _http: &HttpFetcher,
            _run_id: Uuid,
        ) -> Result<Vec<u8>, SourceError> {
            Ok(self.metadata.clone())
        }

        async fn fetch_records(
            &self,
            _http: &HttpFetcher,
            _run_id: Uuid,
        ) -> Result<Vec<u8>, SourceError> {
            Ok(self.records.clone())
        }
    }

    fn fixture_payloads() -> (Vec<u8>, Vec<u8>) {
        let metadata = json!([
            {
                "field_name": "review_status",
                "field_type": "dropdown",
                "select_choices_or_calculations": "0, Pending | 1, Accepted | 2, Under Review"
            },
            {
                "field_name": "services",
                "field_type": "checkbox",
                "select_choices_or_calculations": "1, Charging | 2, Showers"
            }
        ]);
        let records = json!([
            {
                "record_id": "1",
                "redcap_repeat_instrument": "",
                "hrs_org": "Relief Org",
                "hrs_location": "Main Library",
                "site_email": "library@example.org",
                "site_address": "1 Main St",
                "site_city": "Phoenix",
                "site_zip": "85001",
                "review_status": "1",
                "same_hours_everyday": "1",
                "standard_start_time": "08:00",
                "standard_close_time": "17:00",
                "days_open___1": "1",
                "days_open___2": "1",
                "days_open___3": "0",
                "days_open___4": "0",
                "days_open___5": "0",
                "days_open___6": "0",
                "days_open___7": "0",
                "services___1": "1",
                "services___2": "0"
            },
            {
                "record_id": "2",
                "redcap_repeat_instrument": "",
                "hrs_org": "Relief Org",
                "hrs_location": "Community Center",
                "site_address": "9 Oak Ave",
                "site_city": "Mesa",
                "site_zip": "85201",
                "review_status": "0",
                "services___1": "0",
                "services___2": "0"
            },
            {
                "record_id": "1",
                "redcap_repeat_instrument": "in_season_updates",
                "update_date": "2026-06-15",
                "temp_same_hours_everyday": "1",
                "temp_standard_open": "07:00",
                "temp_standard_close": "19:00",
                "temp_days_open___1": "1"
            }
        ]);
        (
            serde_json::to_vec(&metadata).unwrap(),
            serde_json::to_vec(&records).unwrap(),
        )
    }

    fn test_config(root: &Path) -> PipelineConfig {
        PipelineConfig {
            redcap_api_url: String::new(),
            redcap_api_token: String::new(),
            mapbox_token: None,
            data_dir: root.join("data"),
            artifacts_dir: root.join("artifacts"),
            season_year: 2026,
            default_state: "AZ".into(),
            user_agent: "hrn-test".into(),
            http_timeout_secs: 5,
        }
    }

    fn fixture_pipeline(root: &Path, calls: Arc<AtomicUsize>) -> SyncPipeline {
        let (metadata, records) = fixture_payloads();
        let geocoder = ScriptedGeocoder {
            calls,
            response: Some(downtown()),
            fail: false,
        };
        SyncPipeline::with_collaborators(
            test_config(root),
            Box::new(FixtureSource { metadata, records }),
            Some(Box::new(geocoder)),
        )
        .expect("pipeline")
    }

    #[tokio::test]
    async fn run_once_reconciles_geocodes_and_writes_the_snapshot_set() {
        let dir = tempdir().expect("tempdir");
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = fixture_pipeline(dir.path(), calls.clone());

        let summary = pipeline.run_once().await.expect("run");
        assert_eq!(summary.total_sites, 2);
        assert_eq!(summary.accepted, 1);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.overrides_applied, 1);
        assert_eq!(summary.geocode.geocoded, 1);
        assert_eq!(summary.geocode.skipped, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let snapshot =
            std::fs::read_to_string(&summary.snapshot_path).expect("snapshot file");
        assert_eq!(snapshot.lines().count() - 1, 2);
        assert!(snapshot.contains("07:00"));
        assert!(snapshot.contains("in-season update"));

        let accepted =
            std::fs::read_to_string(&summary.accepted_snapshot_path).expect("accepted file");
        assert_eq!(accepted.lines().count() - 1, 1);
        assert!(accepted.contains("Main Library"));
    }

    #[tokio::test]
    async fn repeat_runs_reuse_coordinates_instead_of_regeocoding() {
        let dir = tempdir().expect("tempdir");
        let calls = Arc::new(AtomicUsize::new(0));

        let first = fixture_pipeline(dir.path(), calls.clone());
        let summary = first.run_once().await.expect("first run");
        assert_eq!(summary.geocode.geocoded, 1);

        let second = fixture_pipeline(dir.path(), calls.clone());
        let summary = second.run_once().await.expect("second run");
        assert_eq!(summary.geocode.reused, 1);
        assert_eq!(summary.geocode.geocoded, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
