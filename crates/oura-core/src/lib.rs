//! Core record model, flattening and row identity for the Oura sync engine.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::{Number, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "oura-core";

/// Reserved column carrying the row identity inside every category table.
pub const IDENTITY_COLUMN: &str = "__identity__";

/// Fields consulted, in order, when picking a row identity.
pub const PREFERRED_IDENTITY_FIELDS: [&str; 8] = [
    "id",
    "uuid",
    "day",
    "timestamp",
    "datetime",
    "start_datetime",
    "end_datetime",
    "start_time",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown category '{name}'. Known categories: {known}")]
    UnknownCategory { name: String, known: String },
    #[error(
        "an Oura personal access token must be provided via --token or the OURA_PERSONAL_ACCESS_TOKEN environment variable"
    )]
    MissingCredential,
    #[error("a lookback of {hours} hours reaches past the supported date range")]
    LookbackOutOfRange { hours: i64 },
}

/// Leaf value of a record or a flat row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Number(Number),
    Text(String),
}

impl Scalar {
    pub fn text(value: impl Into<String>) -> Self {
        Scalar::Text(value.into())
    }

    /// Cell text as written to a table.
    pub fn render(&self) -> String {
        match self {
            Scalar::Null => String::new(),
            Scalar::Bool(b) => b.to_string(),
            Scalar::Number(n) => n.to_string(),
            Scalar::Text(s) => s.clone(),
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            Scalar::Null => true,
            Scalar::Text(s) => s.is_empty(),
            _ => false,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Number(value.into())
    }
}

/// Tagged recursive value of an upstream record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RecordValue {
    Scalar(Scalar),
    List(Vec<RecordValue>),
    Map(BTreeMap<String, RecordValue>),
}

impl From<JsonValue> for RecordValue {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => RecordValue::Scalar(Scalar::Null),
            JsonValue::Bool(b) => RecordValue::Scalar(Scalar::Bool(b)),
            JsonValue::Number(n) => RecordValue::Scalar(Scalar::Number(n)),
            JsonValue::String(s) => RecordValue::Scalar(Scalar::Text(s)),
            JsonValue::Array(items) => {
                RecordValue::List(items.into_iter().map(RecordValue::from).collect())
            }
            JsonValue::Object(map) => RecordValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, RecordValue::from(v)))
                    .collect(),
            ),
        }
    }
}

/// One upstream record: an arbitrary nested mapping with no fixed schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Record(BTreeMap<String, RecordValue>);

impl Record {
    /// Builds a record from a JSON object. Any other JSON shape yields `None`.
    pub fn from_json(value: JsonValue) -> Option<Self> {
        match value {
            JsonValue::Object(map) => Some(Self(
                map.into_iter()
                    .map(|(k, v)| (k, RecordValue::from(v)))
                    .collect(),
            )),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&RecordValue> {
        self.0.get(key)
    }

    pub fn fields(&self) -> &BTreeMap<String, RecordValue> {
        &self.0
    }
}

/// Single-level mapping from dotted field path to a scalar cell.
pub type FlatRow = BTreeMap<String, Scalar>;

/// Flattens a record into dotted paths. Lists become compact JSON text.
pub fn flatten_record(record: &Record) -> FlatRow {
    let mut row = FlatRow::new();
    flatten_into(&mut row, None, record.fields());
    row
}

fn flatten_into(row: &mut FlatRow, prefix: Option<&str>, fields: &BTreeMap<String, RecordValue>) {
    for (key, value) in fields {
        let path = match prefix {
            Some(prefix) => format!("{prefix}.{key}"),
            None => key.clone(),
        };
        match value {
            RecordValue::Map(nested) => flatten_into(row, Some(&path), nested),
            RecordValue::List(items) => {
                row.insert(path, Scalar::Text(encode_list(items)));
            }
            RecordValue::Scalar(scalar) => {
                row.insert(path, scalar.clone());
            }
        }
    }
}

// Map keys are BTreeMap-ordered, so the encoding is canonical.
fn encode_list(items: &[RecordValue]) -> String {
    serde_json::to_string(items).unwrap_or_default()
}

/// Value of the first preferred identity field that is present and not blank.
pub fn preferred_identity(row: &FlatRow) -> Option<String> {
    PREFERRED_IDENTITY_FIELDS
        .iter()
        .filter_map(|field| row.get(*field))
        .find(|value| !value.is_blank())
        .map(Scalar::render)
}

/// Canonical JSON of the whole row (sorted keys, identity column excluded).
pub fn fallback_identity(row: &FlatRow) -> String {
    let view = row
        .iter()
        .filter(|(key, _)| key.as_str() != IDENTITY_COLUMN)
        .collect::<BTreeMap<_, _>>();
    serde_json::to_string(&view).unwrap_or_default()
}

/// Stable identity for a row.
///
/// Rows without any preferred identity field fall back to their full content,
/// so they only deduplicate against byte-for-byte equal rows.
pub fn select_row_identity(row: &FlatRow) -> String {
    preferred_identity(row).unwrap_or_else(|| fallback_identity(row))
}

pub fn uses_fallback_identity(row: &FlatRow) -> bool {
    preferred_identity(row).is_none()
}

/// Metric category exposed by the usercollection API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    DailyActivity,
    DailyReadiness,
    DailySleep,
    DailySpo2,
    Heartrate,
    RestModePeriod,
    Session,
    Sleep,
    Tag,
    Workout,
}

impl Category {
    /// Every category, sorted by name.
    pub const ALL: [Category; 10] = [
        Category::DailyActivity,
        Category::DailyReadiness,
        Category::DailySleep,
        Category::DailySpo2,
        Category::Heartrate,
        Category::RestModePeriod,
        Category::Session,
        Category::Sleep,
        Category::Tag,
        Category::Workout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::DailyActivity => "daily_activity",
            Category::DailyReadiness => "daily_readiness",
            Category::DailySleep => "daily_sleep",
            Category::DailySpo2 => "daily_spo2",
            Category::Heartrate => "heartrate",
            Category::RestModePeriod => "rest_mode_period",
            Category::Session => "session",
            Category::Sleep => "sleep",
            Category::Tag => "tag",
            Category::Workout => "workout",
        }
    }

    pub fn endpoint(&self) -> String {
        format!("/{}", self.as_str())
    }

    fn known_names() -> String {
        Self::ALL
            .iter()
            .map(Category::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| ConfigError::UnknownCategory {
                name: s.to_string(),
                known: Self::known_names(),
            })
    }
}

/// Expands a user category selection. `all` (any case) selects every category.
pub fn resolve_categories<I, S>(raw: I) -> Result<Vec<Category>, ConfigError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let values = raw
        .into_iter()
        .map(|v| v.as_ref().trim().to_ascii_lowercase())
        .collect::<Vec<_>>();
    if values.iter().any(|v| v == "all") {
        return Ok(Category::ALL.to_vec());
    }

    let mut selected = Vec::with_capacity(values.len());
    for value in &values {
        let category = value.parse::<Category>()?;
        if !selected.contains(&category) {
            selected.push(category);
        }
    }
    Ok(selected)
}

/// Inclusive calendar-date window for one category fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl FetchWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self::new(start.date_naive(), end.date_naive())
    }

    pub fn start_param(&self) -> String {
        self.start.format("%Y-%m-%d").to_string()
    }

    pub fn end_param(&self) -> String {
        self.end.format("%Y-%m-%d").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn record(value: JsonValue) -> Record {
        Record::from_json(value).expect("object")
    }

    #[test]
    fn flattens_nested_maps_with_dotted_paths() {
        let rec = record(json!({
            "id": "abc",
            "contributors": {"activity_balance": 80, "hrv": {"balance": 75}},
            "score": 88
        }));
        let row = flatten_record(&rec);
        assert_eq!(row.get("id"), Some(&Scalar::text("abc")));
        assert_eq!(row.get("contributors.activity_balance"), Some(&Scalar::from(80_i64)));
        assert_eq!(row.get("contributors.hrv.balance"), Some(&Scalar::from(75_i64)));
        assert_eq!(row.get("score"), Some(&Scalar::from(88_i64)));
        assert_eq!(row.len(), 4);
    }

    #[test]
    fn lists_are_encoded_as_canonical_json() {
        let rec = record(json!({
            "heart_rate": {"items": [60, null, 58.5]},
            "segments": [{"b": 2, "a": 1}]
        }));
        let row = flatten_record(&rec);
        assert_eq!(row["heart_rate.items"].render(), "[60,null,58.5]");
        assert_eq!(row["segments"].render(), r#"[{"a":1,"b":2}]"#);
    }

    #[test]
    fn empty_nested_map_contributes_no_columns() {
        let row = flatten_record(&record(json!({"id": "x", "meta": {}})));
        assert_eq!(row.keys().collect::<Vec<_>>(), vec!["id"]);
    }

    #[test]
    fn flattening_and_identity_are_stable() {
        let raw = json!({"day": "2024-03-01", "score": 71, "tags": ["a", "b"]});
        let first = flatten_record(&record(raw.clone()));
        let second = flatten_record(&record(raw));
        assert_eq!(first, second);
        assert_eq!(select_row_identity(&first), select_row_identity(&second));
        assert_eq!(select_row_identity(&first), "2024-03-01");
    }

    #[test]
    fn identity_follows_preferred_field_order() {
        let row = flatten_record(&record(json!({
            "timestamp": "2024-03-01T10:00:00+00:00",
            "day": "2024-03-01",
            "id": "rec-1"
        })));
        assert_eq!(select_row_identity(&row), "rec-1");

        let row = flatten_record(&record(json!({
            "timestamp": "2024-03-01T10:00:00+00:00",
            "day": "2024-03-01"
        })));
        assert_eq!(select_row_identity(&row), "2024-03-01");
    }

    #[test]
    fn blank_preferred_fields_are_skipped() {
        let row = flatten_record(&record(json!({
            "id": "",
            "uuid": null,
            "day": "2024-03-02"
        })));
        assert_eq!(select_row_identity(&row), "2024-03-02");
        assert!(!uses_fallback_identity(&row));
    }

    #[test]
    fn numeric_identity_renders_as_text() {
        let row = flatten_record(&record(json!({"id": 42})));
        assert_eq!(select_row_identity(&row), "42");
    }

    #[test]
    fn rows_without_preferred_fields_use_full_content() {
        let row = flatten_record(&record(json!({"score": 5, "label": "walk"})));
        assert!(uses_fallback_identity(&row));
        assert_eq!(select_row_identity(&row), r#"{"label":"walk","score":5}"#);

        let mut with_identity = row.clone();
        with_identity.insert(IDENTITY_COLUMN.to_string(), Scalar::text("stale"));
        assert_eq!(select_row_identity(&with_identity), select_row_identity(&row));
    }

    #[test]
    fn scalar_rendering() {
        assert_eq!(Scalar::Null.render(), "");
        assert_eq!(Scalar::Bool(true).render(), "true");
        assert_eq!(Scalar::from(7_i64).render(), "7");
        assert_eq!(Scalar::text("x y").render(), "x y");
    }

    #[test]
    fn category_names_round_trip_and_reject_unknown() {
        for category in Category::ALL {
            assert_eq!(category.as_str().parse::<Category>(), Ok(category));
        }
        assert_eq!("SLEEP".parse::<Category>(), Ok(Category::Sleep));
        assert_eq!(Category::DailySpo2.endpoint(), "/daily_spo2");

        let err = "steps".parse::<Category>().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownCategory { ref name, .. } if name == "steps"));
        assert!(err.to_string().contains("daily_activity"));
    }

    #[test]
    fn resolve_all_selects_every_category_sorted() {
        let all = resolve_categories(["sleep", "All"]).expect("resolve");
        assert_eq!(all, Category::ALL.to_vec());
        let names = all.iter().map(Category::as_str).collect::<Vec<_>>();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn resolve_explicit_list_keeps_order_and_drops_duplicates() {
        let picked = resolve_categories(["workout", "Sleep", "workout"]).expect("resolve");
        assert_eq!(picked, vec![Category::Workout, Category::Sleep]);
        assert!(resolve_categories(["sleep", "bogus"]).is_err());
    }

    #[test]
    fn fetch_window_uses_calendar_dates() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 23, 30, 0).single().unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 3, 1, 0, 0).single().unwrap();
        let window = FetchWindow::between(start, end);
        assert_eq!(window.start_param(), "2024-03-01");
        assert_eq!(window.end_param(), "2024-03-03");
    }
}
