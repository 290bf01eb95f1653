use std::cmp::Ordering;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};

use crate::{
    field_path::resolve,
    utils::{first_present, is_date_like, parse_date_ms, parse_number, parse_number_opt},
};

/// Explicit x/y field paths chosen by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

impl FieldMapping {
    pub fn new(x: Option<&str>, y: Option<&str>) -> Self {
        Self {
            x: x.map(str::to_string),
            y: y.map(str::to_string),
        }
    }

    /// A mapping only counts when at least one side names a path.
    pub fn is_active(&self) -> bool {
        self.x_path().is_some() || self.y_path().is_some()
    }

    pub fn x_path(&self) -> Option<&str> {
        self.x.as_deref().filter(|s| !s.is_empty())
    }

    pub fn y_path(&self) -> Option<&str> {
        self.y.as_deref().filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub x: JsonValue,
    pub y: f64,
    pub raw: JsonValue,
}

/// Role a key plays in the shape heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    /// Object key holding a `date -> bar` map.
    SeriesMap,
    /// Preferred x column when no date-valued key was found.
    XColumn,
    /// Preferred y column when no numeric key was found.
    YColumn,
}

pub struct KeyPolicy {
    pub role: KeyRole,
    pub pattern: Regex,
}

/// Ordered key-name policy. Earlier entries win within a role.
pub static KEY_POLICIES: Lazy<Vec<KeyPolicy>> = Lazy::new(|| {
    let table: &[(KeyRole, &str)] = &[
        (KeyRole::SeriesMap, r"(?i)time series"),
        (KeyRole::SeriesMap, r"(?i)(daily|weekly|monthly).*time series"),
        (KeyRole::YColumn, r"(?i)close|value|price|rate|last"),
        (KeyRole::XColumn, r"(?i)date|time|timestamp"),
    ];
    table
        .iter()
        .filter_map(|(role, pat)| match Regex::new(pat) {
            Ok(pattern) => Some(KeyPolicy { role: *role, pattern }),
            Err(e) => {
                log::error!("timeseries.policy.invalid pattern={pat} err={e}");
                None
            }
        })
        .collect()
});

/// Returns the first key (in `keys` order) matching any policy of `role`.
pub fn find_key_by_role<'a, I>(keys: I, role: KeyRole) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a String>,
{
    keys.into_iter()
        .map(String::as_str)
        .find(|k| key_matches(k, role))
}

pub fn key_matches(key: &str, role: KeyRole) -> bool {
    KEY_POLICIES
        .iter()
        .filter(|p| p.role == role)
        .any(|p| p.pattern.is_match(key))
}

/// Canonical OHLCV fields and the keys providers use for them.
pub const OHLCV_ALIASES: &[(&str, &[&str])] = &[
    ("open", &["1. open", "open", "o"]),
    ("high", &["2. high", "high", "h"]),
    ("low", &["3. low", "low", "l"]),
    ("close", &["4. close", "close", "c"]),
    ("volume", &["5. volume", "volume", "v"]),
];

/// The `date -> bar` map of a named time-series payload, if there is one.
pub fn find_series_map(payload: &JsonValue) -> Option<(&str, &JsonValue)> {
    let obj = payload.as_object()?;
    let key = find_key_by_role(obj.keys(), KeyRole::SeriesMap)?;
    obj.get(key).map(|v| (key, v))
}

/// One bar of a named time series, OHLCV values parsed to numbers.
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub date: String,
    pub values: [Option<f64>; 5],
    pub raw: JsonValue,
}

impl Bar {
    fn from_entry(date: &str, raw: &JsonValue) -> Self {
        let mut values = [None; 5];
        for (slot, (_, aliases)) in values.iter_mut().zip(OHLCV_ALIASES) {
            *slot = parse_number_opt(first_present(raw, aliases));
        }
        Self {
            date: date.to_string(),
            values,
            raw: raw.clone(),
        }
    }

    pub fn close(&self) -> Option<f64> {
        self.values[3]
    }

    /// Row form used for mapping resolution: `{x, open, high, low, close, volume, __raw}`.
    pub fn to_row(&self) -> JsonValue {
        let mut row = Map::new();
        row.insert("x".into(), JsonValue::String(self.date.clone()));
        for ((name, _), v) in OHLCV_ALIASES.iter().zip(self.values) {
            row.insert((*name).into(), v.map(|x| json!(x)).unwrap_or(JsonValue::Null));
        }
        row.insert("__raw".into(), self.raw.clone());
        JsonValue::Object(row)
    }
}

/// Bars of a `date -> bar` map, oldest first. Dates that do not parse keep
/// their source order after the ones that do.
pub fn bars_ascending(series: &JsonValue) -> Vec<Bar> {
    let Some(map) = series.as_object() else {
        return Vec::new();
    };
    let mut bars: Vec<(Option<i64>, Bar)> = map
        .iter()
        .map(|(date, raw)| (parse_date_ms(date), Bar::from_entry(date, raw)))
        .collect();
    bars.sort_by(|(a, _), (b, _)| match (a, b) {
        (Some(a), Some(b)) => a.cmp(b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
    bars.into_iter().map(|(_, bar)| bar).collect()
}

/// Normalizes `payload` into chart points.
///
/// Named time-series maps come out in ascending date order; arrays keep their
/// source order.
pub fn normalize(payload: &JsonValue, mapping: Option<&FieldMapping>) -> Vec<SeriesPoint> {
    let mapping = mapping.filter(|m| m.is_active());

    if let Some((_, series)) = find_series_map(payload) {
        return normalize_series_map(series, mapping);
    }

    match payload {
        JsonValue::Array(rows) if !rows.is_empty() => match mapping {
            Some(m) => normalize_mapped_rows(rows, m),
            None => normalize_rows_heuristic(rows),
        },
        _ => Vec::new(),
    }
}

fn normalize_series_map(series: &JsonValue, mapping: Option<&FieldMapping>) -> Vec<SeriesPoint> {
    let bars = bars_ascending(series);

    match mapping {
        Some(m) => bars
            .into_iter()
            .filter_map(|bar| {
                let row = bar.to_row();
                let x = match m.x_path() {
                    Some(p) => resolve(&row, p).cloned().unwrap_or(JsonValue::Null),
                    None => JsonValue::String(bar.date.clone()),
                };
                let y = match m.y_path() {
                    Some(p) => parse_number_opt(resolve(&row, p)),
                    None => bar.close(),
                }?;
                Some(SeriesPoint { x, y, raw: row })
            })
            .collect(),
        None => bars
            .into_iter()
            .filter_map(|bar| {
                let y = bar.close()?;
                Some(SeriesPoint {
                    x: JsonValue::String(bar.date.clone()),
                    y,
                    raw: bar.to_row(),
                })
            })
            .collect(),
    }
}

fn normalize_mapped_rows(rows: &[JsonValue], m: &FieldMapping) -> Vec<SeriesPoint> {
    rows.iter()
        .filter_map(|row| {
            let x = match m.x_path() {
                Some(p) => resolve(row, p).cloned(),
                None => first_present(row, &["x", "time", "timestamp"]).cloned(),
            }
            .unwrap_or(JsonValue::Null);
            let y = match m.y_path() {
                Some(p) => parse_number_opt(resolve(row, p)),
                None => parse_number_opt(first_present(row, &["value", "y", "close"])),
            }?;
            Some(SeriesPoint { x, y, raw: row.clone() })
        })
        .collect()
}

/// Guesses the x/y columns of a homogeneous array from its first element.
///
/// A date-valued string picks x and a number (or numeric string) picks y;
/// the key-name policy fills in whichever is still missing.
pub fn detect_columns(sample: &JsonValue) -> (Option<String>, Option<String>) {
    let Some(obj) = sample.as_object() else {
        return (None, None);
    };

    let mut x_key: Option<&str> = None;
    let mut y_key: Option<&str> = None;
    for (k, v) in obj {
        if x_key.is_none() && is_date_like(v) {
            x_key = Some(k);
        }
        if y_key.is_none() && parse_number(v).is_some() {
            y_key = Some(k);
        }
        if x_key.is_some() && y_key.is_some() {
            break;
        }
    }
    if y_key.is_none() {
        y_key = find_key_by_role(obj.keys(), KeyRole::YColumn);
    }
    if x_key.is_none() {
        x_key = find_key_by_role(obj.keys(), KeyRole::XColumn);
    }
    (x_key.map(str::to_string), y_key.map(str::to_string))
}

fn normalize_rows_heuristic(rows: &[JsonValue]) -> Vec<SeriesPoint> {
    let (x_key, y_key) = detect_columns(&rows[0]);

    if let Some(y_key) = y_key {
        return rows
            .iter()
            .filter_map(|row| {
                let y = parse_number_opt(resolve(row, &y_key))?;
                let x = x_key
                    .as_deref()
                    .and_then(|k| resolve(row, k))
                    .cloned()
                    .unwrap_or(JsonValue::Null);
                Some(SeriesPoint { x, y, raw: row.clone() })
            })
            .collect();
    }

    let numbers: Option<Vec<f64>> = rows.iter().map(parse_number).collect();
    match numbers {
        Some(ys) => ys
            .into_iter()
            .zip(rows)
            .enumerate()
            .map(|(i, (y, raw))| SeriesPoint {
                x: json!(i),
                y,
                raw: raw.clone(),
            })
            .collect(),
        None => Vec::new(),
    }
}
