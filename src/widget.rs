use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::{
    field_path::resolve_opt,
    timeseries::{FieldMapping, SeriesPoint},
    utils::{first_present, iso_from_ms, now_ms, parse_date_ms, parse_number},
};

/// Floor for any configured refresh interval.
pub const MIN_REFRESH_INTERVAL_MS: u64 = 5_000;
/// Interval assigned when a new widget does not specify one.
pub const CREATE_REFRESH_INTERVAL_MS: u64 = 30_000;
/// Interval used by a widget that carries none at all.
pub const FALLBACK_REFRESH_INTERVAL_MS: u64 = 60_000;

pub const LIVE_FIELD: &str = "live";
pub const LIVE_VALUE_KEYS: &[&str] = &["price", "value", "last"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WidgetKind {
    Table,
    Card,
    Chart,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    #[default]
    Dark,
}

impl Theme {
    pub fn toggled(self) -> Self {
        match self {
            Theme::Light => Theme::Dark,
            Theme::Dark => Theme::Light,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    Line,
    Candlestick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeriesInterval {
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardType {
    Watchlist,
    Gainers,
    Performance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationConfig {
    pub page_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbols: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_type: Option<ChartType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<SeriesInterval>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_type: Option<CardType>,
    #[serde(default)]
    pub fields: Vec<String>,
    /// Milliseconds. Clamped when the widget is created or edited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<FieldMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PaginationConfig>,
}

impl WidgetConfig {
    /// Applies the refresh floor; a missing interval gets the creation default.
    pub fn clamp_refresh(&mut self) {
        let raw = self.refresh_interval.unwrap_or(CREATE_REFRESH_INTERVAL_MS);
        self.refresh_interval = Some(raw.max(MIN_REFRESH_INTERVAL_MS));
    }

    pub fn api_url(&self) -> Option<&str> {
        self.api_url.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    pub fn poll_interval_ms(&self) -> u64 {
        self.refresh_interval.unwrap_or(FALLBACK_REFRESH_INTERVAL_MS)
    }

    /// Socket channel carrying live prices for the configured symbol.
    pub fn live_channel(&self) -> Option<String> {
        self.symbol
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("symbol:{s}"))
    }

    pub fn mapping_y(&self) -> Option<&str> {
        self.mapping.as_ref().and_then(|m| m.y_path())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Position {
    pub x: i64,
    pub y: i64,
    pub w: i64,
    pub h: i64,
}

impl Default for Position {
    fn default() -> Self {
        Self { x: 0, y: 0, w: 4, h: 4 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Widget {
    /// Empty when read from a file without ids; the store assigns one.
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: WidgetKind,
    pub title: String,
    #[serde(default)]
    pub config: WidgetConfig,
    #[serde(default)]
    pub position: Position,
}

pub fn new_widget_id() -> String {
    format!("widget-{}", uuid::Uuid::new_v4().simple())
}

impl Widget {
    pub fn new(kind: WidgetKind, title: impl Into<String>, mut config: WidgetConfig) -> Self {
        config.clamp_refresh();
        Self {
            id: new_widget_id(),
            kind,
            title: title.into(),
            config,
            position: Position::default(),
        }
    }
}

/// Partial edit of a widget; absent members are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WidgetPatch {
    #[serde(default, rename = "type")]
    pub kind: Option<WidgetKind>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub config: Option<WidgetConfig>,
    #[serde(default)]
    pub position: Option<Position>,
}

impl WidgetPatch {
    pub fn apply(self, w: &mut Widget) {
        if let Some(kind) = self.kind {
            w.kind = kind;
        }
        if let Some(title) = self.title {
            w.title = title;
        }
        if let Some(mut config) = self.config {
            config.clamp_refresh();
            w.config = config;
        }
        if let Some(position) = self.position {
            w.position = position;
        }
    }
}

/// Price carried by a socket frame: `price`, `value` or `last`, falling back to
/// the widget's mapped y path.
pub fn live_value(frame: &JsonValue, mapping_y: Option<&str>) -> Option<JsonValue> {
    first_present(frame, LIVE_VALUE_KEYS)
        .or_else(|| resolve_opt(frame, mapping_y).filter(|v| !v.is_null()))
        .cloned()
}

/// Writes `live` into the latest payload so `live` resolves like any field.
///
/// Arrays get it on their first element (replacing a non-object element);
/// objects get it directly; anything else becomes `{"live": ..}`.
pub fn merge_live_value(payload: &mut JsonValue, live: JsonValue) {
    match payload {
        JsonValue::Array(items) => {
            if let Some(JsonValue::Object(first)) = items.first_mut() {
                first.insert(LIVE_FIELD.into(), live);
            } else if items.is_empty() {
                items.push(json!({ LIVE_FIELD: live }));
            } else {
                items[0] = json!({ LIVE_FIELD: live });
            }
        }
        JsonValue::Object(map) => {
            map.insert(LIVE_FIELD.into(), live);
        }
        _ => *payload = json!({ LIVE_FIELD: live }),
    }
}

/// Card fields with `live` appended so streamed prices show up.
pub fn card_fields(fields: &[String]) -> Vec<String> {
    if fields.is_empty() {
        return Vec::new();
    }
    let mut out = fields.to_vec();
    if !out.iter().any(|f| f == LIVE_FIELD) {
        out.push(LIVE_FIELD.to_string());
    }
    out
}

/// Bounded tail of streamed chart points.
#[derive(Debug, Clone)]
pub struct LiveSeries {
    cap: usize,
    points: VecDeque<SeriesPoint>,
}

impl LiveSeries {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            points: VecDeque::new(),
        }
    }

    /// Appends the frame's price at its `ts`/`time` (epoch ms, or a date
    /// string), defaulting to now. Frames without a numeric price are ignored.
    pub fn push_frame(&mut self, frame: &JsonValue) -> bool {
        let Some(y) = first_present(frame, LIVE_VALUE_KEYS).and_then(parse_number) else {
            return false;
        };
        let ts_ms = match first_present(frame, &["ts", "time"]) {
            Some(JsonValue::Number(n)) => n.as_f64().map(|x| x as i64),
            Some(JsonValue::String(s)) => parse_date_ms(s).or_else(|| s.trim().parse::<i64>().ok()),
            _ => None,
        }
        .unwrap_or_else(now_ms);
        let x = iso_from_ms(ts_ms).map(JsonValue::String).unwrap_or(JsonValue::Null);

        self.points.push_back(SeriesPoint { x, y, raw: frame.clone() });
        while self.points.len() > self.cap {
            self.points.pop_front();
        }
        true
    }

    pub fn points(&self) -> Vec<SeriesPoint> {
        self.points.iter().cloned().collect()
    }
}
