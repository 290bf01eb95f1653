use serde::Serialize;
use serde_json::{json, Map, Value as JsonValue};

use crate::{
    field_path::resolve,
    paginate::{Page, TableState},
    timeseries::{normalize, FieldMapping, KeyRole, OHLCV_ALIASES, SeriesPoint},
    utils::first_present,
    widget::{card_fields, LiveSeries, Widget, WidgetKind},
};

pub const TIME_SERIES_COLUMNS: &[&str] = &["date", "open", "high", "low", "close", "volume"];

/// Looser than the chart classifier: any key mentioning a period counts.
fn table_series_key(payload: &JsonValue) -> Option<&str> {
    let obj = payload.as_object()?;
    obj.keys().map(String::as_str).find(|k| {
        let lower = k.to_lowercase();
        crate::timeseries::key_matches(k, KeyRole::SeriesMap)
            || lower.contains("daily")
            || lower.contains("weekly")
            || lower.contains("monthly")
    })
}

/// Rows for a table widget.
///
/// Time-series maps become `{date, open, high, low, close, volume, __raw}`
/// rows, newest first, with values left as the provider sent them. Arrays are
/// used as-is; an object contributes its first array member, or itself.
pub fn table_rows(payload: &JsonValue) -> Vec<JsonValue> {
    if let Some(key) = table_series_key(payload) {
        let Some(series) = payload.get(key).and_then(JsonValue::as_object) else {
            return Vec::new();
        };
        let mut rows: Vec<JsonValue> = series
            .iter()
            .map(|(date, bar)| {
                let mut row = Map::new();
                row.insert("date".into(), JsonValue::String(date.clone()));
                for (name, aliases) in OHLCV_ALIASES {
                    let v = first_present(bar, aliases).cloned().unwrap_or(JsonValue::Null);
                    row.insert((*name).into(), v);
                }
                row.insert("__raw".into(), bar.clone());
                JsonValue::Object(row)
            })
            .collect();
        rows.sort_by(|a, b| b["date"].as_str().cmp(&a["date"].as_str()));
        return rows;
    }

    match payload {
        JsonValue::Array(items) => items.clone(),
        JsonValue::Object(map) => match map.values().find(|v| v.is_array()) {
            Some(JsonValue::Array(items)) => items.clone(),
            _ => vec![payload.clone()],
        },
        _ => Vec::new(),
    }
}

fn is_time_series_rows(rows: &[JsonValue]) -> bool {
    rows.first()
        .and_then(JsonValue::as_object)
        .map(|r| r.contains_key("date") && (r.contains_key("open") || r.contains_key("__raw")))
        .unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableView {
    pub columns: Vec<String>,
    pub page: Page<JsonValue>,
}

/// Builds the table shown for `payload`.
///
/// With selected fields on an object payload the table lists one
/// `{field, value}` row per path; otherwise rows come from [`table_rows`] and
/// the columns are the selected fields, the OHLCV set, or the first row's keys.
pub fn table_view(payload: &JsonValue, fields: &[String], state: &mut TableState) -> TableView {
    let rows = table_rows(payload);
    let series_rows = is_time_series_rows(&rows);
    let per_field = !fields.is_empty() && payload.is_object() && !series_rows;

    if per_field {
        let field_rows: Vec<JsonValue> = fields
            .iter()
            .map(|f| json!({"field": f, "value": resolve(payload, f).cloned()}))
            .collect();
        return TableView {
            columns: vec!["field".into(), "value".into()],
            page: state.apply(&field_rows),
        };
    }

    let columns: Vec<String> = if !fields.is_empty() && !series_rows {
        fields.to_vec()
    } else if series_rows {
        TIME_SERIES_COLUMNS.iter().map(|c| c.to_string()).collect()
    } else {
        rows.first()
            .and_then(JsonValue::as_object)
            .map(|r| r.keys().filter(|k| !k.starts_with("__")).cloned().collect())
            .unwrap_or_default()
    };

    let projected: Vec<JsonValue> = if !fields.is_empty() && !series_rows {
        rows.iter()
            .map(|row| {
                let mut out = Map::new();
                for col in &columns {
                    out.insert(col.clone(), resolve(row, col).cloned().unwrap_or(JsonValue::Null));
                }
                JsonValue::Object(out)
            })
            .collect()
    } else {
        rows
    };

    TableView {
        columns,
        page: state.apply(&projected),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CardEntry {
    pub path: String,
    pub value: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CardView {
    /// Selected fields (plus `live`) resolved against the payload.
    Fields { entries: Page<CardEntry> },
    /// No fields selected and an array payload: page through its items.
    Items { items: Page<JsonValue> },
    /// No fields selected: just the live value, if any.
    Live { live: Option<JsonValue> },
}

pub fn card_view(payload: &JsonValue, fields: &[String], state: &mut TableState) -> CardView {
    let fields = card_fields(fields);
    if !fields.is_empty() {
        let entries: Vec<CardEntry> = fields
            .iter()
            .map(|f| CardEntry {
                path: f.clone(),
                value: resolve(payload, f).cloned(),
            })
            .collect();
        return CardView::Fields {
            entries: state.apply(&entries),
        };
    }
    match payload {
        JsonValue::Array(items) => CardView::Items {
            items: state.apply(items),
        },
        _ => CardView::Live {
            live: resolve(payload, crate::widget::LIVE_FIELD).cloned(),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartView {
    pub points: Vec<SeriesPoint>,
    pub live: Vec<SeriesPoint>,
}

pub fn chart_view(payload: &JsonValue, mapping: Option<&FieldMapping>, live: Option<&LiveSeries>) -> ChartView {
    ChartView {
        points: normalize(payload, mapping),
        live: live.map(LiveSeries::points).unwrap_or_default(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WidgetView {
    Table(TableView),
    Card(CardView),
    Chart(ChartView),
}

/// Picks the view matching the widget's kind.
pub fn widget_view(
    widget: &Widget,
    payload: &JsonValue,
    live: Option<&LiveSeries>,
    state: &mut TableState,
) -> WidgetView {
    match widget.kind {
        WidgetKind::Table => WidgetView::Table(table_view(payload, &widget.config.fields, state)),
        WidgetKind::Card => WidgetView::Card(card_view(payload, &widget.config.fields, state)),
        WidgetKind::Chart => WidgetView::Chart(chart_view(payload, widget.config.mapping.as_ref(), live)),
    }
}
