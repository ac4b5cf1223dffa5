//! Turns a [`DashboardUiConfig`] into the query suffix of the embed URL.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::telemetry::EmbedLog;

pub const HIDE_TITLE: u32 = 1;
pub const HIDE_TAB: u32 = 2;
// 4 is reserved by the dashboard app.
pub const HIDE_CHART_CONTROLS: u32 = 8;

/// Filter keys the dashboard app understands.
pub const FILTER_CONFIG_KEYS: &[&str] = &["visible", "expanded"];

/// Display options for an embedded dashboard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DashboardUiConfig {
    pub hide_title: bool,
    pub hide_tab: bool,
    pub hide_chart_controls: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Map<String, Value>>,
    #[serde(alias = "urlParams", skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
}

impl DashboardUiConfig {
    pub fn with_hide_title(mut self, hide: bool) -> Self {
        self.hide_title = hide;
        self
    }

    pub fn with_hide_tab(mut self, hide: bool) -> Self {
        self.hide_tab = hide;
        self
    }

    pub fn with_hide_chart_controls(mut self, hide: bool) -> Self {
        self.hide_chart_controls = hide;
        self
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    /// Sum of the weights of every enabled display flag.
    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.hide_title {
            bits += HIDE_TITLE;
        }
        if self.hide_tab {
            bits += HIDE_TAB;
        }
        if self.hide_chart_controls {
            bits += HIDE_CHART_CONTROLS;
        }
        bits
    }
}

/// Keys of `filters` that are not on the allow-list, in map order.
pub fn unrecognized_filter_keys(filters: &Map<String, Value>) -> Vec<&str> {
    filters
        .keys()
        .map(String::as_str)
        .filter(|key| !FILTER_CONFIG_KEYS.contains(key))
        .collect()
}

/// Logs filter keys the dashboard will not recognise. Every key is kept.
fn check_filter_params<'a>(
    filters: Option<&'a Map<String, Value>>,
    log: &EmbedLog,
) -> Option<&'a Map<String, Value>> {
    let filters = filters.filter(|filters| !filters.is_empty())?;
    for key in unrecognized_filter_keys(filters) {
        log.debug(format_args!("Filter key '{key}' not allowed in filterConfig"));
    }
    Some(filters)
}

/// Builds the query suffix appended to `/embedded/{id}`.
///
/// `uiConfig` only appears when at least one flag is set. Params and filters
/// are merged (filters win), sorted by key and written without
/// percent-encoding.
pub fn query_suffix(config: Option<&DashboardUiConfig>, log: &EmbedLog) -> String {
    let Some(config) = config else {
        return String::new();
    };

    let mut suffix = String::new();
    let bits = config.bits();
    if bits != 0 {
        let _ = write!(suffix, "?uiConfig={bits}");
    }

    let mut merged: BTreeMap<&str, &Value> = BTreeMap::new();
    if let Some(params) = &config.params {
        merged.extend(params.iter().map(|(key, value)| (key.as_str(), value)));
    }
    if let Some(filters) = check_filter_params(config.filters.as_ref(), log) {
        merged.extend(filters.iter().map(|(key, value)| (key.as_str(), value)));
    }

    let params = stringify(&merged);
    if !params.is_empty() {
        suffix.push(if suffix.is_empty() { '?' } else { '&' });
        suffix.push_str(&params);
    }
    suffix
}

fn stringify(params: &BTreeMap<&str, &Value>) -> String {
    let mut pairs = Vec::with_capacity(params.len());
    for (key, value) in params {
        match value {
            Value::Array(items) => {
                pairs.extend(items.iter().map(|item| pair(key, item)));
            }
            other => pairs.push(pair(key, other)),
        }
    }
    pairs.join("&")
}

fn pair(key: &str, value: &Value) -> String {
    match value {
        Value::Null => key.to_string(),
        Value::String(text) => format!("{key}={text}"),
        other => format!("{key}={other}"),
    }
}
