//! Progress parsers for populator and conversion workers
//!
//! Workers report either one JSON object per line on stdout or a Prometheus
//! gauge `v2v_disk_transfers{disk_id="N"}` on their metrics endpoint.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

/// Metric name exported by transfer workers
pub const DISK_TRANSFERS_METRIC: &str = "v2v_disk_transfers";

static SAMPLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-zA-Z_:][a-zA-Z0-9_:]*)(?:\{([^}]*)\})?\s+([-+0-9.eE]+|NaN|\+Inf|-Inf)")
        .expect("valid sample regex")
});

static LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([a-zA-Z_][a-zA-Z0-9_]*)="((?:[^"\\]|\\.)*)""#)
        .expect("valid label regex")
});

/// One structured progress line
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ProgressLine {
    /// Bytes written so far
    pub transferred: u64,
    /// Total bytes, when the worker knows it
    #[serde(default)]
    pub size: Option<u64>,
    /// Seconds since the worker started
    #[serde(default)]
    pub elapsed: Option<f64>,
    /// Free-form status
    #[serde(default)]
    pub description: Option<String>,
}

/// Parse a single JSON progress line
pub fn parse_json_line(line: &str) -> Option<ProgressLine> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    serde_json::from_str(line).ok()
}

/// Most recent progress line in a log excerpt
pub fn last_json_progress(log: &str) -> Option<ProgressLine> {
    log.lines().rev().find_map(parse_json_line)
}

/// One Prometheus sample
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    /// Metric name
    pub name: String,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Value
    pub value: f64,
}

/// Parse Prometheus text exposition, skipping comments and malformed lines
pub fn parse_prometheus(text: &str) -> Vec<Sample> {
    text.lines()
        .filter(|l| !l.starts_with('#'))
        .filter_map(|line| {
            let caps = SAMPLE.captures(line.trim())?;
            let value = caps.get(3)?.as_str().parse::<f64>().ok()?;
            let labels = caps
                .get(2)
                .map(|m| {
                    LABEL
                        .captures_iter(m.as_str())
                        .map(|c| (c[1].to_string(), c[2].replace("\\\"", "\"")))
                        .collect()
                })
                .unwrap_or_default();
            Some(Sample {
                name: caps[1].to_string(),
                labels,
                value,
            })
        })
        .collect()
}

/// `v2v_disk_transfers` values keyed by `disk_id`
pub fn disk_transfers(text: &str) -> BTreeMap<String, f64> {
    parse_prometheus(text)
        .into_iter()
        .filter(|s| s.name == DISK_TRANSFERS_METRIC && s.value.is_finite())
        .filter_map(|s| Some((s.labels.get("disk_id")?.clone(), s.value)))
        .collect()
}
