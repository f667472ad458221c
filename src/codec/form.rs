// Copyright 2023 Greptime Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Form-value parsing shared by the codecs.
//!
//! Prometheus-compatible endpoints accept parameters in the query string and,
//! for POST, in a form-encoded body. Time parameters are RFC3339 or unix
//! seconds as a float.

use std::collections::HashMap;

use bytes::Bytes;
use chrono::DateTime;
use http::{HeaderMap, Method};

use crate::error::{Error, Result};
use crate::promql;
use crate::request::{CachingOptions, MatcherSet, RequestHeader, ShardInfo};

pub const CACHE_CONTROL_HEADER: &str = "cache-control";
pub const NO_STORE_VALUE: &str = "no-store";

/// 0001-01-01T00:00:00Z, the "unbounded" range start.
pub const INF_MIN_TIME_MS: i64 = -62_135_596_800_000;
/// 9999-12-31T23:59:59Z, the "unbounded" range end.
pub const INF_MAX_TIME_MS: i64 = 253_402_300_799_000;

/// The merged view of query-string and form-body parameters.
#[derive(Debug, Default)]
pub struct FormParams {
    values: HashMap<String, Vec<String>>,
}

impl FormParams {
    /// Parses the query string plus, for POST, the form-encoded body.
    pub fn parse(req: &http::Request<Bytes>) -> Self {
        let mut values: HashMap<String, Vec<String>> = HashMap::new();

        if let Some(query) = req.uri().query() {
            for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
                values.entry(name.into_owned()).or_default().push(value.into_owned());
            }
        }

        if req.method() == Method::POST && is_form_encoded(req.headers()) {
            for (name, value) in url::form_urlencoded::parse(req.body()) {
                values.entry(name.into_owned()).or_default().push(value.into_owned());
            }
        }

        Self { values }
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.values
            .get(name)
            .and_then(|v| v.first())
            .map(|s| s.as_str())
    }

    pub fn values(&self, name: &str) -> &[String] {
        self.values.get(name).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

fn is_form_encoded(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false)
}

/// Parses a time parameter: unix seconds as a float, or RFC3339. Returns
/// unix milliseconds.
pub fn parse_time(param: &str, value: &str) -> Result<i64> {
    if let Ok(seconds) = value.parse::<f64>() {
        return Ok((seconds * 1000.0).round() as i64);
    }
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.timestamp_millis())
        .map_err(|e| Error::InvalidParameter {
            param: param.to_string(),
            reason: format!("cannot parse {value:?} as a timestamp: {e}"),
        })
}

/// Parses a duration parameter: seconds as a float, or a PromQL duration
/// like `5m`. Returns milliseconds.
pub fn parse_duration_millis(param: &str, value: &str) -> Result<i64> {
    if let Ok(seconds) = value.parse::<f64>() {
        if seconds.is_finite() {
            return Ok((seconds * 1000.0).round() as i64);
        }
    }
    promql_parser::util::parse_duration(value)
        .map(|d| d.as_millis() as i64)
        .map_err(|reason| Error::InvalidParameter {
            param: param.to_string(),
            reason,
        })
}

pub fn parse_bool(param: &str, value: &str) -> Result<bool> {
    value.parse::<bool>().map_err(|_| Error::InvalidParameter {
        param: param.to_string(),
        reason: format!("cannot parse {value:?} as a boolean"),
    })
}

/// `dedup` defaults to true when absent.
pub fn parse_dedup(params: &FormParams, name: &str) -> Result<bool> {
    match params.value(name) {
        Some(value) => parse_bool(name, value),
        None => Ok(true),
    }
}

pub fn parse_partial_response(params: &FormParams, name: &str, default: bool) -> Result<bool> {
    match params.value(name) {
        Some(value) => parse_bool(name, value),
        None => Ok(default),
    }
}

/// Parses repeated selector parameters (`match[]`, `storeMatch[]`) into
/// matcher sets.
pub fn parse_matchers(params: &FormParams, name: &str) -> Result<Vec<MatcherSet>> {
    params
        .values(name)
        .iter()
        .map(|selector| promql::parse_metric_selector(selector))
        .collect()
}

pub fn parse_shard_info(params: &FormParams, name: &str) -> Result<Option<ShardInfo>> {
    let Some(value) = params.value(name) else {
        return Ok(None);
    };
    if value.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(value)
        .map(Some)
        .map_err(|e| Error::InvalidParameter {
            param: name.to_string(),
            reason: e.to_string(),
        })
}

/// Start/end of a metadata request, defaulting to
/// `[now - default_range, now]`, or an unbounded range when the default is
/// zero. Enforces `end >= start`.
pub fn parse_metadata_time_range(
    params: &FormParams,
    default_range_ms: i64,
    now_ms: i64,
) -> Result<(i64, i64)> {
    let (default_start, default_end) = if default_range_ms == 0 {
        (INF_MIN_TIME_MS, INF_MAX_TIME_MS)
    } else {
        (now_ms - default_range_ms, now_ms)
    };

    let start = match params.value("start") {
        Some(value) => parse_time("start", value)?,
        None => default_start,
    };
    let end = match params.value("end") {
        Some(value) => parse_time("end", value)?,
        None => default_end,
    };
    if end < start {
        return Err(Error::EndBeforeStart);
    }
    Ok((start, end))
}

/// Unix milliseconds as fractional seconds with millisecond precision, the
/// format the downstream query API expects.
pub fn encode_time(ms: i64) -> String {
    format!("{:.3}", ms as f64 / 1000.0)
}

/// Milliseconds as a fractional-seconds string.
pub fn encode_duration_millis(ms: i64) -> String {
    (ms as f64 / 1000.0).to_string()
}

/// Copies allow-listed headers (case-insensitive) off the incoming request.
pub fn forwarded_headers(headers: &HeaderMap, forward: &[String]) -> Vec<RequestHeader> {
    let mut result = Vec::new();
    for name in forward {
        let values: Vec<String> = headers
            .get_all(name.to_ascii_lowercase().as_str())
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .collect();
        if !values.is_empty() {
            result.push(RequestHeader {
                name: name.clone(),
                values,
            });
        }
    }
    result
}

/// `Cache-Control: no-store` disables caching for the request.
pub fn caching_options(headers: &HeaderMap) -> CachingOptions {
    let disabled = headers
        .get_all(CACHE_CONTROL_HEADER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains(NO_STORE_VALUE));
    CachingOptions { disabled }
}
