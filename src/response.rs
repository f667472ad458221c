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

//! Typed responses in the Prometheus JSON shape.
//!
//! Timestamps are unix milliseconds internally and serialize to the wire as
//! fractional unix seconds, values as strings, matching the Prometheus HTTP
//! API.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::de::{self, Deserializer};
use serde::ser::{SerializeTuple, Serializer};
use serde::{Deserialize, Serialize};

pub const STATUS_SUCCESS: &str = "success";

pub const RESULT_TYPE_MATRIX: &str = "matrix";
pub const RESULT_TYPE_VECTOR: &str = "vector";

/// A label set. The ordered map gives every set one canonical form.
pub type LabelSet = BTreeMap<String, String>;

/// Canonical string form of a label set, used as a merge key.
pub fn labels_key(labels: &LabelSet) -> String {
    let mut key = String::new();
    for (i, (name, value)) in labels.iter().enumerate() {
        if i > 0 {
            key.push(',');
        }
        let _ = write!(key, "{name}=\"{value}\"");
    }
    key
}

/// A float sample, `(timestamp, value)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Unix milliseconds.
    pub timestamp: i64,
    pub value: f64,
}

impl Serialize for Sample {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&(self.timestamp as f64 / 1000.0))?;
        tuple.serialize_element(&format_value(self.value))?;
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for Sample {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (seconds, value) = <(f64, String)>::deserialize(deserializer)?;
        Ok(Sample {
            timestamp: (seconds * 1000.0).round() as i64,
            value: parse_value(&value).map_err(de::Error::custom)?,
        })
    }
}

/// A native histogram sample. The histogram body is carried opaquely; the
/// frontend only ever looks at timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramSample {
    /// Unix milliseconds.
    pub timestamp: i64,
    pub histogram: serde_json::Value,
}

impl Serialize for HistogramSample {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&(self.timestamp as f64 / 1000.0))?;
        tuple.serialize_element(&self.histogram)?;
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for HistogramSample {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (seconds, histogram) = <(f64, serde_json::Value)>::deserialize(deserializer)?;
        Ok(HistogramSample {
            timestamp: (seconds * 1000.0).round() as i64,
            histogram,
        })
    }
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        value.to_string()
    }
}

fn parse_value(text: &str) -> Result<f64, String> {
    match text {
        "+Inf" | "Inf" => Ok(f64::INFINITY),
        "-Inf" => Ok(f64::NEG_INFINITY),
        _ => text
            .parse::<f64>()
            .map_err(|e| format!("invalid sample value {text:?}: {e}")),
    }
}

/// One stream of a matrix result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleStream {
    #[serde(default)]
    pub metric: LabelSet,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Sample>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub histograms: Vec<HistogramSample>,
}

/// One element of a vector result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VectorSample {
    #[serde(default)]
    pub metric: LabelSet,
    pub value: Sample,
}

impl Default for Sample {
    fn default() -> Self {
        Sample {
            timestamp: 0,
            value: 0.0,
        }
    }
}

/// `data.stats` of a query response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryStats {
    pub samples: SampleStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleStats {
    #[serde(rename = "totalQueryableSamples", default)]
    pub total_queryable_samples: i64,
    #[serde(rename = "peakSamples", default)]
    pub peak_samples: i64,
}

/// `data.analysis` of a query response: the engine's timing tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "executionTime", default)]
    pub execution_time: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Analysis>,
}

/// A header of the downstream HTTP response, preserved across merging but
/// never part of the JSON body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHeader {
    pub name: String,
    pub values: Vec<String>,
}

/// Response of `/api/v1/query_range`; the result is always a matrix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrometheusResponse {
    pub status: String,
    #[serde(default)]
    pub data: PrometheusData,
    #[serde(rename = "errorType", default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
    #[serde(skip)]
    pub headers: Vec<ResponseHeader>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrometheusData {
    #[serde(rename = "resultType")]
    pub result_type: String,
    #[serde(default)]
    pub result: Vec<SampleStream>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<QueryStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<Analysis>,
}

impl Default for PrometheusData {
    fn default() -> Self {
        PrometheusData {
            result_type: RESULT_TYPE_MATRIX.to_string(),
            result: Vec::new(),
            stats: None,
            analysis: None,
        }
    }
}

impl PrometheusResponse {
    /// An empty successful matrix response.
    pub fn empty() -> Self {
        PrometheusResponse {
            status: STATUS_SUCCESS.to_string(),
            ..Default::default()
        }
    }

    pub fn stats(&self) -> Option<QueryStats> {
        self.data.stats
    }
}

/// Response of `/api/v1/query`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstantResponse {
    pub status: String,
    #[serde(default)]
    pub data: InstantData,
    #[serde(rename = "errorType", default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
    #[serde(skip)]
    pub headers: Vec<ResponseHeader>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstantData {
    #[serde(flatten)]
    pub result: InstantResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<QueryStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<Analysis>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
pub enum InstantResult {
    Matrix(Vec<SampleStream>),
    Vector(Vec<VectorSample>),
    Scalar(Sample),
    String(StringSample),
}

impl Default for InstantResult {
    fn default() -> Self {
        InstantResult::Vector(Vec::new())
    }
}

/// A string result, `(timestamp, string)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StringSample {
    pub timestamp: i64,
    pub value: String,
}

impl Serialize for StringSample {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&(self.timestamp as f64 / 1000.0))?;
        tuple.serialize_element(&self.value)?;
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for StringSample {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (seconds, value) = <(f64, String)>::deserialize(deserializer)?;
        Ok(StringSample {
            timestamp: (seconds * 1000.0).round() as i64,
            value,
        })
    }
}

impl InstantResponse {
    /// An empty successful vector response.
    pub fn empty() -> Self {
        InstantResponse {
            status: STATUS_SUCCESS.to_string(),
            ..Default::default()
        }
    }

    pub fn stats(&self) -> Option<QueryStats> {
        self.data.stats
    }
}

/// Response of `/api/v1/labels` and `/api/v1/label/<name>/values`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelsResponse {
    pub status: String,
    #[serde(default)]
    pub data: Vec<String>,
    #[serde(rename = "errorType", default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
    #[serde(skip)]
    pub headers: Vec<ResponseHeader>,
}

impl LabelsResponse {
    pub fn empty() -> Self {
        LabelsResponse {
            status: STATUS_SUCCESS.to_string(),
            ..Default::default()
        }
    }
}

/// Response of `/api/v1/series`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeriesResponse {
    pub status: String,
    #[serde(default)]
    pub data: Vec<LabelSet>,
    #[serde(rename = "errorType", default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
    #[serde(skip)]
    pub headers: Vec<ResponseHeader>,
}

impl SeriesResponse {
    pub fn empty() -> Self {
        SeriesResponse {
            status: STATUS_SUCCESS.to_string(),
            ..Default::default()
        }
    }
}
