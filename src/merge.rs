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

//! Reconstructing one correct response from many partial responses.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::Result;
use crate::promql::{self, SortPlan};
use crate::response::{
    labels_key, Analysis, InstantData, InstantResponse, InstantResult, LabelsResponse,
    PrometheusData, PrometheusResponse, QueryStats, Sample, SampleStream, SeriesResponse,
    VectorSample, RESULT_TYPE_MATRIX, STATUS_SUCCESS,
};

/// Merges range query responses. The result is always a matrix; streams with
/// equal label sets are stitched together with their overlap deduplicated.
pub fn merge_range_responses(responses: Vec<PrometheusResponse>) -> PrometheusResponse {
    if responses.is_empty() {
        return PrometheusResponse::empty();
    }

    let stats = merge_stats(responses.iter().map(|r| r.data.stats));
    let analysis = merge_analyses(responses.iter().filter_map(|r| r.data.analysis.clone()));
    let streams = merge_sample_streams(responses.into_iter().map(|r| r.data.result));

    PrometheusResponse {
        status: STATUS_SUCCESS.to_string(),
        data: PrometheusData {
            result_type: RESULT_TYPE_MATRIX.to_string(),
            result: streams,
            stats,
            analysis,
        },
        ..Default::default()
    }
}

/// Merges instant query responses. Only vector and matrix results are merged;
/// other result types are not shardable and never fan out.
pub fn merge_instant_responses(
    query: &str,
    mut responses: Vec<InstantResponse>,
) -> Result<InstantResponse> {
    if responses.is_empty() {
        return Ok(InstantResponse::empty());
    }
    if responses.len() == 1 {
        return Ok(responses.remove(0));
    }

    let stats = merge_stats(responses.iter().map(|r| r.data.stats));
    let analysis = merge_analyses(responses.iter().filter_map(|r| r.data.analysis.clone()));

    let result = if matches!(responses[0].data.result, InstantResult::Matrix(_)) {
        let streams = merge_sample_streams(responses.into_iter().map(|r| match r.data.result {
            InstantResult::Matrix(streams) => streams,
            _ => Vec::new(),
        }));
        InstantResult::Matrix(streams)
    } else {
        let vectors = responses.into_iter().filter_map(|r| match r.data.result {
            InstantResult::Vector(samples) => Some(samples),
            _ => None,
        });
        InstantResult::Vector(merge_vectors(query, vectors)?)
    };

    Ok(InstantResponse {
        status: STATUS_SUCCESS.to_string(),
        data: InstantData {
            result,
            stats,
            analysis,
        },
        ..Default::default()
    })
}

/// Union of all returned label strings, ascending.
pub fn merge_labels_responses(responses: Vec<LabelsResponse>) -> LabelsResponse {
    let mut set = BTreeSet::new();
    for response in responses {
        set.extend(response.data);
    }
    LabelsResponse {
        status: STATUS_SUCCESS.to_string(),
        data: set.into_iter().collect(),
        ..Default::default()
    }
}

/// Union of label sets, deduplicated by canonical form, sorted.
pub fn merge_series_responses(responses: Vec<SeriesResponse>) -> SeriesResponse {
    let mut unique = BTreeMap::new();
    for response in responses {
        for series in response.data {
            unique.entry(labels_key(&series)).or_insert(series);
        }
    }
    SeriesResponse {
        status: STATUS_SUCCESS.to_string(),
        data: unique.into_values().collect(),
        ..Default::default()
    }
}

/// Groups sample streams by label key and appends later streams onto earlier
/// ones. Streams come back in sorted label-key order.
pub fn merge_sample_streams(
    responses: impl IntoIterator<Item = Vec<SampleStream>>,
) -> Vec<SampleStream> {
    let mut output: BTreeMap<String, SampleStream> = BTreeMap::new();
    for streams in responses {
        for stream in streams {
            match output.entry(labels_key(&stream.metric)) {
                Entry::Vacant(entry) => {
                    entry.insert(stream);
                }
                Entry::Occupied(mut entry) => {
                    let existing = entry.get_mut();
                    append_deduplicated(&mut existing.values, stream.values, |s: &Sample| {
                        s.timestamp
                    });
                    append_deduplicated(&mut existing.histograms, stream.histograms, |h| {
                        h.timestamp
                    });
                }
            }
        }
    }
    output.into_values().collect()
}

/// Stitches `incoming` onto `existing` so each timestamp appears exactly
/// once. A stream lying entirely before the existing one is prepended (the
/// downsampling ladder collects the head of the range last); an overlapping
/// stream loses its leading entries at or before the existing tail.
fn append_deduplicated<T>(existing: &mut Vec<T>, mut incoming: Vec<T>, timestamp: impl Fn(&T) -> i64) {
    let (Some(first_existing), Some(last_existing)) = (existing.first(), existing.last()) else {
        *existing = incoming;
        return;
    };
    let (Some(first_incoming), Some(last_incoming)) = (incoming.first(), incoming.last()) else {
        return;
    };

    let existing_head = timestamp(first_existing);
    let existing_tail = timestamp(last_existing);
    if timestamp(last_incoming) <= existing_head {
        if timestamp(last_incoming) == existing_head {
            incoming.pop();
        }
        existing.splice(0..0, incoming);
        return;
    }

    if timestamp(first_incoming) <= existing_tail {
        let cut = incoming.partition_point(|entry| timestamp(entry) <= existing_tail);
        incoming.drain(..cut);
    }
    existing.append(&mut incoming);
}

/// Keeps at most one sample per label set, preferring the greater timestamp.
/// Ordering follows the query's sort plan; `topk`/`bottomk` keep the order
/// samples were first seen in.
fn merge_vectors(
    query: &str,
    responses: impl IntoIterator<Item = Vec<VectorSample>>,
) -> Result<Vec<VectorSample>> {
    let plan = promql::sort_plan_for_query(query)?;

    let mut output: HashMap<String, VectorSample> = HashMap::new();
    // Preserves discovery order for the merge-only plan.
    let mut order: Vec<String> = Vec::new();
    for samples in responses {
        for sample in samples {
            let key = labels_key(&sample.metric);
            match output.get_mut(&key) {
                None => {
                    output.insert(key.clone(), sample);
                    order.push(key);
                }
                Some(existing) => {
                    if existing.value.timestamp < sample.value.timestamp {
                        *existing = sample;
                    }
                }
            }
        }
    }

    match plan {
        SortPlan::MergeOnly => Ok(order
            .iter()
            .filter_map(|key| output.remove(key))
            .collect()),
        SortPlan::SortByLabels => {
            order.sort_unstable();
            Ok(order
                .iter()
                .filter_map(|key| output.remove(key))
                .collect())
        }
        SortPlan::SortByValuesAsc | SortPlan::SortByValuesDesc => {
            let mut samples: Vec<VectorSample> = output.into_values().collect();
            samples.sort_by(|a, b| {
                let ordering = a
                    .value
                    .value
                    .partial_cmp(&b.value.value)
                    .unwrap_or(std::cmp::Ordering::Equal);
                if plan == SortPlan::SortByValuesDesc {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
            Ok(samples)
        }
    }
}

/// Sums total queryable samples and takes the max of peak samples.
pub fn merge_stats(stats: impl IntoIterator<Item = Option<QueryStats>>) -> Option<QueryStats> {
    let mut merged: Option<QueryStats> = None;
    for entry in stats.into_iter().flatten() {
        let merged = merged.get_or_insert_with(QueryStats::default);
        merged.samples.total_queryable_samples += entry.samples.total_queryable_samples;
        merged.samples.peak_samples = merged.samples.peak_samples.max(entry.samples.peak_samples);
    }
    merged
}

/// Folds analysis trees together, summing execution times of same-named
/// nodes. Differing trees keep the first one seen.
pub fn merge_analyses(analyses: impl IntoIterator<Item = Analysis>) -> Option<Analysis> {
    analyses.into_iter().reduce(|a, b| merge_analysis(a, &b))
}

fn merge_analysis(mut a: Analysis, b: &Analysis) -> Analysis {
    if a.name != b.name {
        return a;
    }
    if let (Some(da), Some(db)) = (
        parse_duration_text(&a.execution_time),
        parse_duration_text(&b.execution_time),
    ) {
        a.execution_time = format_duration_text(da + db);
    }
    for (child_a, child_b) in a.children.iter_mut().zip(b.children.iter()) {
        *child_a = merge_analysis(child_a.clone(), child_b);
    }
    a
}

/// Parses Go-style duration strings ("1h2m3.5s", "250µs") into nanoseconds.
fn parse_duration_text(text: &str) -> Option<i64> {
    if text.is_empty() {
        return None;
    }
    let mut total = 0f64;
    let mut number = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let mut unit = String::from(c);
        while let Some(next) = chars.peek() {
            if next.is_ascii_digit() || *next == '.' {
                break;
            }
            unit.push(chars.next().unwrap());
        }
        let value: f64 = number.parse().ok()?;
        number.clear();
        let scale = match unit.as_str() {
            "h" => 3_600_000_000_000f64,
            "m" => 60_000_000_000f64,
            "s" => 1_000_000_000f64,
            "ms" => 1_000_000f64,
            "µs" | "us" => 1_000f64,
            "ns" => 1f64,
            _ => return None,
        };
        total += value * scale;
    }
    if !number.is_empty() {
        // trailing bare number: not a valid duration
        return None;
    }
    Some(total as i64)
}

fn format_duration_text(nanos: i64) -> String {
    let nanos = nanos as f64;
    if nanos >= 1_000_000_000.0 {
        format!("{}s", trim_float(nanos / 1_000_000_000.0))
    } else if nanos >= 1_000_000.0 {
        format!("{}ms", trim_float(nanos / 1_000_000.0))
    } else if nanos >= 1_000.0 {
        format!("{}µs", trim_float(nanos / 1_000.0))
    } else {
        format!("{}ns", nanos as i64)
    }
}

fn trim_float(value: f64) -> String {
    let text = format!("{value:.6}");
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}
