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

//! Typed requests flowing through the middleware pipelines.
//!
//! Every mutation goes through a `with_*` builder returning a new value, so
//! middlewares can hold on to the original request while issuing altered
//! copies.

use std::time::Duration;

use promql_parser::label::Matcher;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::promql;

/// A header copied from the incoming HTTP request, forwarded downstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHeader {
    pub name: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CachingOptions {
    pub disabled: bool,
}

/// Which fraction of a query the downstream should evaluate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShardInfo {
    pub total_shards: i64,
    pub shard_index: i64,
    pub by: bool,
    pub labels: Vec<String>,
}

/// One parsed `match[]` / `storeMatch[]` selector.
pub type MatcherSet = Vec<Matcher>;

/// Capabilities shared by every request variant.
pub trait QueryRequest: Clone + Send + Sync + 'static {
    fn partial_response(&self) -> bool;
    fn caching_options(&self) -> CachingOptions;
    fn headers(&self) -> &[RequestHeader];
}

/// Requests with an explicit `[start, end]` window in unix milliseconds.
pub trait TimeRanged: QueryRequest {
    fn start(&self) -> i64;
    fn end(&self) -> i64;
    /// Query resolution step in milliseconds; 1 for stepless requests.
    fn step(&self) -> i64 {
        1
    }
    #[must_use]
    fn with_start_end(&self, start: i64, end: i64) -> Self;
}

/// Requests the split-by-interval middleware can divide into sub-requests.
pub trait Splittable: TimeRanged {
    fn split_interval(&self) -> Option<Duration>;
    #[must_use]
    fn with_split_interval(&self, interval: Duration) -> Self;
    /// Divide the request window into contiguous sub-requests no longer than
    /// `interval`. Implementations tag each sub-request with the interval.
    fn split(&self, interval: Duration) -> Result<Vec<Self>>;
}

/// Requests the sharding middleware can fan out vertically.
pub trait Shardable: QueryRequest {
    fn query(&self) -> &str;
    #[must_use]
    fn with_shard_info(&self, info: ShardInfo) -> Self;
}

/// `/api/v1/query_range`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRangeRequest {
    pub path: String,
    /// Unix millisecond timestamps; `end >= start` is enforced at decode.
    pub start: i64,
    pub end: i64,
    /// Resolution step in milliseconds, positive.
    pub step: i64,
    pub query: String,
    pub timeout: Option<Duration>,
    /// Maximum acceptable source resolution in milliseconds. Zero asks for
    /// raw data.
    pub max_source_resolution: i64,
    /// Set by `max_source_resolution=auto`; engages the downsampling ladder.
    pub auto_downsampling: bool,
    pub partial_response: bool,
    pub dedup: bool,
    pub replica_labels: Vec<String>,
    pub store_matchers: Vec<MatcherSet>,
    pub shard_info: Option<ShardInfo>,
    /// Lookback delta in milliseconds, zero when unset.
    pub lookback_delta: i64,
    pub engine: String,
    pub stats: String,
    pub split_interval: Option<Duration>,
    pub caching_options: CachingOptions,
    pub headers: Vec<RequestHeader>,
}

impl QueryRangeRequest {
    #[must_use]
    pub fn with_query(&self, query: String) -> Self {
        Self {
            query,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_stats(&self, stats: &str) -> Self {
        Self {
            stats: stats.to_string(),
            ..self.clone()
        }
    }
}

impl QueryRequest for QueryRangeRequest {
    fn partial_response(&self) -> bool {
        self.partial_response
    }

    fn caching_options(&self) -> CachingOptions {
        self.caching_options
    }

    fn headers(&self) -> &[RequestHeader] {
        &self.headers
    }
}

impl TimeRanged for QueryRangeRequest {
    fn start(&self) -> i64 {
        self.start
    }

    fn end(&self) -> i64 {
        self.end
    }

    fn step(&self) -> i64 {
        self.step
    }

    fn with_start_end(&self, start: i64, end: i64) -> Self {
        Self {
            start,
            end,
            ..self.clone()
        }
    }
}

impl Splittable for QueryRangeRequest {
    fn split_interval(&self) -> Option<Duration> {
        self.split_interval
    }

    fn with_split_interval(&self, interval: Duration) -> Self {
        Self {
            split_interval: Some(interval),
            ..self.clone()
        }
    }

    fn split(&self, interval: Duration) -> Result<Vec<Self>> {
        // Replace @ modifiers with constants equal to the original window
        // before the window changes, so subqueries across splits see the same
        // evaluation times.
        let query = promql::rewrite_at_modifiers(&self.query, self.start, self.end)?;
        let tagged = self.with_split_interval(interval).with_query(query);

        if self.start == self.end {
            return Ok(vec![tagged.with_start_end(self.start, self.start)]);
        }

        let mut reqs = Vec::new();
        let mut start = self.start;
        while start < self.end {
            let mut end = next_interval_boundary(start, self.step, interval);
            if end + self.step >= self.end {
                end = self.end;
            }
            reqs.push(tagged.with_start_end(start, end));
            start = end + self.step;
        }
        Ok(reqs)
    }
}

impl Shardable for QueryRangeRequest {
    fn query(&self) -> &str {
        &self.query
    }

    fn with_shard_info(&self, info: ShardInfo) -> Self {
        Self {
            shard_info: Some(info),
            ..self.clone()
        }
    }
}

/// The last step-aligned timestamp strictly before the next interval
/// boundary after `t`.
fn next_interval_boundary(t: i64, step: i64, interval: Duration) -> i64 {
    let ms_per_interval = interval.as_millis() as i64;
    let start_of_next_interval = (t / ms_per_interval + 1) * ms_per_interval;
    // ensure that target is a multiple of steps away from the start time
    let mut target = start_of_next_interval - ((start_of_next_interval - t) % step);
    if target == start_of_next_interval {
        target -= step;
    }
    target
}

/// `/api/v1/query`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryInstantRequest {
    pub path: String,
    /// Evaluation time in unix milliseconds; zero leaves the choice of "now"
    /// to the downstream.
    pub time: i64,
    pub query: String,
    pub timeout: Option<Duration>,
    pub max_source_resolution: i64,
    pub auto_downsampling: bool,
    pub partial_response: bool,
    pub dedup: bool,
    pub analyze: bool,
    pub replica_labels: Vec<String>,
    pub store_matchers: Vec<MatcherSet>,
    pub shard_info: Option<ShardInfo>,
    pub lookback_delta: i64,
    pub engine: String,
    pub stats: String,
    pub caching_options: CachingOptions,
    pub headers: Vec<RequestHeader>,
}

impl QueryInstantRequest {
    #[must_use]
    pub fn with_stats(&self, stats: &str) -> Self {
        Self {
            stats: stats.to_string(),
            ..self.clone()
        }
    }
}

impl QueryRequest for QueryInstantRequest {
    fn partial_response(&self) -> bool {
        self.partial_response
    }

    fn caching_options(&self) -> CachingOptions {
        self.caching_options
    }

    fn headers(&self) -> &[RequestHeader] {
        &self.headers
    }
}

impl TimeRanged for QueryInstantRequest {
    fn start(&self) -> i64 {
        self.time
    }

    fn end(&self) -> i64 {
        self.time
    }

    fn with_start_end(&self, start: i64, _end: i64) -> Self {
        Self {
            time: start,
            ..self.clone()
        }
    }
}

impl Shardable for QueryInstantRequest {
    fn query(&self) -> &str {
        &self.query
    }

    fn with_shard_info(&self, info: ShardInfo) -> Self {
        Self {
            shard_info: Some(info),
            ..self.clone()
        }
    }
}

/// `/api/v1/labels` and `/api/v1/label/<name>/values`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelsRequest {
    pub path: String,
    pub start: i64,
    pub end: i64,
    /// Set for the label values endpoint; the label whose values are listed.
    pub label: String,
    pub matchers: Vec<MatcherSet>,
    pub store_matchers: Vec<MatcherSet>,
    pub partial_response: bool,
    pub split_interval: Option<Duration>,
    pub caching_options: CachingOptions,
    pub headers: Vec<RequestHeader>,
}

impl QueryRequest for LabelsRequest {
    fn partial_response(&self) -> bool {
        self.partial_response
    }

    fn caching_options(&self) -> CachingOptions {
        self.caching_options
    }

    fn headers(&self) -> &[RequestHeader] {
        &self.headers
    }
}

impl TimeRanged for LabelsRequest {
    fn start(&self) -> i64 {
        self.start
    }

    fn end(&self) -> i64 {
        self.end
    }

    fn with_start_end(&self, start: i64, end: i64) -> Self {
        Self {
            start,
            end,
            ..self.clone()
        }
    }
}

impl Splittable for LabelsRequest {
    fn split_interval(&self) -> Option<Duration> {
        self.split_interval
    }

    fn with_split_interval(&self, interval: Duration) -> Self {
        Self {
            split_interval: Some(interval),
            ..self.clone()
        }
    }

    fn split(&self, interval: Duration) -> Result<Vec<Self>> {
        Ok(split_fixed_width(self, interval))
    }
}

/// `/api/v1/series`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesRequest {
    pub path: String,
    pub start: i64,
    pub end: i64,
    pub matchers: Vec<MatcherSet>,
    pub store_matchers: Vec<MatcherSet>,
    pub dedup: bool,
    pub replica_labels: Vec<String>,
    pub partial_response: bool,
    pub split_interval: Option<Duration>,
    pub caching_options: CachingOptions,
    pub headers: Vec<RequestHeader>,
}

impl QueryRequest for SeriesRequest {
    fn partial_response(&self) -> bool {
        self.partial_response
    }

    fn caching_options(&self) -> CachingOptions {
        self.caching_options
    }

    fn headers(&self) -> &[RequestHeader] {
        &self.headers
    }
}

impl TimeRanged for SeriesRequest {
    fn start(&self) -> i64 {
        self.start
    }

    fn end(&self) -> i64 {
        self.end
    }

    fn with_start_end(&self, start: i64, end: i64) -> Self {
        Self {
            start,
            end,
            ..self.clone()
        }
    }
}

impl Splittable for SeriesRequest {
    fn split_interval(&self) -> Option<Duration> {
        self.split_interval
    }

    fn with_split_interval(&self, interval: Duration) -> Self {
        Self {
            split_interval: Some(interval),
            ..self.clone()
        }
    }

    fn split(&self, interval: Duration) -> Result<Vec<Self>> {
        Ok(split_fixed_width(self, interval))
    }
}

/// Fixed-width slices of `interval`, the last trimmed to `end`. Used by the
/// metadata requests, which have no step to anchor to.
fn split_fixed_width<R: Splittable>(req: &R, interval: Duration) -> Vec<R> {
    let tagged = req.with_split_interval(interval);
    if req.start() == req.end() {
        return vec![tagged.with_start_end(req.start(), req.start())];
    }

    let dur = interval.as_millis() as i64;
    let mut reqs = Vec::new();
    let mut start = req.start();
    while start < req.end() {
        let end = (start + dur).min(req.end());
        reqs.push(tagged.with_start_end(start, end));
        start += dur;
    }
    reqs
}
