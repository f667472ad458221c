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

//! Cache fingerprints: tenant + query shape + split bucket.
//!
//! The literal key formats are stable; changing them invalidates every
//! cached entry.

use crate::middleware::downsample::{RES_LEVEL_1, RES_LEVEL_2};
use crate::promql::format_matcher_sets;
use crate::request::{LabelsRequest, QueryRangeRequest, SeriesRequest, Splittable};

/// Resolutions the range key's resolution index counts through, coarsest
/// first.
const KEY_RESOLUTIONS: [i64; 3] = [RES_LEVEL_2, RES_LEVEL_1, 0];

/// Requests the results cache can fingerprint.
pub trait CacheableRequest: Splittable {
    /// The cache key of this request's split bucket. `None` when the request
    /// has not been split, since there is no bucket to key on.
    fn cache_key(&self, tenant: &str) -> Option<String>;

    /// Whether the response may be cached at all. Deduplication must be on
    /// and explicit store matchers force a bypass; `caching_options.disabled`
    /// is honored by the middleware itself.
    fn cacheable(&self) -> bool;
}

impl CacheableRequest for QueryRangeRequest {
    fn cache_key(&self, tenant: &str) -> Option<String> {
        let split_interval = self.split_interval?.as_millis() as i64;
        let bucket = self.start / split_interval;
        let resolution_index = KEY_RESOLUTIONS
            .iter()
            .position(|res| *res <= self.max_source_resolution)
            .unwrap_or(KEY_RESOLUTIONS.len());
        let shard_key = match &self.shard_info {
            Some(info) => format!("{}:{}", info.total_shards, info.shard_index),
            None => "-".to_string(),
        };
        Some(format!(
            "fe:{}:{}:{}:{}:{}:{}:{}:{}:{}",
            tenant,
            self.query,
            self.step,
            split_interval,
            bucket,
            resolution_index,
            shard_key,
            self.lookback_delta,
            self.engine,
        ))
    }

    fn cacheable(&self) -> bool {
        self.dedup && self.store_matchers.is_empty()
    }
}

impl CacheableRequest for LabelsRequest {
    fn cache_key(&self, tenant: &str) -> Option<String> {
        let split_interval = self.split_interval?.as_millis() as i64;
        let bucket = self.start / split_interval;
        Some(format!(
            "fe:{}:{}:{}:{}:{}",
            tenant,
            self.label,
            format_matcher_sets(&self.matchers).join(","),
            split_interval,
            bucket,
        ))
    }

    fn cacheable(&self) -> bool {
        self.store_matchers.is_empty()
    }
}

impl CacheableRequest for SeriesRequest {
    fn cache_key(&self, tenant: &str) -> Option<String> {
        let split_interval = self.split_interval?.as_millis() as i64;
        let bucket = self.start / split_interval;
        Some(format!(
            "fe:{}:{}:{}:{}",
            tenant,
            format_matcher_sets(&self.matchers).join(","),
            split_interval,
            bucket,
        ))
    }

    fn cacheable(&self) -> bool {
        self.dedup && self.store_matchers.is_empty()
    }
}
