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

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    Histogram, HistogramVec, IntCounter, IntCounterVec,
};

pub(crate) const METRIC_OP_LABEL: &str = "op";
pub(crate) const METRIC_TENANT_LABEL: &str = "tenant";
pub(crate) const METRIC_MIDDLEWARE_LABEL: &str = "middleware";
pub(crate) const METRIC_STATUS_LABEL: &str = "status";
pub(crate) const METRIC_SHARDABLE_LABEL: &str = "shardable";

lazy_static! {
    pub static ref METRIC_QUERIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "query_frontend_queries_total",
        "Total queries passing through the query frontend",
        &[METRIC_OP_LABEL, METRIC_TENANT_LABEL]
    )
    .unwrap();
    pub static ref METRIC_SPLIT_QUERIES_TOTAL: IntCounter = register_int_counter!(
        "query_frontend_split_queries_total",
        "Total number of underlying query requests after the split by interval is applied"
    )
    .unwrap();
    pub static ref METRIC_DOWNSAMPLED_EXTRA_QUERIES_TOTAL: IntCounter = register_int_counter!(
        "query_frontend_downsampled_extra_queries_total",
        "Total number of additional queries for downsampled data"
    )
    .unwrap();
    pub static ref METRIC_SHARDING_QUERIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "query_frontend_sharding_queries_total",
        "Total number of queries analyzed by the sharding middleware",
        &[METRIC_SHARDABLE_LABEL]
    )
    .unwrap();
    pub static ref METRIC_RETRIES: Histogram = register_histogram!(
        "query_frontend_retries",
        "Number of times a request is retried",
        vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]
    )
    .unwrap();
    pub static ref METRIC_MIDDLEWARE_DURATION: HistogramVec = register_histogram_vec!(
        "query_frontend_middleware_duration_seconds",
        "Time spent in each query frontend middleware",
        &[METRIC_MIDDLEWARE_LABEL, METRIC_STATUS_LABEL]
    )
    .unwrap();
    pub static ref METRIC_CACHE_EXTENTS_FETCHED_TOTAL: IntCounter = register_int_counter!(
        "query_frontend_cache_extents_fetched_total",
        "Total number of cached extents reused by the results cache"
    )
    .unwrap();
    pub static ref METRIC_CACHE_EXTENTS_STORED_TOTAL: IntCounter = register_int_counter!(
        "query_frontend_cache_extents_stored_total",
        "Total number of extents written back by the results cache"
    )
    .unwrap();
}
