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

//! Configurations.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tenancy::{DEFAULT_TENANT, DEFAULT_TENANT_HEADER};

/// Configuration for the whole query frontend.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueryFrontendOptions {
    pub query_range: QueryRangeOptions,
    pub labels: LabelsOptions,
    pub downstream: DownstreamOptions,
    pub tenancy: TenancyOptions,
    /// Request headers forwarded to the downstream querier verbatim.
    pub forward_headers: Vec<String>,
    /// Always ask the downstream for query statistics.
    pub force_query_stats: bool,
    pub active_tenants: ActiveTenantOptions,
}

/// Configuration of the range query pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueryRangeOptions {
    /// Round query boundaries down to multiples of the step (default true).
    pub align_range_with_step: bool,
    /// Retry queries at coarser resolutions when fine data is missing
    /// (default true). Only applies to requests with
    /// `max_source_resolution=auto`.
    pub request_downsampled: bool,
    /// Static interval to split range queries by. Zero disables static
    /// splitting; `min_split_interval` may still enable dynamic splitting.
    #[serde(with = "humantime_serde")]
    pub split_queries_by_interval: Duration,
    /// Lower bound for the dynamically derived split interval (default 0,
    /// disabled).
    #[serde(with = "humantime_serde")]
    pub min_split_interval: Duration,
    /// Upper bound for the dynamically derived split interval (default 1d).
    #[serde(with = "humantime_serde")]
    pub max_split_interval: Duration,
    /// Number of slices a short query is split into when the dynamic interval
    /// is in effect (default 4).
    pub horizontal_shards: i64,
    /// Number of vertical shards per shardable query. Zero disables sharding.
    pub num_shards: usize,
    /// Default for the `partial_response` request parameter (default true).
    pub partial_response: bool,
    /// Maximum retries for a failing sub-request (default 5, zero disables
    /// the retry middleware).
    pub max_retries: usize,
    pub results_cache: ResultsCacheOptions,
}

impl Default for QueryRangeOptions {
    fn default() -> Self {
        Self {
            align_range_with_step: true,
            request_downsampled: true,
            split_queries_by_interval: Duration::from_secs(24 * 60 * 60),
            min_split_interval: Duration::ZERO,
            max_split_interval: Duration::from_secs(24 * 60 * 60),
            horizontal_shards: 4,
            num_shards: 0,
            partial_response: true,
            max_retries: 5,
            results_cache: ResultsCacheOptions::default(),
        }
    }
}

/// Configuration of the metadata (labels, label values, series) pipelines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LabelsOptions {
    /// Interval to split metadata requests by. Zero disables splitting.
    #[serde(with = "humantime_serde")]
    pub split_queries_by_interval: Duration,
    /// Time range assumed when a metadata request carries no `start`/`end`
    /// (default 24h). Zero means an unbounded range.
    #[serde(with = "humantime_serde")]
    pub default_time_range: Duration,
    /// Default for the `partial_response` request parameter (default true).
    pub partial_response: bool,
    /// Maximum retries for a failing sub-request (default 5).
    pub max_retries: usize,
    pub results_cache: ResultsCacheOptions,
}

impl Default for LabelsOptions {
    fn default() -> Self {
        Self {
            split_queries_by_interval: Duration::from_secs(24 * 60 * 60),
            default_time_range: Duration::from_secs(24 * 60 * 60),
            partial_response: true,
            max_retries: 5,
            results_cache: ResultsCacheOptions::default(),
        }
    }
}

/// Results cache settings shared by the range and metadata pipelines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResultsCacheOptions {
    pub enable: bool,
    /// Time-to-live of cached extents (default 24h).
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for ResultsCacheOptions {
    fn default() -> Self {
        Self {
            enable: false,
            ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Where sub-requests are sent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DownstreamOptions {
    /// Base URL of the downstream querier.
    pub url: String,
    /// Request timeout towards the downstream querier (default 1m).
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for DownstreamOptions {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:9090".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Tenant resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TenancyOptions {
    /// Header carrying the tenant on incoming requests. The canonical header
    /// is always used towards the downstream.
    pub tenant_header: String,
    /// Tenant assumed when no header (or certificate field) yields one.
    pub default_tenant_id: String,
    /// Client certificate field to read the tenant from instead of headers:
    /// `organization`, `organizationalUnit` or `commonName`. Empty disables
    /// certificate-based tenancy.
    pub tenant_cert_field: String,
}

impl Default for TenancyOptions {
    fn default() -> Self {
        Self {
            tenant_header: DEFAULT_TENANT_HEADER.to_string(),
            default_tenant_id: DEFAULT_TENANT.to_string(),
            tenant_cert_field: String::new(),
        }
    }
}

/// Cleanup of per-tenant metric labels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ActiveTenantOptions {
    /// A tenant with no queries for this long has its metric labels removed
    /// (default 20m).
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// How often idle tenants are swept (default 2m).
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for ActiveTenantOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(20 * 60),
            cleanup_interval: Duration::from_secs(2 * 60),
        }
    }
}
