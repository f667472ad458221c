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

//! Per-tenant runtime limits on query handling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Runtime limits scoped to a single tenant. Implementations may load these
/// from static configuration or a runtime override source.
pub trait Limits: Send + Sync {
    /// How far back in time queries may reach. Zero disables the limit.
    fn max_query_lookback(&self, tenant: &str) -> Duration;

    /// Longest allowed `end - start` of a query. Zero disables the limit.
    fn max_query_length(&self, tenant: &str) -> Duration;

    /// Number of split/sharded sub-queries processed in parallel.
    fn max_query_parallelism(&self, tenant: &str) -> usize;

    /// Results younger than this are not written to the cache.
    fn max_cache_freshness(&self, tenant: &str) -> Duration;
}

pub type LimitsRef = Arc<dyn Limits>;

/// Limit values for one tenant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TenantLimits {
    #[serde(with = "humantime_serde")]
    pub max_query_lookback: Duration,
    #[serde(with = "humantime_serde")]
    pub max_query_length: Duration,
    pub max_query_parallelism: usize,
    #[serde(with = "humantime_serde")]
    pub max_cache_freshness: Duration,
}

impl Default for TenantLimits {
    fn default() -> Self {
        Self {
            max_query_lookback: Duration::ZERO,
            max_query_length: Duration::ZERO,
            max_query_parallelism: 14,
            max_cache_freshness: Duration::from_secs(60),
        }
    }
}

/// [Limits] backed by a default set of values plus per-tenant overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticOverrides {
    pub defaults: TenantLimits,
    pub tenants: HashMap<String, TenantLimits>,
}

impl StaticOverrides {
    pub fn new(defaults: TenantLimits) -> Self {
        Self {
            defaults,
            tenants: HashMap::new(),
        }
    }

    fn for_tenant(&self, tenant: &str) -> &TenantLimits {
        self.tenants.get(tenant).unwrap_or(&self.defaults)
    }
}

impl Limits for StaticOverrides {
    fn max_query_lookback(&self, tenant: &str) -> Duration {
        self.for_tenant(tenant).max_query_lookback
    }

    fn max_query_length(&self, tenant: &str) -> Duration {
        self.for_tenant(tenant).max_query_length
    }

    fn max_query_parallelism(&self, tenant: &str) -> usize {
        self.for_tenant(tenant).max_query_parallelism
    }

    fn max_cache_freshness(&self, tenant: &str) -> Duration {
        self.for_tenant(tenant).max_cache_freshness
    }
}

/// The smallest positive, non-zero value of `f` across the request's tenants.
/// `None` when every tenant leaves the limit disabled.
pub fn smallest_positive_duration<F>(tenants: &[String], f: F) -> Option<Duration>
where
    F: Fn(&str) -> Duration,
{
    tenants
        .iter()
        .map(|t| f(t))
        .filter(|d| !d.is_zero())
        .min()
}

/// The smallest parallelism across the request's tenants, at least 1.
pub fn smallest_parallelism<F>(tenants: &[String], f: F) -> usize
where
    F: Fn(&str) -> usize,
{
    tenants.iter().map(|t| f(t)).min().unwrap_or(1).max(1)
}
