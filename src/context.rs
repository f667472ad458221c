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

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::response::SampleStats;

/// State shared by everything processing one incoming request: the resolved
/// tenants, the cancellation token the fan-out observes, and an optional
/// stats accumulator.
#[derive(Debug, Clone)]
pub struct RequestContext {
    tenant_ids: Arc<Vec<String>>,
    cancellation: CancellationToken,
    stats: Option<Arc<StatsAccumulator>>,
}

impl RequestContext {
    pub fn new(tenant_ids: Vec<String>) -> Self {
        Self {
            tenant_ids: Arc::new(tenant_ids),
            cancellation: CancellationToken::new(),
            stats: None,
        }
    }

    pub fn with_stats(mut self, stats: Arc<StatsAccumulator>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn tenant_ids(&self) -> &[String] {
        &self.tenant_ids
    }

    /// All tenants joined into one metric/cache label.
    pub fn tenant(&self) -> String {
        self.tenant_ids.join("|")
    }

    pub fn stats(&self) -> Option<&Arc<StatsAccumulator>> {
        self.stats.as_ref()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_canceled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Errors with [Error::Canceled] once the request is canceled.
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_canceled() {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }
}

/// Accumulates query statistics across sub-responses of one request.
#[derive(Debug, Default)]
pub struct StatsAccumulator {
    total_samples: AtomicI64,
    peak_samples: AtomicI64,
}

impl StatsAccumulator {
    pub fn add_total_samples(&self, samples: i64) {
        self.total_samples.fetch_add(samples, Ordering::Relaxed);
    }

    pub fn update_peak_samples(&self, samples: i64) {
        self.peak_samples.fetch_max(samples, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SampleStats {
        SampleStats {
            total_queryable_samples: self.total_samples.load(Ordering::Relaxed),
            peak_samples: self.peak_samples.load(Ordering::Relaxed),
        }
    }
}
