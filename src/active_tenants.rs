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

//! Keeping the per-tenant metric label space bounded: tenants that stop
//! querying have their labels evicted by a background sweep.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ActiveTenantOptions;
use crate::metrics::METRIC_QUERIES_TOTAL;
use crate::roundtrip::OPERATION_NAMES;

/// Remembers when each tenant was last seen.
#[derive(Debug, Default)]
pub struct ActiveTenantTracker {
    last_seen: Mutex<HashMap<String, Instant>>,
}

impl ActiveTenantTracker {
    pub fn update(&self, tenant: &str) {
        let mut last_seen = self.last_seen.lock().unwrap();
        last_seen.insert(tenant.to_string(), Instant::now());
    }

    /// Removes and returns tenants idle longer than `idle_timeout`.
    pub fn purge_idle(&self, idle_timeout: Duration) -> Vec<String> {
        let mut last_seen = self.last_seen.lock().unwrap();
        let now = Instant::now();
        let idle: Vec<String> = last_seen
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) > idle_timeout)
            .map(|(tenant, _)| tenant.clone())
            .collect();
        for tenant in &idle {
            last_seen.remove(tenant);
        }
        idle
    }
}

/// The background sweep evicting metric labels of idle tenants. Stoppable on
/// shutdown.
pub struct ActiveTenantCleaner {
    shutdown: CancellationToken,
}

impl ActiveTenantCleaner {
    pub fn start(tracker: Arc<ActiveTenantTracker>, opts: ActiveTenantOptions) -> Self {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let idle_timeout = opts.idle_timeout;

        tokio::spawn(async move {
            info!(
                idle_timeout_secs = idle_timeout.as_secs(),
                "starting idle tenant metric cleanup"
            );
            let mut interval = tokio::time::interval(opts.cleanup_interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("stopping idle tenant metric cleanup");
                        return;
                    }
                    _ = interval.tick() => {}
                }

                for tenant in tracker.purge_idle(idle_timeout) {
                    debug!(tenant, "evicting metric labels of idle tenant");
                    for op in OPERATION_NAMES {
                        let _ = METRIC_QUERIES_TOTAL.remove_label_values(&[op, &tenant]);
                    }
                }
            }
        });

        Self { shutdown }
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for ActiveTenantCleaner {
    fn drop(&mut self) {
        self.stop();
    }
}
