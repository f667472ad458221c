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

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::{CacheableRequest, ResponseCacheRef};
use crate::codec::Merger;
use crate::context::RequestContext;
use crate::error::Result;
use crate::executor::do_requests;
use crate::handler::{Handler, HandlerRef, Middleware};
use crate::limits::{smallest_parallelism, smallest_positive_duration, LimitsRef};
use crate::metrics::{METRIC_CACHE_EXTENTS_FETCHED_TOTAL, METRIC_CACHE_EXTENTS_STORED_TOTAL};
use crate::request::{QueryRequest, TimeRanged};
use crate::util::current_millis;

/// One cached response fragment and the window it covers.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Extent<S> {
    start: i64,
    end: i64,
    response: S,
}

/// Serves request fragments out of the shared cache and issues only the
/// still-missing extents downstream. Runs below the splitter, so one cache
/// entry covers one split bucket.
pub struct ResultsCacheMiddleware<R, S> {
    cache: ResponseCacheRef,
    limits: LimitsRef,
    merger: Arc<dyn Merger<R, S>>,
    ttl: Duration,
}

impl<R, S> ResultsCacheMiddleware<R, S> {
    pub fn new(
        cache: ResponseCacheRef,
        limits: LimitsRef,
        merger: Arc<dyn Merger<R, S>>,
        ttl: Duration,
    ) -> Self {
        Self {
            cache,
            limits,
            merger,
            ttl,
        }
    }
}

impl<R, S> Middleware<R, S> for ResultsCacheMiddleware<R, S>
where
    R: CacheableRequest,
    S: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn wrap(&self, next: HandlerRef<R, S>) -> HandlerRef<R, S> {
        Arc::new(ResultsCache {
            cache: self.cache.clone(),
            limits: self.limits.clone(),
            merger: self.merger.clone(),
            ttl: self.ttl,
            next,
        })
    }
}

struct ResultsCache<R, S> {
    cache: ResponseCacheRef,
    limits: LimitsRef,
    merger: Arc<dyn Merger<R, S>>,
    ttl: Duration,
    next: HandlerRef<R, S>,
}

#[async_trait]
impl<R, S> Handler<R, S> for ResultsCache<R, S>
where
    R: CacheableRequest,
    S: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn handle(&self, ctx: &RequestContext, req: R) -> Result<S> {
        if req.caching_options().disabled || !req.cacheable() {
            return self.next.handle(ctx, req).await;
        }
        let Some(key) = req.cache_key(&ctx.tenant()) else {
            return self.next.handle(ctx, req).await;
        };

        let mut extents = self.lookup(&key).await;
        extents.retain(|e| e.end >= req.start() && e.start <= req.end());
        extents.sort_by_key(|e| e.start);
        if !extents.is_empty() {
            METRIC_CACHE_EXTENTS_FETCHED_TOTAL.inc_by(extents.len() as u64);
        }

        // Issue the still-missing parts of the window downstream.
        let gaps = missing_ranges(req.start(), req.end(), &extents);
        let gap_reqs: Vec<R> = gaps
            .iter()
            .map(|(start, end)| req.with_start_end(*start, *end))
            .collect();
        let parallelism = smallest_parallelism(ctx.tenant_ids(), |t| {
            self.limits.max_query_parallelism(t)
        });
        let fetched = do_requests(ctx, self.next.clone(), gap_reqs, parallelism, false).await?;

        let mut all: Vec<Extent<S>> = extents;
        for pair in fetched {
            all.push(Extent {
                start: pair.request.start(),
                end: pair.request.end(),
                response: pair.response,
            });
        }
        all.sort_by_key(|e| e.start);

        let merged = self.merger.merge(
            &req,
            all.iter().map(|e| e.response.clone()).collect(),
        )?;
        self.store(ctx, key, all).await;
        Ok(merged)
    }
}

impl<R, S> ResultsCache<R, S>
where
    R: CacheableRequest,
    S: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn lookup(&self, key: &str) -> Vec<Extent<S>> {
        let hits = self.cache.get(std::slice::from_ref(&key.to_string())).await;
        match hits.into_iter().next().flatten() {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(extents) => extents,
                Err(error) => {
                    // a corrupt entry is just a miss
                    warn!(%error, key, "discarding undecodable results-cache entry");
                    Vec::new()
                }
            },
            None => Vec::new(),
        }
    }

    /// Writes extents back, keeping only those old enough to be stable:
    /// results overlapping `[now - max_cache_freshness, now]` may still
    /// change and are not cached.
    async fn store(&self, ctx: &RequestContext, key: String, mut extents: Vec<Extent<S>>) {
        if let Some(freshness) = smallest_positive_duration(ctx.tenant_ids(), |t| {
            self.limits.max_cache_freshness(t)
        }) {
            let stable_before = current_millis() - freshness.as_millis() as i64;
            extents.retain(|e| e.end <= stable_before);
        }
        if extents.is_empty() {
            return;
        }

        match serde_json::to_vec(&extents) {
            Ok(encoded) => {
                METRIC_CACHE_EXTENTS_STORED_TOTAL.inc_by(extents.len() as u64);
                self.cache.put(key, Bytes::from(encoded), self.ttl).await;
            }
            Err(error) => warn!(%error, "failed to encode results-cache extents"),
        }
    }
}

/// The sub-ranges of `[start, end]` not covered by the sorted `extents`.
fn missing_ranges<S>(start: i64, end: i64, extents: &[Extent<S>]) -> Vec<(i64, i64)> {
    if extents.is_empty() {
        return vec![(start, end)];
    }

    let mut gaps = Vec::new();
    let mut cursor = start;
    for extent in extents {
        if extent.start > cursor {
            gaps.push((cursor, extent.start.min(end)));
        }
        cursor = cursor.max(extent.end);
        if cursor >= end {
            break;
        }
    }
    if cursor < end {
        gaps.push((cursor, end));
    }
    gaps
}
