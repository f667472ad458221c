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

use async_trait::async_trait;

use crate::codec::Merger;
use crate::context::RequestContext;
use crate::error::Result;
use crate::executor::do_requests;
use crate::handler::{Handler, HandlerRef, Middleware};
use crate::limits::{smallest_parallelism, LimitsRef};
use crate::metrics::METRIC_SHARDING_QUERIES_TOTAL;
use crate::querysharding::QueryAnalyzer;
use crate::request::{Shardable, ShardInfo};

/// Fans a shardable query out vertically: every sub-request carries a shard
/// index and the downstream evaluates only its fraction of the series.
pub struct ShardingMiddleware<R, S> {
    analyzer: QueryAnalyzer,
    num_shards: usize,
    limits: LimitsRef,
    merger: Arc<dyn Merger<R, S>>,
}

impl<R, S> ShardingMiddleware<R, S> {
    pub fn new(
        analyzer: QueryAnalyzer,
        num_shards: usize,
        limits: LimitsRef,
        merger: Arc<dyn Merger<R, S>>,
    ) -> Self {
        // Pre-register both label values so the series exist from the start.
        METRIC_SHARDING_QUERIES_TOTAL.with_label_values(&["true"]);
        METRIC_SHARDING_QUERIES_TOTAL.with_label_values(&["false"]);
        Self {
            analyzer,
            num_shards,
            limits,
            merger,
        }
    }
}

impl<R, S> Middleware<R, S> for ShardingMiddleware<R, S>
where
    R: Shardable,
    S: Send + 'static,
{
    fn wrap(&self, next: HandlerRef<R, S>) -> HandlerRef<R, S> {
        Arc::new(Sharding {
            analyzer: self.analyzer,
            num_shards: self.num_shards,
            limits: self.limits.clone(),
            merger: self.merger.clone(),
            next,
        })
    }
}

struct Sharding<R, S> {
    analyzer: QueryAnalyzer,
    num_shards: usize,
    limits: LimitsRef,
    merger: Arc<dyn Merger<R, S>>,
    next: HandlerRef<R, S>,
}

#[async_trait]
impl<R, S> Handler<R, S> for Sharding<R, S>
where
    R: Shardable,
    S: Send + 'static,
{
    async fn handle(&self, ctx: &RequestContext, req: R) -> Result<S> {
        let analysis = match self.analyzer.analyze(req.query()) {
            Ok(analysis) if analysis.is_shardable() => analysis,
            // unparsable or unshardable queries pass through unchanged
            _ => {
                METRIC_SHARDING_QUERIES_TOTAL
                    .with_label_values(&["false"])
                    .inc();
                return self.next.handle(ctx, req).await;
            }
        };
        METRIC_SHARDING_QUERIES_TOTAL
            .with_label_values(&["true"])
            .inc();

        let reqs: Vec<R> = (0..self.num_shards)
            .map(|index| {
                req.with_shard_info(ShardInfo {
                    total_shards: self.num_shards as i64,
                    shard_index: index as i64,
                    by: analysis.shard_by(),
                    labels: analysis.sharding_labels().to_vec(),
                })
            })
            .collect();

        let parallelism = smallest_parallelism(ctx.tenant_ids(), |t| {
            self.limits.max_query_parallelism(t)
        });
        let results = do_requests(
            ctx,
            self.next.clone(),
            reqs,
            parallelism,
            req.partial_response(),
        )
        .await?;

        self.merger.merge(
            &req,
            results.into_iter().map(|r| r.response).collect(),
        )
    }
}
