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

use crate::codec::Merger;
use crate::config::QueryRangeOptions;
use crate::context::RequestContext;
use crate::error::Result;
use crate::executor::do_requests;
use crate::handler::{Handler, HandlerRef, Middleware};
use crate::limits::{smallest_parallelism, LimitsRef};
use crate::metrics::METRIC_SPLIT_QUERIES_TOTAL;
use crate::request::{QueryRangeRequest, Splittable};

/// Picks the split interval for a request.
pub type IntervalFn<R> = Arc<dyn Fn(&R) -> Duration + Send + Sync>;

/// A constant split interval.
pub fn static_interval_fn<R>(interval: Duration) -> IntervalFn<R> {
    Arc::new(move |_| interval)
}

/// Derives the split interval from the request duration when no static
/// interval is configured: long queries split by the max interval, short
/// ones into a fixed number of slices.
pub fn dynamic_interval_fn(opts: &QueryRangeOptions) -> IntervalFn<QueryRangeRequest> {
    let opts = opts.clone();
    Arc::new(move |req: &QueryRangeRequest| {
        if !opts.split_queries_by_interval.is_zero() {
            return opts.split_queries_by_interval;
        }

        let query_interval = Duration::from_millis((req.end - req.start).max(0) as u64);
        if !opts.max_split_interval.is_zero()
            && query_interval.as_millis() / opts.max_split_interval.as_millis() >= 2
        {
            return opts.max_split_interval;
        }

        if query_interval > opts.min_split_interval {
            let shards = opts.horizontal_shards.max(1) as u64;
            return Duration::from_millis(query_interval.as_millis() as u64 / shards);
        }

        opts.min_split_interval
    })
}

/// Splits the time range into contiguous sub-requests no longer than the
/// interval, executes them in parallel and merges the sub-responses.
pub struct SplitByIntervalMiddleware<R, S> {
    interval: IntervalFn<R>,
    limits: LimitsRef,
    merger: Arc<dyn Merger<R, S>>,
}

impl<R, S> SplitByIntervalMiddleware<R, S> {
    pub fn new(interval: IntervalFn<R>, limits: LimitsRef, merger: Arc<dyn Merger<R, S>>) -> Self {
        Self {
            interval,
            limits,
            merger,
        }
    }
}

impl<R, S> Middleware<R, S> for SplitByIntervalMiddleware<R, S>
where
    R: Splittable,
    S: Send + 'static,
{
    fn wrap(&self, next: HandlerRef<R, S>) -> HandlerRef<R, S> {
        Arc::new(SplitByInterval {
            interval: self.interval.clone(),
            limits: self.limits.clone(),
            merger: self.merger.clone(),
            next,
        })
    }
}

struct SplitByInterval<R, S> {
    interval: IntervalFn<R>,
    limits: LimitsRef,
    merger: Arc<dyn Merger<R, S>>,
    next: HandlerRef<R, S>,
}

#[async_trait]
impl<R, S> Handler<R, S> for SplitByInterval<R, S>
where
    R: Splittable,
    S: Send + 'static,
{
    async fn handle(&self, ctx: &RequestContext, req: R) -> Result<S> {
        let interval = (self.interval)(&req);
        if interval.is_zero() {
            return self.next.handle(ctx, req).await;
        }

        let reqs = req.split(interval)?;
        METRIC_SPLIT_QUERIES_TOTAL.inc_by(reqs.len() as u64);

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
