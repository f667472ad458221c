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

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::RequestContext;
use crate::error::Result;
use crate::handler::{Handler, HandlerRef, Middleware};
use crate::request::{QueryInstantRequest, QueryRangeRequest, QueryRequest};
use crate::response::{InstantResponse, PrometheusResponse, QueryStats};

/// Requests that can ask the downstream for execution statistics.
pub trait StatsRequest: QueryRequest {
    #[must_use]
    fn force_stats(&self) -> Self;
}

impl StatsRequest for QueryRangeRequest {
    fn force_stats(&self) -> Self {
        self.with_stats("all")
    }
}

impl StatsRequest for QueryInstantRequest {
    fn force_stats(&self) -> Self {
        self.with_stats("all")
    }
}

/// Responses that may carry execution statistics.
pub trait StatsResponse: Send + 'static {
    fn query_stats(&self) -> Option<QueryStats>;
}

impl StatsResponse for PrometheusResponse {
    fn query_stats(&self) -> Option<QueryStats> {
        self.stats()
    }
}

impl StatsResponse for InstantResponse {
    fn query_stats(&self) -> Option<QueryStats> {
        self.stats()
    }
}

/// Optionally forces the downstream to compute stats, and folds returned
/// stats into the context's accumulator.
pub struct StatsMiddleware<R, S> {
    force_stats: bool,
    _types: PhantomData<fn(R) -> S>,
}

impl<R, S> StatsMiddleware<R, S> {
    pub fn new(force_stats: bool) -> Self {
        Self {
            force_stats,
            _types: PhantomData,
        }
    }
}

impl<R, S> Middleware<R, S> for StatsMiddleware<R, S>
where
    R: StatsRequest,
    S: StatsResponse,
{
    fn wrap(&self, next: HandlerRef<R, S>) -> HandlerRef<R, S> {
        Arc::new(Stats {
            force_stats: self.force_stats,
            next,
        })
    }
}

struct Stats<R, S> {
    force_stats: bool,
    next: HandlerRef<R, S>,
}

#[async_trait]
impl<R, S> Handler<R, S> for Stats<R, S>
where
    R: StatsRequest,
    S: StatsResponse,
{
    async fn handle(&self, ctx: &RequestContext, req: R) -> Result<S> {
        let req = if self.force_stats {
            req.force_stats()
        } else {
            req
        };

        let resp = self.next.handle(ctx, req).await?;

        if let (Some(stats), Some(accumulator)) = (resp.query_stats(), ctx.stats()) {
            accumulator.add_total_samples(stats.samples.total_queryable_samples);
            accumulator.update_peak_samples(stats.samples.peak_samples);
        }

        Ok(resp)
    }
}
