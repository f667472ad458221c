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

use async_trait::async_trait;
use tracing::debug;

use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::handler::{Handler, HandlerRef, Middleware};
use crate::limits::{smallest_positive_duration, LimitsRef};
use crate::request::{QueryRangeRequest, TimeRanged};
use crate::response::PrometheusResponse;
use crate::util::current_millis;

/// Enforces the tenant's lookback and query-length limits on range queries.
pub struct LimitsMiddleware {
    limits: LimitsRef,
}

impl LimitsMiddleware {
    pub fn new(limits: LimitsRef) -> Self {
        Self { limits }
    }
}

impl Middleware<QueryRangeRequest, PrometheusResponse> for LimitsMiddleware {
    fn wrap(
        &self,
        next: HandlerRef<QueryRangeRequest, PrometheusResponse>,
    ) -> HandlerRef<QueryRangeRequest, PrometheusResponse> {
        std::sync::Arc::new(LimitsHandler {
            limits: self.limits.clone(),
            next,
        })
    }
}

struct LimitsHandler {
    limits: LimitsRef,
    next: HandlerRef<QueryRangeRequest, PrometheusResponse>,
}

#[async_trait]
impl Handler<QueryRangeRequest, PrometheusResponse> for LimitsHandler {
    async fn handle(
        &self,
        ctx: &RequestContext,
        req: QueryRangeRequest,
    ) -> Result<PrometheusResponse> {
        let mut req = req;
        let now = current_millis();

        if let Some(lookback) =
            smallest_positive_duration(ctx.tenant_ids(), |t| self.limits.max_query_lookback(t))
        {
            let min_start = now - lookback.as_millis() as i64;

            if req.end() < min_start {
                // The request is fully outside the allowed range.
                debug!(
                    start = req.start(),
                    end = req.end(),
                    min_start,
                    "skipping query older than the max query lookback"
                );
                return Ok(PrometheusResponse::empty());
            }

            if req.start() < min_start {
                debug!(
                    original = req.start(),
                    updated = min_start,
                    "clamping query start to the max query lookback"
                );
                req = req.with_start_end(min_start, req.end());
            }
        }

        if let Some(max_length) =
            smallest_positive_duration(ctx.tenant_ids(), |t| self.limits.max_query_length(t))
        {
            let length = req.end() - req.start();
            if length > max_length.as_millis() as i64 {
                return Err(Error::QueryTooLong {
                    actual: length,
                    limit: max_length.as_millis() as i64,
                });
            }
        }

        self.next.handle(ctx, req).await
    }
}
