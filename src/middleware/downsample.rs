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
use crate::handler::{Handler, HandlerRef, Middleware};
use crate::metrics::METRIC_DOWNSAMPLED_EXTRA_QUERIES_TOTAL;
use crate::request::QueryRangeRequest;
use crate::response::PrometheusResponse;

/// 5 minutes, the first downsampled resolution.
pub const RES_LEVEL_1: i64 = 5 * 60 * 1_000;
/// 1 hour, the coarsest downsampled resolution.
pub const RES_LEVEL_2: i64 = 60 * 60 * 1_000;

const RESOLUTIONS: [i64; 2] = [RES_LEVEL_1, RES_LEVEL_2];

/// Retries a range query at progressively coarser resolutions while the
/// response does not reach back to the requested start. Engages only for
/// requests with `max_source_resolution=auto`.
pub struct DownsampleMiddleware {
    merger: Arc<dyn Merger<QueryRangeRequest, PrometheusResponse>>,
}

impl DownsampleMiddleware {
    pub fn new(merger: Arc<dyn Merger<QueryRangeRequest, PrometheusResponse>>) -> Self {
        Self { merger }
    }
}

impl Middleware<QueryRangeRequest, PrometheusResponse> for DownsampleMiddleware {
    fn wrap(
        &self,
        next: HandlerRef<QueryRangeRequest, PrometheusResponse>,
    ) -> HandlerRef<QueryRangeRequest, PrometheusResponse> {
        Arc::new(Downsample {
            merger: self.merger.clone(),
            next,
        })
    }
}

struct Downsample {
    merger: Arc<dyn Merger<QueryRangeRequest, PrometheusResponse>>,
    next: HandlerRef<QueryRangeRequest, PrometheusResponse>,
}

#[async_trait]
impl Handler<QueryRangeRequest, PrometheusResponse> for Downsample {
    async fn handle(
        &self,
        ctx: &RequestContext,
        req: QueryRangeRequest,
    ) -> Result<PrometheusResponse> {
        if !req.auto_downsampling {
            return self.next.handle(ctx, req).await;
        }

        let mut current = req.clone();
        let mut responses = Vec::new();
        let mut level = 0usize;

        loop {
            if !responses.is_empty() {
                METRIC_DOWNSAMPLED_EXTRA_QUERIES_TOTAL.inc();
            }

            let resp = self.next.handle(ctx, current.clone()).await?;
            let earliest = min_response_time(&resp);
            responses.push(resp);

            // Advance to the next resolution strictly coarser than the
            // current one.
            while level < RESOLUTIONS.len() {
                if current.max_source_resolution < RESOLUTIONS[level] {
                    current.auto_downsampling = false;
                    current.max_source_resolution = RESOLUTIONS[level];
                    break;
                }
                level += 1;
            }
            if level >= RESOLUTIONS.len() {
                break;
            }

            match earliest {
                // the response covers the whole requested range
                Some(ts) if ts == current.start => break,
                // no data at this resolution, try the next one as-is
                None => continue,
                // data begins after `start`: fetch the missing head at the
                // coarser resolution
                Some(ts) => {
                    current.end = ts - current.step;
                }
            }
            if current.start > current.end {
                break;
            }
        }

        self.merger.merge(&req, responses)
    }
}

/// The minimum timestamp across all returned series and histograms, `None`
/// when the response carries no data.
fn min_response_time(resp: &PrometheusResponse) -> Option<i64> {
    resp.data
        .result
        .iter()
        .flat_map(|stream| {
            let first_sample = stream.values.first().map(|s| s.timestamp);
            let first_histogram = stream.histograms.first().map(|h| h.timestamp);
            first_sample.into_iter().chain(first_histogram)
        })
        .min()
}
