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

use async_trait::async_trait;

use crate::context::RequestContext;
use crate::error::Result;
use crate::handler::{Handler, HandlerRef, Middleware};
use crate::request::TimeRanged;

/// Rounds the query window down to multiples of the step, maximizing cache
/// reuse across requests with sliding windows.
pub struct StepAlignMiddleware<R, S> {
    _types: PhantomData<fn(R) -> S>,
}

impl<R, S> StepAlignMiddleware<R, S> {
    pub fn new() -> Self {
        Self {
            _types: PhantomData,
        }
    }
}

impl<R, S> Default for StepAlignMiddleware<R, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, S> Middleware<R, S> for StepAlignMiddleware<R, S>
where
    R: TimeRanged,
    S: Send + 'static,
{
    fn wrap(&self, next: HandlerRef<R, S>) -> HandlerRef<R, S> {
        std::sync::Arc::new(StepAlign { next })
    }
}

struct StepAlign<R, S> {
    next: HandlerRef<R, S>,
}

#[async_trait]
impl<R, S> Handler<R, S> for StepAlign<R, S>
where
    R: TimeRanged,
    S: Send + 'static,
{
    async fn handle(&self, ctx: &RequestContext, req: R) -> Result<S> {
        let step = req.step().max(1);
        let start = (req.start() / step) * step;
        let end = (req.end() / step) * step;
        self.next.handle(ctx, req.with_start_end(start, end)).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::FutureExt;

    use super::*;
    use crate::handler::HandlerFn;
    use crate::request::QueryRangeRequest;

    fn capture_range() -> HandlerRef<QueryRangeRequest, (i64, i64)> {
        Arc::new(HandlerFn::new(|_ctx, req: QueryRangeRequest| {
            async move { Ok((req.start, req.end)) }.boxed()
        }))
    }

    #[tokio::test]
    async fn test_rounds_down_to_step() {
        let chain = StepAlignMiddleware::new().wrap(capture_range());
        let ctx = RequestContext::new(vec!["t".to_string()]);
        let req = QueryRangeRequest {
            start: 17,
            end: 93,
            step: 10,
            ..Default::default()
        };
        assert_eq!(chain.handle(&ctx, req).await.unwrap(), (10, 90));
    }

    #[tokio::test]
    async fn test_alignment_is_idempotent() {
        let chain = StepAlignMiddleware::new().wrap(capture_range());
        let ctx = RequestContext::new(vec!["t".to_string()]);
        let req = QueryRangeRequest {
            start: 17,
            end: 93,
            step: 10,
            ..Default::default()
        };
        let (start, end) = chain.handle(&ctx, req.clone()).await.unwrap();
        let aligned = QueryRangeRequest {
            start,
            end,
            ..req
        };
        assert_eq!(chain.handle(&ctx, aligned).await.unwrap(), (start, end));
    }
}
