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
use std::time::Instant;

use async_trait::async_trait;

use crate::context::RequestContext;
use crate::error::Result;
use crate::handler::{Handler, HandlerRef, Middleware};
use crate::metrics::METRIC_MIDDLEWARE_DURATION;

/// Observes the inclusive duration of the wrapped middleware stack, labeled
/// by middleware name and outcome.
pub struct InstrumentMiddleware<R, S> {
    name: &'static str,
    _types: PhantomData<fn(R) -> S>,
}

impl<R, S> InstrumentMiddleware<R, S> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            _types: PhantomData,
        }
    }
}

impl<R, S> Middleware<R, S> for InstrumentMiddleware<R, S>
where
    R: Send + Sync + 'static,
    S: Send + 'static,
{
    fn wrap(&self, next: HandlerRef<R, S>) -> HandlerRef<R, S> {
        Arc::new(Instrument {
            name: self.name,
            next,
        })
    }
}

struct Instrument<R, S> {
    name: &'static str,
    next: HandlerRef<R, S>,
}

#[async_trait]
impl<R, S> Handler<R, S> for Instrument<R, S>
where
    R: Send + Sync + 'static,
    S: Send + 'static,
{
    async fn handle(&self, ctx: &RequestContext, req: R) -> Result<S> {
        let start = Instant::now();
        let result = self.next.handle(ctx, req).await;
        let status = if result.is_ok() { "success" } else { "error" };
        METRIC_MIDDLEWARE_DURATION
            .with_label_values(&[self.name, status])
            .observe(start.elapsed().as_secs_f64());
        result
    }
}
