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
use tracing::error;

use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::handler::{Handler, HandlerRef, Middleware};
use crate::metrics::METRIC_RETRIES;

/// Retries requests that fail with a 5xx or a transport error. Cancellation
/// aborts immediately; retries are sequential.
pub struct RetryMiddleware<R, S> {
    max_retries: usize,
    _types: PhantomData<fn(R) -> S>,
}

impl<R, S> RetryMiddleware<R, S> {
    pub fn new(max_retries: usize) -> Self {
        Self {
            max_retries,
            _types: PhantomData,
        }
    }
}

impl<R, S> Middleware<R, S> for RetryMiddleware<R, S>
where
    R: Clone + Send + Sync + 'static,
    S: Send + 'static,
{
    fn wrap(&self, next: HandlerRef<R, S>) -> HandlerRef<R, S> {
        Arc::new(Retry {
            max_retries: self.max_retries,
            next,
        })
    }
}

struct Retry<R, S> {
    max_retries: usize,
    next: HandlerRef<R, S>,
}

#[async_trait]
impl<R, S> Handler<R, S> for Retry<R, S>
where
    R: Clone + Send + Sync + 'static,
    S: Send + 'static,
{
    async fn handle(&self, ctx: &RequestContext, req: R) -> Result<S> {
        let mut tries = 0usize;
        let result = self.run(ctx, req, &mut tries).await;
        METRIC_RETRIES.observe(tries as f64);
        result
    }
}

impl<R, S> Retry<R, S>
where
    R: Clone + Send + Sync + 'static,
    S: Send + 'static,
{
    async fn run(&self, ctx: &RequestContext, req: R, tries: &mut usize) -> Result<S> {
        let mut last_err = None;
        while *tries < self.max_retries {
            ctx.ensure_active()?;

            match self.next.handle(ctx, req.clone()).await {
                Ok(resp) => return Ok(resp),
                Err(Error::Canceled) => return Err(Error::Canceled),
                Err(err) if err.is_retriable() => {
                    error!(error = %err, tries, "error processing request");
                    last_err = Some(err);
                    *tries += 1;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or(Error::Canceled))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct FailTimes {
        failures: usize,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler<u64, u64> for FailTimes {
        async fn handle(&self, _ctx: &RequestContext, req: u64) -> Result<u64> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(Error::Downstream {
                    code: 500,
                    body: "try again".to_string(),
                })
            } else {
                Ok(req)
            }
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = RetryMiddleware::new(3).wrap(Arc::new(FailTimes {
            failures: 2,
            calls: calls.clone(),
        }) as HandlerRef<u64, u64>);
        let ctx = RequestContext::new(vec!["t".to_string()]);

        assert_eq!(chain.handle(&ctx, 7).await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_last_error() {
        let chain = RetryMiddleware::new(2).wrap(Arc::new(FailTimes {
            failures: 10,
            calls: Arc::new(AtomicUsize::new(0)),
        }) as HandlerRef<u64, u64>);
        let ctx = RequestContext::new(vec!["t".to_string()]);

        assert!(matches!(
            chain.handle(&ctx, 7).await,
            Err(Error::Downstream { code: 500, .. })
        ));
    }

    struct AlwaysBadRequest;

    #[async_trait]
    impl Handler<u64, u64> for AlwaysBadRequest {
        async fn handle(&self, _ctx: &RequestContext, _req: u64) -> Result<u64> {
            Err(Error::EndBeforeStart)
        }
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let chain =
            RetryMiddleware::new(5).wrap(Arc::new(AlwaysBadRequest) as HandlerRef<u64, u64>);
        let ctx = RequestContext::new(vec!["t".to_string()]);
        assert!(matches!(
            chain.handle(&ctx, 7).await,
            Err(Error::EndBeforeStart)
        ));
    }

    struct CountCanceled {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler<u64, u64> for CountCanceled {
        async fn handle(&self, _ctx: &RequestContext, _req: u64) -> Result<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Canceled)
        }
    }

    #[tokio::test]
    async fn test_cancellation_is_never_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = RetryMiddleware::new(5).wrap(Arc::new(CountCanceled {
            calls: calls.clone(),
        }) as HandlerRef<u64, u64>);
        let ctx = RequestContext::new(vec!["t".to_string()]);

        assert!(matches!(chain.handle(&ctx, 7).await, Err(Error::Canceled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_canceled_context_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = RetryMiddleware::new(5).wrap(Arc::new(FailTimes {
            failures: 0,
            calls: calls.clone(),
        }) as HandlerRef<u64, u64>);
        let ctx = RequestContext::new(vec!["t".to_string()]);
        ctx.cancellation().cancel();

        assert!(matches!(chain.handle(&ctx, 7).await, Err(Error::Canceled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
