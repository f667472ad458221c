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

//! Bounded, order-preserving execution of fan-out sub-requests.

use futures::stream::{self, StreamExt};
use tracing::warn;

use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::handler::HandlerRef;

/// A sub-request paired with its response, in input order.
pub struct RequestResponse<R, S> {
    pub request: R,
    pub response: S,
}

/// Runs `requests` through `handler` with at most `parallelism` in flight.
///
/// Results come back in input order. The first error cancels the remaining
/// in-flight work and surfaces, unless `partial_response` is set, in which
/// case failing sub-requests are dropped and the rest proceed. Cancellation
/// of the request context aborts promptly.
pub async fn do_requests<R, S>(
    ctx: &RequestContext,
    handler: HandlerRef<R, S>,
    requests: Vec<R>,
    parallelism: usize,
    partial_response: bool,
) -> Result<Vec<RequestResponse<R, S>>>
where
    R: Clone + Send + 'static,
    S: Send + 'static,
{
    let parallelism = parallelism.max(1);
    let mut responses = stream::iter(requests)
        .map(|request| {
            let handler = handler.clone();
            let ctx = ctx.clone();
            async move {
                let result = handler.handle(&ctx, request.clone()).await;
                (request, result)
            }
        })
        .buffered(parallelism);

    let collect = async {
        let mut results = Vec::new();
        while let Some((request, result)) = responses.next().await {
            match result {
                Ok(response) => results.push(RequestResponse { request, response }),
                Err(Error::Canceled) => return Err(Error::Canceled),
                Err(err) if partial_response => {
                    warn!(error = %err, "dropping failed sub-request from partial response");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(results)
    };

    tokio::select! {
        _ = ctx.cancellation().cancelled() => Err(Error::Canceled),
        results = collect => results,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::handler::Handler;

    struct SleepyDouble {
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler<u64, u64> for SleepyDouble {
        async fn handle(&self, _ctx: &RequestContext, req: u64) -> Result<u64> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            // later requests finish earlier
            tokio::time::sleep(Duration::from_millis(20u64.saturating_sub(req))).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(req * 2)
        }
    }

    #[tokio::test]
    async fn test_results_keep_input_order() {
        let handler: HandlerRef<u64, u64> = Arc::new(SleepyDouble {
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        });
        let ctx = RequestContext::new(vec!["t".to_string()]);
        let results = do_requests(&ctx, handler, vec![1, 2, 3, 4, 5], 2, false)
            .await
            .unwrap();
        let outputs: Vec<_> = results.iter().map(|r| r.response).collect();
        assert_eq!(outputs, vec![2, 4, 6, 8, 10]);
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let handler: HandlerRef<u64, u64> = Arc::new(SleepyDouble {
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: max_in_flight.clone(),
        });
        let ctx = RequestContext::new(vec!["t".to_string()]);
        do_requests(&ctx, handler, (0..16).collect(), 3, false)
            .await
            .unwrap();
        assert!(max_in_flight.load(Ordering::SeqCst) <= 3);
    }

    struct FailAt {
        failing: u64,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler<u64, u64> for FailAt {
        async fn handle(&self, _ctx: &RequestContext, req: u64) -> Result<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if req == self.failing {
                Err(Error::Downstream {
                    code: 500,
                    body: "boom".to_string(),
                })
            } else {
                Ok(req)
            }
        }
    }

    #[tokio::test]
    async fn test_first_error_surfaces() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler: HandlerRef<u64, u64> = Arc::new(FailAt {
            failing: 0,
            calls: calls.clone(),
        });
        let ctx = RequestContext::new(vec!["t".to_string()]);
        let result = do_requests(&ctx, handler, (0..100).collect(), 2, false).await;
        assert!(matches!(result, Err(Error::Downstream { code: 500, .. })));
        // the stream was dropped before issuing everything
        assert!(calls.load(Ordering::SeqCst) < 100);
    }

    #[tokio::test]
    async fn test_partial_response_drops_failures() {
        let handler: HandlerRef<u64, u64> = Arc::new(FailAt {
            failing: 2,
            calls: Arc::new(AtomicUsize::new(0)),
        });
        let ctx = RequestContext::new(vec!["t".to_string()]);
        let results = do_requests(&ctx, handler, vec![1, 2, 3], 2, true)
            .await
            .unwrap();
        let outputs: Vec<_> = results.iter().map(|r| r.response).collect();
        assert_eq!(outputs, vec![1, 3]);
    }

    struct Hang;

    #[async_trait]
    impl Handler<u64, u64> for Hang {
        async fn handle(&self, _ctx: &RequestContext, _req: u64) -> Result<u64> {
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_cancellation_aborts_fan_out() {
        let handler: HandlerRef<u64, u64> = Arc::new(Hang);
        let ctx = RequestContext::new(vec!["t".to_string()]);
        let token = ctx.cancellation().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        let result = do_requests(&ctx, handler, vec![1, 2, 3], 2, false).await;
        assert!(matches!(result, Err(Error::Canceled)));
    }
}
