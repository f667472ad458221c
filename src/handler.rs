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

//! The typed-request analog of an HTTP round-tripper: the internal plumbing
//! every pipeline is built from.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::context::RequestContext;
use crate::error::Result;

/// Handles one typed request, producing a typed response.
#[async_trait]
pub trait Handler<R, S>: Send + Sync
where
    R: Send + 'static,
    S: Send + 'static,
{
    async fn handle(&self, ctx: &RequestContext, req: R) -> Result<S>;
}

pub type HandlerRef<R, S> = Arc<dyn Handler<R, S>>;

/// Wraps a [Handler] into another. Chains are composed once at startup and
/// immutable afterwards.
pub trait Middleware<R, S>: Send + Sync
where
    R: Send + 'static,
    S: Send + 'static,
{
    fn wrap(&self, next: HandlerRef<R, S>) -> HandlerRef<R, S>;
}

pub type MiddlewareRef<R, S> = Arc<dyn Middleware<R, S>>;

/// Wraps `inner` in reverse order, so the first listed middleware sees the
/// request first.
pub fn compose<R, S>(
    middlewares: Vec<MiddlewareRef<R, S>>,
    inner: HandlerRef<R, S>,
) -> HandlerRef<R, S>
where
    R: Send + 'static,
    S: Send + 'static,
{
    let mut next = inner;
    for middleware in middlewares.into_iter().rev() {
        next = middleware.wrap(next);
    }
    next
}

/// A [Handler] from a plain function, mostly for tests and adapters.
pub struct HandlerFn<F> {
    f: F,
}

impl<F> HandlerFn<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<R, S, F> Handler<R, S> for HandlerFn<F>
where
    R: Send + 'static,
    S: Send + 'static,
    F: Fn(RequestContext, R) -> BoxFuture<'static, Result<S>> + Send + Sync,
{
    async fn handle(&self, ctx: &RequestContext, req: R) -> Result<S> {
        (self.f)(ctx.clone(), req).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::FutureExt;

    use super::*;

    /// Appends its tag on the way in, so the wrap order is observable.
    struct Tag {
        tag: &'static str,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler<String, String> for TagHandler {
        async fn handle(&self, ctx: &RequestContext, req: String) -> Result<String> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.next.handle(ctx, format!("{req}>{}", self.tag)).await
        }
    }

    struct TagHandler {
        tag: &'static str,
        calls: Arc<AtomicUsize>,
        next: HandlerRef<String, String>,
    }

    impl Middleware<String, String> for Tag {
        fn wrap(&self, next: HandlerRef<String, String>) -> HandlerRef<String, String> {
            Arc::new(TagHandler {
                tag: self.tag,
                calls: self.calls.clone(),
                next,
            })
        }
    }

    #[tokio::test]
    async fn test_compose_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let inner: HandlerRef<String, String> = Arc::new(HandlerFn::new(|_ctx, req: String| {
            async move { Ok(format!("{req}>inner")) }.boxed()
        }));
        let chain = compose(
            vec![
                Arc::new(Tag {
                    tag: "a",
                    calls: calls.clone(),
                }) as MiddlewareRef<String, String>,
                Arc::new(Tag {
                    tag: "b",
                    calls: calls.clone(),
                }),
            ],
            inner,
        );

        let ctx = RequestContext::new(vec!["t".to_string()]);
        let out = chain.handle(&ctx, "req".to_string()).await.unwrap();
        // first-listed middleware sees the request first
        assert_eq!(out, "req>a>b>inner");
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }
}
