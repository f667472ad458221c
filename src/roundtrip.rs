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

//! Request dispatch and pipeline assembly.
//!
//! The frontend is a composition of four typed pipelines selected by URL
//! path, wrapped by tenant normalization. Unknown paths pass through to the
//! downstream untouched.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;

use crate::active_tenants::{ActiveTenantCleaner, ActiveTenantTracker};
use crate::cache::{InMemoryResponseCache, ResponseCacheRef};
use crate::codec::{
    Codec, LabelsCodec, Merger, QueryInstantCodec, QueryRangeCodec, SeriesCodec,
};
use crate::config::{QueryFrontendOptions, ResultsCacheOptions};
use crate::context::{RequestContext, StatsAccumulator};
use crate::downstream::{RoundTripper, RoundTripperRef};
use crate::error::{Error, Result};
use crate::handler::{compose, Handler, HandlerRef, MiddlewareRef};
use crate::limits::LimitsRef;
use crate::metrics::METRIC_QUERIES_TOTAL;
use crate::middleware::split::{dynamic_interval_fn, static_interval_fn};
use crate::middleware::{
    DownsampleMiddleware, InstrumentMiddleware, LimitsMiddleware, ResultsCacheMiddleware,
    RetryMiddleware, ShardingMiddleware, SplitByIntervalMiddleware, StatsMiddleware,
    StepAlignMiddleware,
};
use crate::querysharding::QueryAnalyzer;
use crate::request::{LabelsRequest, QueryInstantRequest, QueryRangeRequest, SeriesRequest};
use crate::response::{InstantResponse, LabelsResponse, PrometheusResponse, SeriesResponse};
use crate::tenancy;

/// Operation labels used in metrics, in [Operation] order.
pub(crate) const OPERATION_NAMES: [&str; 5] = [
    "query",
    "query_range",
    "label_names",
    "label_values",
    "series",
];

/// The read operations the frontend understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    InstantQuery,
    RangeQuery,
    LabelNames,
    LabelValues,
    Series,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::InstantQuery => OPERATION_NAMES[0],
            Operation::RangeQuery => OPERATION_NAMES[1],
            Operation::LabelNames => OPERATION_NAMES[2],
            Operation::LabelValues => OPERATION_NAMES[3],
            Operation::Series => OPERATION_NAMES[4],
        }
    }
}

/// Routes by URL path suffix and method; everything else is unmatched.
pub fn get_operation<T>(req: &http::Request<T>) -> Option<Operation> {
    if req.method() != http::Method::GET && req.method() != http::Method::POST {
        return None;
    }
    let path = req.uri().path();
    if path.ends_with("/api/v1/query") {
        Some(Operation::InstantQuery)
    } else if path.ends_with("/api/v1/query_range") {
        Some(Operation::RangeQuery)
    } else if path.ends_with("/api/v1/labels") {
        Some(Operation::LabelNames)
    } else if path.ends_with("/api/v1/series") {
        Some(Operation::Series)
    } else if is_label_values_path(path) {
        Some(Operation::LabelValues)
    } else {
        None
    }
}

/// Matches `/api/v1/label/<name>/values` with a non-empty name.
fn is_label_values_path(path: &str) -> bool {
    let Some((_, rest)) = path.split_once("/api/v1/label/") else {
        return false;
    };
    match rest.strip_suffix("/values") {
        Some(label) => !label.is_empty(),
        None => false,
    }
}

/// The innermost handler of every pipeline: encodes the typed request,
/// forwards it downstream with the canonical tenant header, and decodes the
/// response.
struct DownstreamHandler<C: Codec> {
    codec: Arc<C>,
    next: RoundTripperRef,
}

#[async_trait]
impl<C: Codec> Handler<C::Req, C::Resp> for DownstreamHandler<C> {
    async fn handle(&self, ctx: &RequestContext, req: C::Req) -> Result<C::Resp> {
        let mut http_req = self.codec.encode_request(&req)?;

        let tenant =
            http::header::HeaderValue::try_from(ctx.tenant()).map_err(|_| Error::InvalidTenant {
                tenant: ctx.tenant(),
            })?;
        http_req.headers_mut().insert(
            http::header::HeaderName::from_static("thanos-tenant"),
            tenant,
        );

        let http_resp = self.next.round_trip(ctx, http_req).await?;
        self.codec.decode_response(&http_resp, &req)
    }
}

/// One typed pipeline: codec at both ends, the middleware chain in between.
struct Pipeline<C: Codec> {
    codec: Arc<C>,
    handler: HandlerRef<C::Req, C::Resp>,
    forward_headers: Vec<String>,
}

impl<C: Codec> Pipeline<C> {
    async fn execute(
        &self,
        ctx: &RequestContext,
        req: &http::Request<Bytes>,
    ) -> Result<http::Response<Bytes>> {
        let typed = self.codec.decode_request(req, &self.forward_headers)?;
        let resp = self.handler.handle(ctx, typed).await?;
        self.codec.encode_response(&resp)
    }
}

/// The query frontend core: accepts wire-level requests, fans them out
/// through the typed pipelines and encodes the merged result.
pub struct QueryFrontend {
    options: QueryFrontendOptions,
    range: Pipeline<QueryRangeCodec>,
    instant: Pipeline<QueryInstantCodec>,
    labels: Pipeline<LabelsCodec>,
    series: Pipeline<SeriesCodec>,
    downstream: RoundTripperRef,
    tracker: Arc<ActiveTenantTracker>,
    _cleaner: ActiveTenantCleaner,
}

impl QueryFrontend {
    /// Builds the pipelines once; the chains are immutable afterwards. When
    /// the results cache is enabled but no external cache is given, an
    /// in-process cache is used.
    pub fn try_new(
        options: QueryFrontendOptions,
        limits: LimitsRef,
        cache: Option<ResponseCacheRef>,
        downstream: RoundTripperRef,
    ) -> Result<Self> {
        // Pre-register every operation label so the series exist from the
        // first scrape.
        for op in OPERATION_NAMES {
            METRIC_QUERIES_TOTAL.with_label_values(&[op, tenancy::DEFAULT_TENANT]);
        }

        let cache_for = |cache_opts: &ResultsCacheOptions| -> Option<ResponseCacheRef> {
            if !cache_opts.enable {
                return None;
            }
            Some(
                cache
                    .clone()
                    .unwrap_or_else(|| Arc::new(InMemoryResponseCache::new(100_000))),
            )
        };

        let range = build_range_pipeline(
            &options,
            limits.clone(),
            cache_for(&options.query_range.results_cache),
            downstream.clone(),
        );
        let instant = build_instant_pipeline(&options, limits.clone(), downstream.clone());
        let labels = build_labels_pipeline(
            &options,
            limits.clone(),
            cache_for(&options.labels.results_cache),
            downstream.clone(),
        );
        let series = build_series_pipeline(
            &options,
            limits,
            cache_for(&options.labels.results_cache),
            downstream.clone(),
        );

        let tracker = Arc::new(ActiveTenantTracker::default());
        let cleaner =
            ActiveTenantCleaner::start(tracker.clone(), options.active_tenants.clone());

        Ok(Self {
            options,
            range,
            instant,
            labels,
            series,
            downstream,
            tracker,
            _cleaner: cleaner,
        })
    }

    /// Dispatches one request, returning errors to the caller.
    pub async fn round_trip(&self, mut req: http::Request<Bytes>) -> Result<http::Response<Bytes>> {
        let tenant = tenancy::normalize_tenant(&mut req, &self.options.tenancy)?;

        let Some(op) = get_operation(&req) else {
            // unmatched paths pass through untouched
            let ctx = RequestContext::new(vec![tenant]);
            return self.downstream.round_trip(&ctx, req).await;
        };

        METRIC_QUERIES_TOTAL
            .with_label_values(&[op.as_str(), &tenant])
            .inc();
        self.tracker.update(&tenant);

        let ctx = RequestContext::new(vec![tenant])
            .with_stats(Arc::new(StatsAccumulator::default()));

        match op {
            Operation::RangeQuery => self.range.execute(&ctx, &req).await,
            Operation::InstantQuery => self.instant.execute(&ctx, &req).await,
            Operation::LabelNames | Operation::LabelValues => {
                self.labels.execute(&ctx, &req).await
            }
            Operation::Series => self.series.execute(&ctx, &req).await,
        }
    }

    /// Dispatches one request, encoding errors into Prometheus-style error
    /// responses.
    pub async fn handle(&self, req: http::Request<Bytes>) -> http::Response<Bytes> {
        match self.round_trip(req).await {
            Ok(resp) => resp,
            Err(err) => error_response(&err),
        }
    }
}

/// Encodes an error the way the Prometheus API reports them.
pub fn error_response(err: &Error) -> http::Response<Bytes> {
    let status = err.status_code();
    let error_type = match err {
        Error::Canceled => "canceled",
        Error::NotFound { .. } => "not_found",
        _ if status.is_client_error() => "bad_data",
        _ => "internal",
    };
    let body = json!({
        "status": "error",
        "errorType": error_type,
        "error": err.to_string(),
    });

    http::Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Bytes::from(body.to_string()))
        .unwrap_or_default()
}

fn instrument<R, S>(name: &'static str) -> MiddlewareRef<R, S>
where
    R: Send + Sync + 'static,
    S: Send + 'static,
{
    Arc::new(InstrumentMiddleware::new(name))
}

fn build_range_pipeline(
    options: &QueryFrontendOptions,
    limits: LimitsRef,
    cache: Option<ResponseCacheRef>,
    downstream: RoundTripperRef,
) -> Pipeline<QueryRangeCodec> {
    let opts = &options.query_range;
    let codec = Arc::new(QueryRangeCodec::new(opts.partial_response));
    let merger: Arc<dyn Merger<QueryRangeRequest, PrometheusResponse>> = codec.clone();

    let mut middlewares: Vec<MiddlewareRef<QueryRangeRequest, PrometheusResponse>> =
        vec![Arc::new(LimitsMiddleware::new(limits.clone()))];
    middlewares.push(Arc::new(StatsMiddleware::new(options.force_query_stats)));

    if opts.align_range_with_step {
        middlewares.push(instrument("step_align"));
        middlewares.push(Arc::new(StepAlignMiddleware::new()));
    }
    if opts.request_downsampled {
        middlewares.push(instrument("downsampled"));
        middlewares.push(Arc::new(DownsampleMiddleware::new(merger.clone())));
    }
    if !opts.split_queries_by_interval.is_zero() || !opts.min_split_interval.is_zero() {
        middlewares.push(instrument("split_by_interval"));
        middlewares.push(Arc::new(SplitByIntervalMiddleware::new(
            dynamic_interval_fn(opts),
            limits.clone(),
            merger.clone(),
        )));
    }
    if opts.num_shards > 0 {
        middlewares.push(instrument("sharding"));
        middlewares.push(Arc::new(ShardingMiddleware::new(
            QueryAnalyzer::new(),
            opts.num_shards,
            limits.clone(),
            merger.clone(),
        )));
    }
    if let Some(cache) = cache {
        middlewares.push(instrument("results_cache"));
        middlewares.push(Arc::new(ResultsCacheMiddleware::new(
            cache,
            limits.clone(),
            merger,
            opts.results_cache.ttl,
        )));
    }
    if opts.max_retries > 0 {
        middlewares.push(instrument("retry"));
        middlewares.push(Arc::new(RetryMiddleware::new(opts.max_retries)));
    }

    let inner: HandlerRef<QueryRangeRequest, PrometheusResponse> = Arc::new(DownstreamHandler {
        codec: codec.clone(),
        next: downstream,
    });
    Pipeline {
        codec,
        handler: compose(middlewares, inner),
        forward_headers: options.forward_headers.clone(),
    }
}

fn build_instant_pipeline(
    options: &QueryFrontendOptions,
    limits: LimitsRef,
    downstream: RoundTripperRef,
) -> Pipeline<QueryInstantCodec> {
    let opts = &options.query_range;
    let codec = Arc::new(QueryInstantCodec::new(opts.partial_response));
    let merger: Arc<dyn Merger<QueryInstantRequest, InstantResponse>> = codec.clone();

    let mut middlewares: Vec<MiddlewareRef<QueryInstantRequest, InstantResponse>> = Vec::new();
    if opts.num_shards > 0 {
        middlewares.push(instrument("sharding"));
        middlewares.push(Arc::new(ShardingMiddleware::new(
            QueryAnalyzer::new(),
            opts.num_shards,
            limits,
            merger,
        )));
    }
    middlewares.push(Arc::new(StatsMiddleware::new(options.force_query_stats)));

    let inner: HandlerRef<QueryInstantRequest, InstantResponse> = Arc::new(DownstreamHandler {
        codec: codec.clone(),
        next: downstream,
    });
    Pipeline {
        codec,
        handler: compose(middlewares, inner),
        forward_headers: options.forward_headers.clone(),
    }
}

fn build_labels_pipeline(
    options: &QueryFrontendOptions,
    limits: LimitsRef,
    cache: Option<ResponseCacheRef>,
    downstream: RoundTripperRef,
) -> Pipeline<LabelsCodec> {
    let opts = &options.labels;
    let codec = Arc::new(LabelsCodec::new(
        opts.partial_response,
        opts.default_time_range,
    ));
    let merger: Arc<dyn Merger<LabelsRequest, LabelsResponse>> = codec.clone();

    let mut middlewares: Vec<MiddlewareRef<LabelsRequest, LabelsResponse>> = Vec::new();
    if !opts.split_queries_by_interval.is_zero() {
        middlewares.push(instrument("split_by_interval"));
        middlewares.push(Arc::new(SplitByIntervalMiddleware::new(
            static_interval_fn(opts.split_queries_by_interval),
            limits.clone(),
            merger.clone(),
        )));
    }
    if let Some(cache) = cache {
        middlewares.push(instrument("results_cache"));
        middlewares.push(Arc::new(ResultsCacheMiddleware::new(
            cache,
            limits.clone(),
            merger,
            opts.results_cache.ttl,
        )));
    }
    if opts.max_retries > 0 {
        middlewares.push(instrument("retry"));
        middlewares.push(Arc::new(RetryMiddleware::new(opts.max_retries)));
    }

    let inner: HandlerRef<LabelsRequest, LabelsResponse> = Arc::new(DownstreamHandler {
        codec: codec.clone(),
        next: downstream,
    });
    Pipeline {
        codec,
        handler: compose(middlewares, inner),
        forward_headers: options.forward_headers.clone(),
    }
}

fn build_series_pipeline(
    options: &QueryFrontendOptions,
    limits: LimitsRef,
    cache: Option<ResponseCacheRef>,
    downstream: RoundTripperRef,
) -> Pipeline<SeriesCodec> {
    let opts = &options.labels;
    let codec = Arc::new(SeriesCodec::new(
        opts.partial_response,
        opts.default_time_range,
    ));
    let merger: Arc<dyn Merger<SeriesRequest, SeriesResponse>> = codec.clone();

    let mut middlewares: Vec<MiddlewareRef<SeriesRequest, SeriesResponse>> = Vec::new();
    if !opts.split_queries_by_interval.is_zero() {
        middlewares.push(instrument("split_by_interval"));
        middlewares.push(Arc::new(SplitByIntervalMiddleware::new(
            static_interval_fn(opts.split_queries_by_interval),
            limits.clone(),
            merger.clone(),
        )));
    }
    if let Some(cache) = cache {
        middlewares.push(instrument("results_cache"));
        middlewares.push(Arc::new(ResultsCacheMiddleware::new(
            cache,
            limits.clone(),
            merger,
            opts.results_cache.ttl,
        )));
    }
    if opts.max_retries > 0 {
        middlewares.push(instrument("retry"));
        middlewares.push(Arc::new(RetryMiddleware::new(opts.max_retries)));
    }

    let inner: HandlerRef<SeriesRequest, SeriesResponse> = Arc::new(DownstreamHandler {
        codec: codec.clone(),
        next: downstream,
    });
    Pipeline {
        codec,
        handler: compose(middlewares, inner),
        forward_headers: options.forward_headers.clone(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::limits::StaticOverrides;

    #[test]
    fn test_get_operation() {
        let request = |method: http::Method, path: &str| {
            http::Request::builder()
                .method(method)
                .uri(path)
                .body(Bytes::new())
                .unwrap()
        };

        let cases = [
            ("/api/v1/query", Some(Operation::InstantQuery)),
            ("/api/v1/query_range", Some(Operation::RangeQuery)),
            ("/prefix/api/v1/query_range", Some(Operation::RangeQuery)),
            ("/api/v1/labels", Some(Operation::LabelNames)),
            ("/api/v1/label/job/values", Some(Operation::LabelValues)),
            ("/api/v1/label//values", None),
            ("/api/v1/series", Some(Operation::Series)),
            ("/api/v1/targets", None),
            ("/healthz", None),
        ];
        for (path, expected) in cases {
            assert_eq!(
                get_operation(&request(http::Method::GET, path)),
                expected,
                "path: {path}"
            );
        }

        assert_eq!(
            get_operation(&request(http::Method::DELETE, "/api/v1/query")),
            None
        );
    }

    /// Replies with a canned body and records everything it saw.
    struct MockDownstream {
        body: &'static str,
        seen: Mutex<Vec<http::Request<Bytes>>>,
    }

    impl MockDownstream {
        fn new(body: &'static str) -> Arc<Self> {
            Arc::new(Self {
                body,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RoundTripper for MockDownstream {
        async fn round_trip(
            &self,
            _ctx: &RequestContext,
            req: http::Request<Bytes>,
        ) -> Result<http::Response<Bytes>> {
            self.seen.lock().unwrap().push(req);
            Ok(http::Response::builder()
                .status(200)
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(Bytes::from_static(self.body.as_bytes()))
                .unwrap())
        }
    }

    const EMPTY_MATRIX: &str =
        r#"{"status":"success","data":{"resultType":"matrix","result":[]}}"#;

    fn frontend(downstream: RoundTripperRef) -> QueryFrontend {
        let mut options = QueryFrontendOptions::default();
        options.tenancy.tenant_header = "X-Scope-OrgID".to_string();
        options.query_range.split_queries_by_interval = Duration::from_millis(1_800_000);
        QueryFrontend::try_new(
            options,
            Arc::new(StaticOverrides::default()),
            None,
            downstream,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_range_query_splits_and_succeeds() {
        let downstream = MockDownstream::new(EMPTY_MATRIX);
        let frontend = frontend(downstream.clone());

        let req = http::Request::builder()
            .method(http::Method::GET)
            .uri("/api/v1/query_range?query=up&start=0&end=3600&step=15")
            .body(Bytes::new())
            .unwrap();
        let resp = frontend.handle(req).await;

        assert_eq!(resp.status(), http::StatusCode::OK);
        // one hour split by 30m: two downstream sub-requests
        assert_eq!(downstream.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_tenancy_normalization_reaches_downstream() {
        let downstream = MockDownstream::new(EMPTY_MATRIX);
        let frontend = frontend(downstream.clone());

        let req = http::Request::builder()
            .method(http::Method::GET)
            .uri("/api/v1/query_range?query=up&start=0&end=60&step=15")
            .header("X-Scope-OrgID", "foo")
            .body(Bytes::new())
            .unwrap();
        frontend.handle(req).await;

        let seen = downstream.seen.lock().unwrap();
        for req in seen.iter() {
            assert_eq!(req.headers().get("THANOS-TENANT").unwrap(), "foo");
            assert!(req.headers().get("X-Scope-OrgID").is_none());
        }
    }

    #[tokio::test]
    async fn test_invalid_tenant_rejected() {
        let downstream = MockDownstream::new(EMPTY_MATRIX);
        let frontend = frontend(downstream.clone());

        let req = http::Request::builder()
            .method(http::Method::GET)
            .uri("/api/v1/query?query=up")
            .header("X-Scope-OrgID", "foo/bar")
            .body(Bytes::new())
            .unwrap();
        let resp = frontend.handle(req).await;

        assert_eq!(resp.status(), http::StatusCode::BAD_REQUEST);
        assert!(downstream.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_path_passes_through() {
        let downstream = MockDownstream::new("pong");
        let frontend = frontend(downstream.clone());

        let req = http::Request::builder()
            .method(http::Method::GET)
            .uri("/-/healthy")
            .body(Bytes::new())
            .unwrap();
        let resp = frontend.handle(req).await;

        assert_eq!(resp.body(), &Bytes::from_static(b"pong"));
        let seen = downstream.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].uri().path(), "/-/healthy");
    }

    #[tokio::test]
    async fn test_labels_request_dispatches() {
        let downstream =
            MockDownstream::new(r#"{"status":"success","data":["__name__","job"]}"#);
        let frontend = frontend(downstream.clone());

        let req = http::Request::builder()
            .method(http::Method::GET)
            .uri("/api/v1/labels?start=0&end=3600")
            .body(Bytes::new())
            .unwrap();
        let resp = frontend.handle(req).await;

        assert_eq!(resp.status(), http::StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["status"], "success");
        assert_eq!(body["data"][0], "__name__");
    }

    #[tokio::test]
    async fn test_parse_failure_is_bad_request() {
        let downstream = MockDownstream::new(EMPTY_MATRIX);
        let frontend = frontend(downstream.clone());

        let req = http::Request::builder()
            .method(http::Method::GET)
            .uri("/api/v1/query_range?query=up&start=10&end=5&step=1")
            .body(Bytes::new())
            .unwrap();
        let resp = frontend.handle(req).await;

        assert_eq!(resp.status(), http::StatusCode::BAD_REQUEST);
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["status"], "error");
        assert_eq!(body["errorType"], "bad_data");
    }
}
