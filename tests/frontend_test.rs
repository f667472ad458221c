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

//! End-to-end tests of the assembled frontend over a scripted downstream.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use query_frontend::codec::form::FormParams;
use query_frontend::config::QueryFrontendOptions;
use query_frontend::context::RequestContext;
use query_frontend::error::Result;
use query_frontend::limits::StaticOverrides;
use query_frontend::{QueryFrontend, RoundTripper, RoundTripperRef};

/// Replays scripted `(status, body)` responses and records every request.
struct ScriptedDownstream {
    script: Mutex<Vec<(u16, String)>>,
    fallback: String,
    seen: Mutex<Vec<http::Request<Bytes>>>,
}

impl ScriptedDownstream {
    fn new(script: Vec<(u16, String)>, fallback: &str) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            fallback: fallback.to_string(),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn request_params(&self, index: usize) -> FormParams {
        let seen = self.seen.lock().unwrap();
        FormParams::parse(&seen[index])
    }

    fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl RoundTripper for ScriptedDownstream {
    async fn round_trip(
        &self,
        _ctx: &RequestContext,
        req: http::Request<Bytes>,
    ) -> Result<http::Response<Bytes>> {
        self.seen.lock().unwrap().push(req);
        let (status, body) = {
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                (200, self.fallback.clone())
            } else {
                script.remove(0)
            }
        };
        Ok(http::Response::builder()
            .status(status)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Bytes::from(body))
            .unwrap())
    }
}

const EMPTY_MATRIX: &str = r#"{"status":"success","data":{"resultType":"matrix","result":[]}}"#;

fn matrix_body(samples: &[(f64, &str)]) -> String {
    let values: Vec<String> = samples
        .iter()
        .map(|(ts, value)| format!(r#"[{ts},"{value}"]"#))
        .collect();
    format!(
        r#"{{"status":"success","data":{{"resultType":"matrix","result":[{{"metric":{{"__name__":"up"}},"values":[{}]}}]}}}}"#,
        values.join(",")
    )
}

fn frontend(options: QueryFrontendOptions, downstream: RoundTripperRef) -> QueryFrontend {
    QueryFrontend::try_new(
        options,
        Arc::new(StaticOverrides::default()),
        None,
        downstream,
    )
    .unwrap()
}

fn get(uri: &str) -> http::Request<Bytes> {
    http::Request::builder()
        .method(http::Method::GET)
        .uri(uri)
        .body(Bytes::new())
        .unwrap()
}

#[tokio::test]
async fn test_range_split_windows() {
    let downstream = ScriptedDownstream::new(Vec::new(), EMPTY_MATRIX);
    let mut options = QueryFrontendOptions::default();
    options.query_range.split_queries_by_interval = Duration::from_millis(1_800_000);
    let frontend = frontend(options, downstream.clone());

    let resp = frontend
        .handle(get(
            "/api/v1/query_range?query=up&start=0&end=3600&step=15",
        ))
        .await;
    assert_eq!(resp.status(), http::StatusCode::OK);
    assert_eq!(downstream.calls(), 2);

    // exactly [0, 1785] and [1800, 3600], in seconds on the wire: the first
    // window ends one step before the interval boundary
    let first = downstream.request_params(0);
    assert_eq!(first.value("start"), Some("0.000"));
    assert_eq!(first.value("end"), Some("1785.000"));
    let second = downstream.request_params(1);
    assert_eq!(second.value("start"), Some("1800.000"));
    assert_eq!(second.value("end"), Some("3600.000"));
}

#[tokio::test]
async fn test_retry_ladder_recovers() {
    let downstream = ScriptedDownstream::new(
        vec![
            (500, "server exploded".to_string()),
            (500, "server exploded again".to_string()),
            (200, matrix_body(&[(0.0, "1")])),
        ],
        EMPTY_MATRIX,
    );
    let mut options = QueryFrontendOptions::default();
    options.query_range.split_queries_by_interval = Duration::from_millis(3_600_000);
    options.query_range.max_retries = 3;
    let frontend = frontend(options, downstream.clone());

    let resp = frontend
        .handle(get("/api/v1/query_range?query=up&start=0&end=60&step=15"))
        .await;

    assert_eq!(resp.status(), http::StatusCode::OK);
    assert_eq!(downstream.calls(), 3);
    let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
    assert_eq!(body["status"], "success");
}

#[tokio::test]
async fn test_retries_exhausted_propagate_status() {
    let downstream = ScriptedDownstream::new(
        vec![
            (503, "no".to_string()),
            (503, "still no".to_string()),
        ],
        EMPTY_MATRIX,
    );
    let mut options = QueryFrontendOptions::default();
    options.query_range.split_queries_by_interval = Duration::from_millis(3_600_000);
    options.query_range.max_retries = 2;
    let frontend = frontend(options, downstream.clone());

    let resp = frontend
        .handle(get("/api/v1/query_range?query=up&start=0&end=60&step=15"))
        .await;

    assert_eq!(resp.status(), http::StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn test_downsample_ladder_on_the_wire() {
    // raw data only reaches back to t=40s; the retry must ask for the head
    // at the 5m resolution
    let downstream = ScriptedDownstream::new(
        vec![
            (200, matrix_body(&[(40.0, "1"), (100.0, "1")])),
            (200, matrix_body(&[(0.0, "1"), (30.0, "1")])),
        ],
        EMPTY_MATRIX,
    );
    let mut options = QueryFrontendOptions::default();
    // isolate the ladder from splitting
    options.query_range.split_queries_by_interval = Duration::from_millis(86_400_000);
    let frontend = frontend(options, downstream.clone());

    let resp = frontend
        .handle(get(
            "/api/v1/query_range?query=up&start=0&end=100&step=10&max_source_resolution=auto",
        ))
        .await;

    assert_eq!(resp.status(), http::StatusCode::OK);
    assert_eq!(downstream.calls(), 2);
    assert_eq!(
        downstream.request_params(0).value("max_source_resolution"),
        Some("auto")
    );
    let retry = downstream.request_params(1);
    assert_eq!(retry.value("max_source_resolution"), Some("300"));
    assert_eq!(retry.value("start"), Some("0.000"));
    assert_eq!(retry.value("end"), Some("30.000"));

    let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
    let values = body["data"]["result"][0]["values"].as_array().unwrap();
    let timestamps: Vec<f64> = values.iter().map(|v| v[0].as_f64().unwrap()).collect();
    assert_eq!(timestamps, vec![0.0, 30.0, 40.0, 100.0]);
}

#[tokio::test]
async fn test_instant_query_shards_and_merges() {
    let shard0 = r#"{"status":"success","data":{"resultType":"vector","result":[{"metric":{"pod":"a"},"value":[1,"1"]}]}}"#;
    let shard1 = r#"{"status":"success","data":{"resultType":"vector","result":[{"metric":{"pod":"b"},"value":[1,"2"]}]}}"#;
    let downstream = ScriptedDownstream::new(
        vec![(200, shard0.to_string()), (200, shard1.to_string())],
        EMPTY_MATRIX,
    );
    let mut options = QueryFrontendOptions::default();
    options.query_range.num_shards = 2;
    let frontend = frontend(options, downstream.clone());

    let resp = frontend
        .handle(get(
            "/api/v1/query?query=sum%20by%20(pod)%20(rate(http_requests_total%5B1m%5D))",
        ))
        .await;

    assert_eq!(resp.status(), http::StatusCode::OK);
    assert_eq!(downstream.calls(), 2);

    // each sub-request carried its shard index
    let infos: Vec<String> = (0..2)
        .map(|i| {
            downstream
                .request_params(i)
                .value("shard_info")
                .unwrap()
                .to_string()
        })
        .collect();
    assert!(infos[0].contains("\"shardIndex\":0"), "{}", infos[0]);
    assert!(infos[1].contains("\"shardIndex\":1"), "{}", infos[1]);

    let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
    let result = body["data"]["result"].as_array().unwrap();
    assert_eq!(result.len(), 2);
}

#[tokio::test]
async fn test_results_cache_avoids_refetch() {
    let downstream = ScriptedDownstream::new(Vec::new(), EMPTY_MATRIX);
    let mut options = QueryFrontendOptions::default();
    options.query_range.split_queries_by_interval = Duration::from_millis(86_400_000);
    options.query_range.results_cache.enable = true;
    let frontend = QueryFrontend::try_new(
        options,
        Arc::new(StaticOverrides::new(query_frontend::limits::TenantLimits {
            max_cache_freshness: Duration::from_millis(1),
            ..Default::default()
        })),
        None,
        downstream.clone(),
    )
    .unwrap();

    let uri = "/api/v1/query_range?query=up&start=0&end=60&step=15";
    frontend.handle(get(uri)).await;
    let after_first = downstream.calls();
    frontend.handle(get(uri)).await;

    assert_eq!(downstream.calls(), after_first, "expected a cache hit");
}

#[tokio::test]
async fn test_cache_control_no_store_bypasses_cache() {
    let downstream = ScriptedDownstream::new(Vec::new(), EMPTY_MATRIX);
    let mut options = QueryFrontendOptions::default();
    options.query_range.split_queries_by_interval = Duration::from_millis(86_400_000);
    options.query_range.results_cache.enable = true;
    let frontend = frontend(options, downstream.clone());

    let req = || {
        http::Request::builder()
            .method(http::Method::GET)
            .uri("/api/v1/query_range?query=up&start=0&end=60&step=15")
            .header("Cache-Control", "no-store")
            .body(Bytes::new())
            .unwrap()
    };
    frontend.handle(req()).await;
    let after_first = downstream.calls();
    frontend.handle(req()).await;

    assert_eq!(downstream.calls(), after_first * 2);
}

#[tokio::test]
async fn test_forwarded_headers_reach_downstream() {
    let downstream = ScriptedDownstream::new(Vec::new(), EMPTY_MATRIX);
    let mut options = QueryFrontendOptions::default();
    options.query_range.split_queries_by_interval = Duration::from_millis(86_400_000);
    options.forward_headers = vec!["X-Trace-Id".to_string()];
    let frontend = frontend(options, downstream.clone());

    let req = http::Request::builder()
        .method(http::Method::GET)
        .uri("/api/v1/query_range?query=up&start=0&end=60&step=15")
        .header("X-Trace-Id", "trace-123")
        .header("X-Other", "dropped")
        .body(Bytes::new())
        .unwrap();
    frontend.handle(req).await;

    let seen = downstream.seen.lock().unwrap();
    assert_eq!(seen[0].headers().get("X-Trace-Id").unwrap(), "trace-123");
    assert!(seen[0].headers().get("X-Other").is_none());
}
