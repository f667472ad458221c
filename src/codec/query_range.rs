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

use std::time::Duration;

use bytes::Bytes;

use super::form::{self, FormParams};
use super::{Codec, Merger};
use crate::error::{Error, Result};
use crate::merge::merge_range_responses;
use crate::promql;
use crate::request::QueryRangeRequest;
use crate::response::PrometheusResponse;

/// Longest series a single range query may produce.
const MAX_RESOLUTION_POINTS: i64 = 11_000;

/// Codec of the `/api/v1/query_range` pipeline.
pub struct QueryRangeCodec {
    /// Default of the `partial_response` parameter.
    partial_response: bool,
}

impl QueryRangeCodec {
    pub fn new(partial_response: bool) -> Self {
        Self { partial_response }
    }
}

impl Codec for QueryRangeCodec {
    type Req = QueryRangeRequest;
    type Resp = PrometheusResponse;

    fn decode_request(
        &self,
        req: &http::Request<Bytes>,
        forward_headers: &[String],
    ) -> Result<QueryRangeRequest> {
        let params = FormParams::parse(req);

        let start = require_time(&params, "start")?;
        let end = require_time(&params, "end")?;
        if end < start {
            return Err(Error::EndBeforeStart);
        }

        let step = match params.value("step") {
            Some(value) => form::parse_duration_millis("step", value)?,
            None => {
                return Err(Error::InvalidParameter {
                    param: "step".to_string(),
                    reason: "missing parameter".to_string(),
                })
            }
        };
        if step <= 0 {
            return Err(Error::InvalidParameter {
                param: "step".to_string(),
                reason: "zero or negative query resolution step is not accepted".to_string(),
            });
        }
        // For safety, limit the number of returned points per time series.
        if (end - start) / step > MAX_RESOLUTION_POINTS {
            return Err(Error::InvalidParameter {
                param: "step".to_string(),
                reason: "exceeded maximum resolution of 11,000 points per time series"
                    .to_string(),
            });
        }

        let timeout = params
            .value("timeout")
            .map(|value| form::parse_duration_millis("timeout", value))
            .transpose()?
            .map(|ms| Duration::from_millis(ms.max(0) as u64));

        let (auto_downsampling, max_source_resolution) =
            match params.value(super::MAX_SOURCE_RESOLUTION_PARAM) {
                Some("auto") => (true, 0),
                Some(value) => (
                    false,
                    form::parse_duration_millis(super::MAX_SOURCE_RESOLUTION_PARAM, value)?,
                ),
                None => (false, 0),
            };

        let lookback_delta = params
            .value(super::LOOKBACK_DELTA_PARAM)
            .map(|value| form::parse_duration_millis(super::LOOKBACK_DELTA_PARAM, value))
            .transpose()?
            .unwrap_or(0);

        Ok(QueryRangeRequest {
            path: req.uri().path().to_string(),
            start,
            end,
            step,
            query: params.value(super::QUERY_PARAM).unwrap_or("").to_string(),
            timeout,
            max_source_resolution,
            auto_downsampling,
            partial_response: form::parse_partial_response(
                &params,
                super::PARTIAL_RESPONSE_PARAM,
                self.partial_response,
            )?,
            dedup: form::parse_dedup(&params, super::DEDUP_PARAM)?,
            replica_labels: params.values(super::REPLICA_LABELS_PARAM).to_vec(),
            store_matchers: form::parse_matchers(&params, super::STORE_MATCHER_PARAM)?,
            shard_info: form::parse_shard_info(&params, super::SHARD_INFO_PARAM)?,
            lookback_delta,
            engine: params.value(super::ENGINE_PARAM).unwrap_or("").to_string(),
            stats: params.value(super::STATS_PARAM).unwrap_or("").to_string(),
            split_interval: None,
            caching_options: form::caching_options(req.headers()),
            headers: form::forwarded_headers(req.headers(), forward_headers),
        })
    }

    fn encode_request(&self, req: &QueryRangeRequest) -> Result<http::Request<Bytes>> {
        let mut params = vec![
            (super::QUERY_PARAM.to_string(), req.query.clone()),
            ("start".to_string(), form::encode_time(req.start)),
            ("end".to_string(), form::encode_time(req.end)),
            ("step".to_string(), form::encode_duration_millis(req.step)),
            (super::DEDUP_PARAM.to_string(), req.dedup.to_string()),
            (
                super::PARTIAL_RESPONSE_PARAM.to_string(),
                req.partial_response.to_string(),
            ),
        ];

        if req.auto_downsampling {
            params.push((
                super::MAX_SOURCE_RESOLUTION_PARAM.to_string(),
                "auto".to_string(),
            ));
        } else if req.max_source_resolution != 0 {
            // Only set when non-zero, a zero would disable auto-downsampling
            // in the downstream querier.
            params.push((
                super::MAX_SOURCE_RESOLUTION_PARAM.to_string(),
                form::encode_duration_millis(req.max_source_resolution),
            ));
        }

        for label in &req.replica_labels {
            params.push((super::REPLICA_LABELS_PARAM.to_string(), label.clone()));
        }
        for matcher in promql::format_matcher_sets(&req.store_matchers) {
            params.push((super::STORE_MATCHER_PARAM.to_string(), matcher));
        }
        if let Some(info) = &req.shard_info {
            let encoded = serde_json::to_string(info).map_err(|e| Error::Internal {
                err_msg: format!("failed to encode shard info: {e}"),
            })?;
            params.push((super::SHARD_INFO_PARAM.to_string(), encoded));
        }
        if req.lookback_delta > 0 {
            params.push((
                super::LOOKBACK_DELTA_PARAM.to_string(),
                form::encode_duration_millis(req.lookback_delta),
            ));
        }
        if let Some(timeout) = req.timeout {
            params.push((
                "timeout".to_string(),
                form::encode_duration_millis(timeout.as_millis() as i64),
            ));
        }
        if !req.engine.is_empty() {
            params.push((super::ENGINE_PARAM.to_string(), req.engine.clone()));
        }
        if !req.stats.is_empty() {
            params.push((super::STATS_PARAM.to_string(), req.stats.clone()));
        }

        let mut http_req = super::form_post_request(&req.path, params)?;
        super::apply_request_headers(&mut http_req, &req.headers);
        Ok(http_req)
    }

    fn decode_response(
        &self,
        resp: &http::Response<Bytes>,
        _req: &QueryRangeRequest,
    ) -> Result<PrometheusResponse> {
        super::ensure_success(resp)?;
        let mut decoded: PrometheusResponse = super::decode_json_body(resp)?;
        decoded.headers = super::response_headers(resp);
        Ok(decoded)
    }

    fn encode_response(&self, resp: &PrometheusResponse) -> Result<http::Response<Bytes>> {
        super::encode_json_response(resp)
    }
}

impl Merger<QueryRangeRequest, PrometheusResponse> for QueryRangeCodec {
    fn merge(
        &self,
        _req: &QueryRangeRequest,
        responses: Vec<PrometheusResponse>,
    ) -> Result<PrometheusResponse> {
        Ok(merge_range_responses(responses))
    }
}

fn require_time(params: &FormParams, name: &str) -> Result<i64> {
    match params.value(name) {
        Some(value) => form::parse_time(name, value),
        None => Err(Error::InvalidParameter {
            param: name.to_string(),
            reason: "missing parameter".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ShardInfo;
    use crate::response::{PrometheusData, SampleStream, STATUS_SUCCESS};

    fn codec() -> QueryRangeCodec {
        QueryRangeCodec::new(true)
    }

    fn decode(uri: &str) -> Result<QueryRangeRequest> {
        let req = http::Request::builder()
            .method(http::Method::GET)
            .uri(uri)
            .body(Bytes::new())
            .unwrap();
        codec().decode_request(&req, &[])
    }

    #[test]
    fn test_decode_basic() {
        let req = decode("/api/v1/query_range?query=up&start=0&end=3600&step=15").unwrap();
        assert_eq!(req.query, "up");
        assert_eq!(req.start, 0);
        assert_eq!(req.end, 3_600_000);
        assert_eq!(req.step, 15_000);
        assert!(req.dedup);
        assert!(req.partial_response);
        assert!(!req.auto_downsampling);
    }

    #[test]
    fn test_decode_rejects_bad_ranges() {
        assert!(matches!(
            decode("/api/v1/query_range?query=up&start=10&end=5&step=1"),
            Err(Error::EndBeforeStart)
        ));
        assert!(decode("/api/v1/query_range?query=up&start=0&end=10&step=0").is_err());
        assert!(decode("/api/v1/query_range?query=up&start=0&end=10").is_err());
        // more than 11000 points
        assert!(decode("/api/v1/query_range?query=up&start=0&end=100000&step=0.001").is_err());
    }

    #[test]
    fn test_decode_auto_downsampling() {
        let req = decode(
            "/api/v1/query_range?query=up&start=0&end=60&step=15&max_source_resolution=auto",
        )
        .unwrap();
        assert!(req.auto_downsampling);
        assert_eq!(req.max_source_resolution, 0);

        let req = decode(
            "/api/v1/query_range?query=up&start=0&end=60&step=15&max_source_resolution=5m",
        )
        .unwrap();
        assert!(!req.auto_downsampling);
        assert_eq!(req.max_source_resolution, 300_000);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let req = QueryRangeRequest {
            path: "/api/v1/query_range".to_string(),
            start: 1_000,
            end: 3_601_000,
            step: 15_000,
            query: "sum(rate(up[1m]))".to_string(),
            dedup: true,
            partial_response: true,
            lookback_delta: 300_000,
            engine: "prometheus".to_string(),
            shard_info: Some(ShardInfo {
                total_shards: 2,
                shard_index: 0,
                by: true,
                labels: vec!["pod".to_string()],
            }),
            ..Default::default()
        };

        let encoded = codec().encode_request(&req).unwrap();
        assert_eq!(encoded.method(), http::Method::POST);
        let decoded = codec().decode_request(&encoded, &[]).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_response_roundtrip() {
        let resp = PrometheusResponse {
            status: STATUS_SUCCESS.to_string(),
            data: PrometheusData {
                result: vec![SampleStream::default()],
                ..Default::default()
            },
            ..Default::default()
        };
        let encoded = codec().encode_response(&resp).unwrap();
        assert_eq!(
            encoded.headers()[http::header::CONTENT_TYPE],
            "application/json"
        );
        let http_resp = http::Response::builder()
            .status(200)
            .body(encoded.body().clone())
            .unwrap();
        let decoded = codec()
            .decode_response(&http_resp, &QueryRangeRequest::default())
            .unwrap();
        assert_eq!(decoded.data, resp.data);
    }

    #[test]
    fn test_error_response_propagates_status() {
        let http_resp = http::Response::builder()
            .status(502)
            .body(Bytes::from_static(b"bad gateway"))
            .unwrap();
        match codec().decode_response(&http_resp, &QueryRangeRequest::default()) {
            Err(Error::Downstream { code, body }) => {
                assert_eq!(code, 502);
                assert_eq!(body, "bad gateway");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
