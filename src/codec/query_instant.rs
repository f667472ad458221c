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
use crate::merge::merge_instant_responses;
use crate::promql;
use crate::request::QueryInstantRequest;
use crate::response::InstantResponse;

/// Codec of the `/api/v1/query` pipeline.
pub struct QueryInstantCodec {
    /// Default of the `partial_response` parameter.
    partial_response: bool,
}

impl QueryInstantCodec {
    pub fn new(partial_response: bool) -> Self {
        Self { partial_response }
    }
}

impl Codec for QueryInstantCodec {
    type Req = QueryInstantRequest;
    type Resp = InstantResponse;

    fn decode_request(
        &self,
        req: &http::Request<Bytes>,
        forward_headers: &[String],
    ) -> Result<QueryInstantRequest> {
        let params = FormParams::parse(req);

        let time = params
            .value("time")
            .map(|value| form::parse_time("time", value))
            .transpose()?
            .unwrap_or(0);

        let analyze = params
            .value(super::ANALYZE_PARAM)
            .map(|value| form::parse_bool(super::ANALYZE_PARAM, value))
            .transpose()?
            .unwrap_or(false);

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

        Ok(QueryInstantRequest {
            path: req.uri().path().to_string(),
            time,
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
            analyze,
            replica_labels: params.values(super::REPLICA_LABELS_PARAM).to_vec(),
            store_matchers: form::parse_matchers(&params, super::STORE_MATCHER_PARAM)?,
            shard_info: form::parse_shard_info(&params, super::SHARD_INFO_PARAM)?,
            lookback_delta,
            engine: params.value(super::ENGINE_PARAM).unwrap_or("").to_string(),
            stats: params.value(super::STATS_PARAM).unwrap_or("").to_string(),
            caching_options: form::caching_options(req.headers()),
            headers: form::forwarded_headers(req.headers(), forward_headers),
        })
    }

    fn encode_request(&self, req: &QueryInstantRequest) -> Result<http::Request<Bytes>> {
        let mut params = vec![
            (super::QUERY_PARAM.to_string(), req.query.clone()),
            (super::DEDUP_PARAM.to_string(), req.dedup.to_string()),
            (super::ANALYZE_PARAM.to_string(), req.analyze.to_string()),
            (
                super::PARTIAL_RESPONSE_PARAM.to_string(),
                req.partial_response.to_string(),
            ),
        ];

        if req.time > 0 {
            params.push(("time".to_string(), form::encode_time(req.time)));
        }
        if req.auto_downsampling {
            params.push((
                super::MAX_SOURCE_RESOLUTION_PARAM.to_string(),
                "auto".to_string(),
            ));
        } else if req.max_source_resolution != 0 {
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
        _req: &QueryInstantRequest,
    ) -> Result<InstantResponse> {
        super::ensure_success(resp)?;
        let mut decoded: InstantResponse = super::decode_json_body(resp)?;
        decoded.headers = super::response_headers(resp);
        Ok(decoded)
    }

    fn encode_response(&self, resp: &InstantResponse) -> Result<http::Response<Bytes>> {
        super::encode_json_response(resp)
    }
}

impl Merger<QueryInstantRequest, InstantResponse> for QueryInstantCodec {
    fn merge(
        &self,
        req: &QueryInstantRequest,
        responses: Vec<InstantResponse>,
    ) -> Result<InstantResponse> {
        merge_instant_responses(&req.query, responses)
    }
}
