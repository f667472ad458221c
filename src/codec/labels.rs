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

//! Codecs of the metadata endpoints: label names, label values and series.

use std::time::Duration;

use bytes::Bytes;

use super::form::{self, FormParams};
use super::{Codec, Merger};
use crate::error::Result;
use crate::merge::{merge_labels_responses, merge_series_responses};
use crate::promql;
use crate::request::{LabelsRequest, SeriesRequest};
use crate::response::{LabelsResponse, SeriesResponse};
use crate::util::current_millis;

const LABEL_VALUES_INFIX: &str = "/api/v1/label/";

/// Codec of `/api/v1/labels` and `/api/v1/label/<name>/values`.
pub struct LabelsCodec {
    partial_response: bool,
    default_time_range: Duration,
}

impl LabelsCodec {
    pub fn new(partial_response: bool, default_time_range: Duration) -> Self {
        Self {
            partial_response,
            default_time_range,
        }
    }
}

impl Codec for LabelsCodec {
    type Req = LabelsRequest;
    type Resp = LabelsResponse;

    fn decode_request(
        &self,
        req: &http::Request<Bytes>,
        forward_headers: &[String],
    ) -> Result<LabelsRequest> {
        let params = FormParams::parse(req);
        let (start, end) = form::parse_metadata_time_range(
            &params,
            self.default_time_range.as_millis() as i64,
            current_millis(),
        )?;

        let path = req.uri().path().to_string();
        // For the values endpoint the label is the second-to-last path part.
        let label = if path.contains(LABEL_VALUES_INFIX) {
            let parts: Vec<&str> = path.split('/').collect();
            if parts.len() > 1 {
                parts[parts.len() - 2].to_string()
            } else {
                String::new()
            }
        } else {
            String::new()
        };

        Ok(LabelsRequest {
            path,
            start,
            end,
            label,
            matchers: form::parse_matchers(&params, super::MATCHER_PARAM)?,
            store_matchers: form::parse_matchers(&params, super::STORE_MATCHER_PARAM)?,
            partial_response: form::parse_partial_response(
                &params,
                super::PARTIAL_RESPONSE_PARAM,
                self.partial_response,
            )?,
            split_interval: None,
            caching_options: form::caching_options(req.headers()),
            headers: form::forwarded_headers(req.headers(), forward_headers),
        })
    }

    fn encode_request(&self, req: &LabelsRequest) -> Result<http::Request<Bytes>> {
        let mut params = vec![
            ("start".to_string(), form::encode_time(req.start)),
            ("end".to_string(), form::encode_time(req.end)),
            (
                super::PARTIAL_RESPONSE_PARAM.to_string(),
                req.partial_response.to_string(),
            ),
        ];
        for matcher in promql::format_matcher_sets(&req.matchers) {
            params.push((super::MATCHER_PARAM.to_string(), matcher));
        }
        for matcher in promql::format_matcher_sets(&req.store_matchers) {
            params.push((super::STORE_MATCHER_PARAM.to_string(), matcher));
        }

        // The single read-only endpoint keeps its parameters in the query
        // string.
        let mut http_req = if req.path.contains(LABEL_VALUES_INFIX) {
            super::query_get_request(&req.path, params)?
        } else {
            super::form_post_request(&req.path, params)?
        };
        super::apply_request_headers(&mut http_req, &req.headers);
        Ok(http_req)
    }

    fn decode_response(
        &self,
        resp: &http::Response<Bytes>,
        _req: &LabelsRequest,
    ) -> Result<LabelsResponse> {
        super::ensure_success(resp)?;
        let mut decoded: LabelsResponse = super::decode_json_body(resp)?;
        decoded.headers = super::response_headers(resp);
        Ok(decoded)
    }

    fn encode_response(&self, resp: &LabelsResponse) -> Result<http::Response<Bytes>> {
        super::encode_json_response(resp)
    }
}

impl Merger<LabelsRequest, LabelsResponse> for LabelsCodec {
    fn merge(&self, _req: &LabelsRequest, responses: Vec<LabelsResponse>) -> Result<LabelsResponse> {
        Ok(merge_labels_responses(responses))
    }
}

/// Codec of `/api/v1/series`.
pub struct SeriesCodec {
    partial_response: bool,
    default_time_range: Duration,
}

impl SeriesCodec {
    pub fn new(partial_response: bool, default_time_range: Duration) -> Self {
        Self {
            partial_response,
            default_time_range,
        }
    }
}

impl Codec for SeriesCodec {
    type Req = SeriesRequest;
    type Resp = SeriesResponse;

    fn decode_request(
        &self,
        req: &http::Request<Bytes>,
        forward_headers: &[String],
    ) -> Result<SeriesRequest> {
        let params = FormParams::parse(req);
        let (start, end) = form::parse_metadata_time_range(
            &params,
            self.default_time_range.as_millis() as i64,
            current_millis(),
        )?;

        Ok(SeriesRequest {
            path: req.uri().path().to_string(),
            start,
            end,
            matchers: form::parse_matchers(&params, super::MATCHER_PARAM)?,
            store_matchers: form::parse_matchers(&params, super::STORE_MATCHER_PARAM)?,
            dedup: form::parse_dedup(&params, super::DEDUP_PARAM)?,
            replica_labels: params.values(super::REPLICA_LABELS_PARAM).to_vec(),
            partial_response: form::parse_partial_response(
                &params,
                super::PARTIAL_RESPONSE_PARAM,
                self.partial_response,
            )?,
            split_interval: None,
            caching_options: form::caching_options(req.headers()),
            headers: form::forwarded_headers(req.headers(), forward_headers),
        })
    }

    fn encode_request(&self, req: &SeriesRequest) -> Result<http::Request<Bytes>> {
        let mut params = vec![
            ("start".to_string(), form::encode_time(req.start)),
            ("end".to_string(), form::encode_time(req.end)),
            (super::DEDUP_PARAM.to_string(), req.dedup.to_string()),
            (
                super::PARTIAL_RESPONSE_PARAM.to_string(),
                req.partial_response.to_string(),
            ),
        ];
        for label in &req.replica_labels {
            params.push((super::REPLICA_LABELS_PARAM.to_string(), label.clone()));
        }
        for matcher in promql::format_matcher_sets(&req.matchers) {
            params.push((super::MATCHER_PARAM.to_string(), matcher));
        }
        for matcher in promql::format_matcher_sets(&req.store_matchers) {
            params.push((super::STORE_MATCHER_PARAM.to_string(), matcher));
        }

        let mut http_req = super::form_post_request(&req.path, params)?;
        super::apply_request_headers(&mut http_req, &req.headers);
        Ok(http_req)
    }

    fn decode_response(
        &self,
        resp: &http::Response<Bytes>,
        _req: &SeriesRequest,
    ) -> Result<SeriesResponse> {
        super::ensure_success(resp)?;
        let mut decoded: SeriesResponse = super::decode_json_body(resp)?;
        decoded.headers = super::response_headers(resp);
        Ok(decoded)
    }

    fn encode_response(&self, resp: &SeriesResponse) -> Result<http::Response<Bytes>> {
        super::encode_json_response(resp)
    }
}

impl Merger<SeriesRequest, SeriesResponse> for SeriesCodec {
    fn merge(&self, _req: &SeriesRequest, responses: Vec<SeriesResponse>) -> Result<SeriesResponse> {
        Ok(merge_series_responses(responses))
    }
}
