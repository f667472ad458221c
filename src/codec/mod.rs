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

//! Codecs translating between wire-level HTTP and the typed requests and
//! responses the pipelines manipulate.

pub mod form;
mod labels;
mod query_instant;
mod query_range;

use bytes::Bytes;
use serde::Serialize;

pub use self::labels::{LabelsCodec, SeriesCodec};
pub use self::query_instant::QueryInstantCodec;
pub use self::query_range::QueryRangeCodec;
use crate::error::{DecodeResponseSnafu, EncodeResponseSnafu, Error, Result};
use crate::response::ResponseHeader;
use snafu::ResultExt;

// Request parameter names of the downstream query API.
pub(crate) const QUERY_PARAM: &str = "query";
pub(crate) const DEDUP_PARAM: &str = "dedup";
pub(crate) const PARTIAL_RESPONSE_PARAM: &str = "partial_response";
pub(crate) const MAX_SOURCE_RESOLUTION_PARAM: &str = "max_source_resolution";
pub(crate) const REPLICA_LABELS_PARAM: &str = "replicaLabels[]";
pub(crate) const MATCHER_PARAM: &str = "match[]";
pub(crate) const STORE_MATCHER_PARAM: &str = "storeMatch[]";
pub(crate) const SHARD_INFO_PARAM: &str = "shard_info";
pub(crate) const LOOKBACK_DELTA_PARAM: &str = "lookback_delta";
pub(crate) const ENGINE_PARAM: &str = "engine";
pub(crate) const ANALYZE_PARAM: &str = "analyze";
pub(crate) const STATS_PARAM: &str = "stats";

/// How much of an error body is kept when a downstream request fails, so the
/// rest of the stream can be discarded and the connection reused.
pub(crate) const MAX_ERROR_BODY_BYTES: usize = 1024;

/// Translates one pipeline's requests and responses to and from HTTP.
pub trait Codec: Send + Sync + 'static {
    type Req: Send + 'static;
    type Resp: Send + 'static;

    /// HTTP to typed request. `forward_headers` is the allow-list of headers
    /// copied onto the typed request.
    fn decode_request(
        &self,
        req: &http::Request<Bytes>,
        forward_headers: &[String],
    ) -> Result<Self::Req>;

    /// Typed request to the HTTP request sent downstream.
    fn encode_request(&self, req: &Self::Req) -> Result<http::Request<Bytes>>;

    /// Downstream HTTP response to typed response. Non-2xx responses become
    /// [Error::Downstream].
    fn decode_response(
        &self,
        resp: &http::Response<Bytes>,
        req: &Self::Req,
    ) -> Result<Self::Resp>;

    /// Typed response back to the HTTP response returned to the caller.
    fn encode_response(&self, resp: &Self::Resp) -> Result<http::Response<Bytes>>;
}

/// Merges sub-responses back into one. Implemented by the codecs, which know
/// the shape of their responses.
pub trait Merger<R, S>: Send + Sync {
    fn merge(&self, req: &R, responses: Vec<S>) -> Result<S>;
}

/// Rejects non-2xx downstream responses, keeping a bounded error body.
pub(crate) fn ensure_success(resp: &http::Response<Bytes>) -> Result<()> {
    if resp.status().as_u16() / 100 == 2 {
        return Ok(());
    }
    let body = resp.body();
    let tail = &body[..body.len().min(MAX_ERROR_BODY_BYTES)];
    Err(Error::Downstream {
        code: resp.status().as_u16(),
        body: String::from_utf8_lossy(tail).into_owned(),
    })
}

pub(crate) fn decode_json_body<T: serde::de::DeserializeOwned>(
    resp: &http::Response<Bytes>,
) -> Result<T> {
    serde_json::from_slice(resp.body()).context(DecodeResponseSnafu)
}

pub(crate) fn response_headers(resp: &http::Response<Bytes>) -> Vec<ResponseHeader> {
    let mut headers: Vec<ResponseHeader> = Vec::new();
    for (name, value) in resp.headers() {
        let Ok(value) = value.to_str() else {
            continue;
        };
        match headers.iter_mut().find(|h| h.name == name.as_str()) {
            Some(header) => header.values.push(value.to_string()),
            None => headers.push(ResponseHeader {
                name: name.as_str().to_string(),
                values: vec![value.to_string()],
            }),
        }
    }
    headers
}

/// JSON-encodes a typed response into a 200 HTTP response.
pub(crate) fn encode_json_response<T: Serialize>(value: &T) -> Result<http::Response<Bytes>> {
    let body = serde_json::to_vec(value).context(EncodeResponseSnafu)?;
    http::Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Bytes::from(body))
        .map_err(|e| Error::Internal {
            err_msg: format!("failed to build response: {e}"),
        })
}

/// Builds the form-encoded POST request the downstream expects.
pub(crate) fn form_post_request(
    path: &str,
    params: Vec<(String, String)>,
) -> Result<http::Request<Bytes>> {
    let mut body = url::form_urlencoded::Serializer::new(String::new());
    for (name, value) in &params {
        body.append_pair(name, value);
    }
    http::Request::builder()
        .method(http::Method::POST)
        .uri(path)
        .header(
            http::header::CONTENT_TYPE,
            "application/x-www-form-urlencoded",
        )
        .body(Bytes::from(body.finish()))
        .map_err(|source| Error::BuildRequest { source })
}

/// Builds a GET request with the parameters in the query string, for the one
/// read-only endpoint encoded without a body.
pub(crate) fn query_get_request(
    path: &str,
    params: Vec<(String, String)>,
) -> Result<http::Request<Bytes>> {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    for (name, value) in &params {
        query.append_pair(name, value);
    }
    http::Request::builder()
        .method(http::Method::GET)
        .uri(format!("{path}?{}", query.finish()))
        .body(Bytes::new())
        .map_err(|source| Error::BuildRequest { source })
}

/// Copies the typed request's forwarded headers onto the outgoing request.
pub(crate) fn apply_request_headers(
    req: &mut http::Request<Bytes>,
    headers: &[crate::request::RequestHeader],
) {
    for header in headers {
        for value in &header.values {
            if let (Ok(name), Ok(value)) = (
                http::header::HeaderName::try_from(header.name.as_str()),
                http::header::HeaderValue::try_from(value.as_str()),
            ) {
                req.headers_mut().append(name, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_success() {
        let ok = http::Response::builder()
            .status(200)
            .body(Bytes::new())
            .unwrap();
        assert!(ensure_success(&ok).is_ok());

        let failed = http::Response::builder()
            .status(500)
            .body(Bytes::from(vec![b'x'; 4096]))
            .unwrap();
        match ensure_success(&failed) {
            Err(Error::Downstream { code, body }) => {
                assert_eq!(code, 500);
                assert_eq!(body.len(), MAX_ERROR_BODY_BYTES);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_form_post_request() {
        let req = form_post_request(
            "/api/v1/query_range",
            vec![("query".to_string(), "up{job=\"a b\"}".to_string())],
        )
        .unwrap();
        assert_eq!(req.method(), http::Method::POST);
        let body = String::from_utf8(req.body().to_vec()).unwrap();
        assert!(body.starts_with("query="));
        assert!(!body.contains(' '), "form body must be urlencoded: {body}");
    }
}
