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

//! Forwarding sub-requests to the downstream querier.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use snafu::ResultExt;

use crate::config::DownstreamOptions;
use crate::context::RequestContext;
use crate::error::{Error, Result, TransportSnafu};

/// The wire-level analog of a [Handler](crate::handler::Handler): sends one
/// HTTP request and returns the HTTP response.
#[async_trait]
pub trait RoundTripper: Send + Sync {
    async fn round_trip(
        &self,
        ctx: &RequestContext,
        req: http::Request<Bytes>,
    ) -> Result<http::Response<Bytes>>;
}

pub type RoundTripperRef = Arc<dyn RoundTripper>;

/// Rewrites every request's URL onto the configured downstream base URL and
/// executes it. The `Host` header is cleared so the transport derives it
/// from the URL.
pub struct DownstreamRoundTripper {
    base: url::Url,
    client: reqwest::Client,
}

impl DownstreamRoundTripper {
    pub fn try_new(opts: &DownstreamOptions) -> Result<Self> {
        let base = url::Url::parse(&opts.url).map_err(|e| Error::InvalidParameter {
            param: "downstream.url".to_string(),
            reason: e.to_string(),
        })?;
        let client = reqwest::Client::builder()
            .timeout(opts.timeout)
            .build()
            .context(TransportSnafu)?;
        Ok(Self { base, client })
    }
}

#[async_trait]
impl RoundTripper for DownstreamRoundTripper {
    async fn round_trip(
        &self,
        ctx: &RequestContext,
        req: http::Request<Bytes>,
    ) -> Result<http::Response<Bytes>> {
        let mut url = self.base.clone();
        url.set_path(&join_paths(self.base.path(), req.uri().path()));
        url.set_query(req.uri().query());

        let mut headers = req.headers().clone();
        headers.remove(http::header::HOST);

        let request = self
            .client
            .request(req.method().clone(), url)
            .headers(headers)
            .body(req.body().clone());

        let response = tokio::select! {
            _ = ctx.cancellation().cancelled() => return Err(Error::Canceled),
            response = request.send() => response.context(TransportSnafu)?,
        };

        let mut builder = http::Response::builder().status(response.status());
        if let Some(headers) = builder.headers_mut() {
            headers.extend(response.headers().clone());
        }
        let body = response.bytes().await.context(TransportSnafu)?;
        builder.body(body).map_err(|e| Error::Internal {
            err_msg: format!("failed to assemble downstream response: {e}"),
        })
    }
}

/// Joins the downstream path prefix with the request path.
fn join_paths(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{prefix}/{path}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_paths() {
        assert_eq!(join_paths("/", "/api/v1/query"), "/api/v1/query");
        assert_eq!(
            join_paths("/thanos", "/api/v1/query"),
            "/thanos/api/v1/query"
        );
        assert_eq!(
            join_paths("/thanos/", "api/v1/query"),
            "/thanos/api/v1/query"
        );
    }

    #[test]
    fn test_try_new_rejects_invalid_url() {
        let opts = DownstreamOptions {
            url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(DownstreamRoundTripper::try_new(&opts).is_err());
    }

    #[test]
    fn test_url_rewrite_keeps_query() {
        let tripper = DownstreamRoundTripper::try_new(&DownstreamOptions {
            url: "http://querier:10902/prefix".to_string(),
            ..Default::default()
        })
        .unwrap();

        let mut url = tripper.base.clone();
        url.set_path(&join_paths(tripper.base.path(), "/api/v1/labels"));
        url.set_query(Some("start=1"));
        assert_eq!(
            url.as_str(),
            "http://querier:10902/prefix/api/v1/labels?start=1"
        );
    }
}
