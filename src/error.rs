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

use http::StatusCode;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Invalid parameter {}: {}", param, reason))]
    InvalidParameter { param: String, reason: String },

    #[snafu(display("End timestamp must not be before start time"))]
    EndBeforeStart,

    #[snafu(display(
        "The query time range exceeds the limit (query length: {}ms, limit: {}ms)",
        actual,
        limit
    ))]
    QueryTooLong { actual: i64, limit: i64 },

    #[snafu(display("Tenant name not valid: {}", tenant))]
    InvalidTenant { tenant: String },

    #[snafu(display("Failed to parse PromQL query {}: {}", query, reason))]
    ParseQuery { query: String, reason: String },

    #[snafu(display("No route for request path: {}", path))]
    NotFound { path: String },

    #[snafu(display("Downstream returned status {}: {}", code, body))]
    Downstream { code: u16, body: String },

    #[snafu(display("Failed to reach downstream: {}", source))]
    Transport { source: reqwest::Error },

    #[snafu(display("Request canceled"))]
    Canceled,

    #[snafu(display("Failed to decode response body: {}", source))]
    DecodeResponse { source: serde_json::Error },

    #[snafu(display("Failed to encode response body: {}", source))]
    EncodeResponse { source: serde_json::Error },

    #[snafu(display("Failed to build downstream request: {}", source))]
    BuildRequest { source: http::Error },

    #[snafu(display("Internal error: {}", err_msg))]
    Internal { err_msg: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The HTTP status this error should surface as to the caller.
    pub fn status_code(&self) -> StatusCode {
        use Error::*;
        match self {
            InvalidParameter { .. }
            | EndBeforeStart
            | QueryTooLong { .. }
            | InvalidTenant { .. }
            | ParseQuery { .. } => StatusCode::BAD_REQUEST,

            NotFound { .. } => StatusCode::NOT_FOUND,

            Downstream { code, .. } => {
                StatusCode::from_u16(*code).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Transport { .. } => StatusCode::BAD_GATEWAY,

            Canceled
            | DecodeResponse { .. }
            | EncodeResponse { .. }
            | BuildRequest { .. }
            | Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the retry middleware may re-issue the request after this error.
    ///
    /// Matches the upstream policy: transport failures and 5xx responses are
    /// retriable, cancellation and everything 4xx is not.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::Transport { .. } => true,
            Error::Downstream { code, .. } => code / 100 == 5,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(
            Error::EndBeforeStart.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::QueryTooLong {
                actual: 7_200_000,
                limit: 3_600_000
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Downstream {
                code: 503,
                body: "overloaded".to_string()
            }
            .status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::Canceled.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_retriable() {
        assert!(Error::Downstream {
            code: 500,
            body: String::new()
        }
        .is_retriable());
        assert!(!Error::Downstream {
            code: 400,
            body: String::new()
        }
        .is_retriable());
        assert!(!Error::Canceled.is_retriable());
        assert!(!Error::EndBeforeStart.is_retriable());
    }
}
