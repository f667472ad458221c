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

//! The query frontend core: a middleware pipeline that fans Prometheus read
//! requests out into coordinated sub-requests and merges the responses.
//!
//! The embedded HTTP server hands wire-level requests to
//! [QueryFrontend::handle](roundtrip::QueryFrontend::handle); everything
//! between decoding and the downstream querier happens in the typed
//! [Handler](handler::Handler) chains assembled in [roundtrip].

pub mod active_tenants;
pub mod cache;
pub mod codec;
pub mod config;
pub mod context;
pub mod downstream;
pub mod error;
pub mod executor;
pub mod handler;
pub mod limits;
pub mod merge;
mod metrics;
pub mod middleware;
mod promql;
pub mod querysharding;
pub mod request;
pub mod response;
pub mod roundtrip;
pub mod tenancy;
mod util;

pub use crate::config::QueryFrontendOptions;
pub use crate::downstream::{DownstreamRoundTripper, RoundTripper, RoundTripperRef};
pub use crate::error::{Error, Result};
pub use crate::limits::{Limits, LimitsRef, StaticOverrides};
pub use crate::roundtrip::QueryFrontend;
