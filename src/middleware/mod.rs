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

//! The transformations that make query execution tractable.

pub mod downsample;
pub mod instrument;
pub mod limits;
pub mod results_cache;
pub mod retry;
pub mod sharding;
pub mod split;
pub mod stats;
pub mod step_align;

pub use downsample::DownsampleMiddleware;
pub use instrument::InstrumentMiddleware;
pub use limits::LimitsMiddleware;
pub use results_cache::ResultsCacheMiddleware;
pub use retry::RetryMiddleware;
pub use sharding::ShardingMiddleware;
pub use split::SplitByIntervalMiddleware;
pub use stats::StatsMiddleware;
pub use step_align::StepAlignMiddleware;
