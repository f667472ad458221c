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

//! The injected response cache and the fingerprint keys pointing into it.

mod key;
mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

pub use self::key::CacheableRequest;
pub use self::memory::InMemoryResponseCache;

/// The injected key/value store backing the results cache. Implementations
/// must be safe to call concurrently.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    /// Looks keys up; the result is aligned with `keys`, misses are `None`.
    async fn get(&self, keys: &[String]) -> Vec<Option<Bytes>>;

    /// Stores one entry for at most `ttl`.
    async fn put(&self, key: String, value: Bytes, ttl: Duration);
}

pub type ResponseCacheRef = Arc<dyn ResponseCache>;
