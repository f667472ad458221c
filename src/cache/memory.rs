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

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use moka::sync::Cache;
use moka::Expiry;

use super::ResponseCache;

#[derive(Clone)]
struct Entry {
    data: Bytes,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &Entry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// An in-process [ResponseCache]; the default when no distributed cache is
/// wired in, and the backend the tests run against.
pub struct InMemoryResponseCache {
    cache: Cache<String, Entry>,
}

impl InMemoryResponseCache {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_capacity)
                .expire_after(PerEntryTtl)
                .build(),
        }
    }
}

#[async_trait]
impl ResponseCache for InMemoryResponseCache {
    async fn get(&self, keys: &[String]) -> Vec<Option<Bytes>> {
        keys.iter()
            .map(|key| self.cache.get(key).map(|entry| entry.data))
            .collect()
    }

    async fn put(&self, key: String, value: Bytes, ttl: Duration) {
        self.cache.insert(
            key,
            Entry {
                data: value,
                ttl,
            },
        );
    }
}
