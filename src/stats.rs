// Copyright 2021 Datafuse Labs
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

use std::fmt;

/// A read-only snapshot of the cache counters, returned by [`Cache::stats`](crate::Cache::stats).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// `get_data` calls answered from the store.
    pub hits: u64,

    /// `get_data` calls that missed the store and were served by the Backing or an Updater.
    pub misses: u64,

    pub all_gets: u64,

    /// Refresh cycles started by all Updaters.
    pub update_calls: u64,

    /// Live entries in the store.
    pub cache_size: usize,

    /// Registered Updaters, the default one included.
    pub num_updaters: usize,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} all_gets={} update_calls={} cache_size={} num_updaters={}",
            self.hits,
            self.misses,
            self.all_gets,
            self.update_calls,
            self.cache_size,
            self.num_updaters
        )
    }
}
