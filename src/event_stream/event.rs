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

/// Who made the change an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSource {
    /// A caller of the cache API.
    Caller,

    /// A refresh callback, through its Delegate.
    Updater,

    /// The cache undoing a write the Updater failed to persist.
    Rollback,
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EventSource::Caller => write!(f, "caller"),
            EventSource::Updater => write!(f, "updater"),
            EventSource::Rollback => write!(f, "rollback"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent<V> {
    /// The first write of a key.
    New {
        key: String,
        value: V,
        source: EventSource,
        updater: Option<String>,
    },

    /// An overwrite that changed the value.
    Change {
        key: String,
        value: V,
        source: EventSource,
        updater: Option<String>,
    },

    /// A confirmed explicit delete. Passive evictions never produce one.
    Del {
        key: String,
        source: EventSource,
        updater: Option<String>,
    },
}

impl<V> CacheEvent<V> {
    pub fn key(&self) -> &str {
        match self {
            CacheEvent::New { key, .. } => key,
            CacheEvent::Change { key, .. } => key,
            CacheEvent::Del { key, .. } => key,
        }
    }

    pub fn source(&self) -> EventSource {
        match self {
            CacheEvent::New { source, .. } => *source,
            CacheEvent::Change { source, .. } => *source,
            CacheEvent::Del { source, .. } => *source,
        }
    }

    pub fn value(&self) -> Option<&V> {
        match self {
            CacheEvent::New { value, .. } => Some(value),
            CacheEvent::Change { value, .. } => Some(value),
            CacheEvent::Del { .. } => None,
        }
    }

    pub fn is_del(&self) -> bool {
        matches!(self, CacheEvent::Del { .. })
    }
}

impl<V> fmt::Display for CacheEvent<V>
where
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CacheEvent::New { key, value, source, .. } => {
                write!(f, "new({}={:?}, by {})", key, value, source)
            }
            CacheEvent::Change { key, value, source, .. } => {
                write!(f, "change({}={:?}, by {})", key, value, source)
            }
            CacheEvent::Del { key, source, .. } => write!(f, "del({}, by {})", key, source),
        }
    }
}
