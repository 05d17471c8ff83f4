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

#![allow(clippy::uninlined_format_args)]

//! A read-through, write-through cache in front of slow data sources.
//!
//! Features:
//! - Values kept in a bounded, TTL-expiring in-memory store
//! - Keys refreshed, persisted and deleted through pluggable Updaters
//! - Values restored and persisted through one pluggable Backing
//! - Concurrent requests coalesced into batches, and every caller settled exactly once
//! - Explicit deletes told apart from passive TTL evictions
//!
//! # Collaborators
//!
//! - An [`Updater`] wraps a [`Refresh`] callback. Requests for its keys queue up and are handed
//!   to the callback in one [`Delegate`] per cycle. Cycles never overlap; the throttle spaces
//!   them and an optional interval runs heartbeat cycles.
//! - A [`Backing`] wraps a [`BackingStore`]. Writes, reads and deletes each have their own queue
//!   and throttle window. Concurrent reads of a key share one future.
//!
//! # Read Process
//!
//! 1. A value in the store is returned at once.
//! 2. On a miss, the Backing is read, then the key's Updater (or the default Updater) is asked,
//!    or the other way around with [`Prefer::Updater`].
//! 3. A miss nobody can serve resolves to `None`; a miss every source failed is an error.
//!
//! # Write Process
//!
//! 1. The value is written into the store and `new` or `change` is published.
//! 2. The key's Updater persists it. If that fails, the previous value is restored.
//! 3. The value is forwarded to the Backing.
//!
//! # Delete And Eviction
//!
//! The store reports every removal through a channel, whether it was an explicit delete or a
//! TTL expiry. Only `remove_data` and an Updater's `del` publish `del` and delete from the
//! Backing, and they do so themselves; the notifications are only logged. A TTL expiry
//! publishes no `del` and is not propagated to the Backing.
//!
//! ```text
//! | cache +----> spawn()-. (1)
//! |       + o-.          |
//! |       |   |          v                       evicted keys
//! |       |   `------->o Eviction-Watcher (task) <-------------------.
//! |       |   cancel              |                                  |
//! |       |                       | log, sweep expired               |
//! |       |   CacheData           v                                  |
//! |       +-+ store  ------------------------------------------------'
//! |         | routes: key -> Updater id
//! |         | read_fences: key -> Backing read in flight
//! |         | updaters ----> Updater --spawn()--> Refresh(Delegate)
//! |         | backing  ----> Backing --spawn()--> BackingStore(read/write/delete batch)
//! |         + events   ----> subscribers
//! ```

mod backing;
mod cache;
mod cache_data;
mod config;
mod delegate;
mod eviction_watcher;
mod stats;
mod store;
mod timer;
mod token;
mod type_config;
mod updater;

pub use backing::Backing;
pub use backing::PendingWrite;
pub use backing::StoreHandle;
pub use cache::Cache;
pub use config::BackingConfig;
pub use config::CacheConfig;
pub use config::Equality;
pub use config::GetOptions;
pub use config::Prefer;
pub use config::SetOptions;
pub use config::UpdaterConfig;
pub use config::UpdaterRef;
pub use delegate::Delegate;
pub use stats::Stats;
pub use store::Store;
pub use store::TtlStore;
pub use token::TokenFuture;
pub use token::TokenKind;
pub use type_config::BackingStore;
pub use type_config::Refresh;
pub use type_config::TypeConfig;
pub use updater::Phase;
pub use updater::Updater;

pub mod errors;
pub mod event_stream;

pub mod testing {
    pub mod backing;
    pub mod types;
    pub mod updater;
    pub mod util;
}
