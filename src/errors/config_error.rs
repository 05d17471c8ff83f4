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

use std::time::Duration;

/// Malformed options or an invalid registration.
///
/// These are returned when a cache, Updater or Backing is built or registered,
/// never from the data path.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("interval {interval:?} must be greater than throttle {throttle:?}")]
    IntervalNotGreaterThanThrottle {
        interval: Duration,
        throttle: Duration,
    },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("Updater id {0} is not known")]
    UnknownUpdater(String),

    #[error("a different Updater with id {0} is already registered")]
    DuplicateUpdater(String),

    #[error("Updater({0}) was created by another cache")]
    ForeignUpdater(String),

    #[error("Updater({0}) is shut down")]
    UpdaterShutDown(String),

    #[error("Backing({0}) is already attached")]
    BackingAttached(String),
}
