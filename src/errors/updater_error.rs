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

use crate::errors::ProtocolError;

/// An Updater's refresh callback failed to read, write or delete against its external system.
///
/// The error includes:
/// - The reason reported by the callback
/// - A chain of contexts describing when the error occurred
///
/// It is `Clone` because a single failure settles every caller waiting on the same request.
///
/// # Usage
///
/// ```rust
/// # use refresh_cache::errors::UpdaterError;
/// let err = UpdaterError::new("remote returned 503")
///     .context("writing key user/1")
///     .context("refresh cycle");
/// ```
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub struct UpdaterError {
    /// The reason for the failure.
    reason: String,

    /// A chain of contexts describing when the error occurred.
    /// Each context is added using the `context` method.
    when: Vec<String>,
}

impl UpdaterError {
    /// Create a new Updater failure from a description of what went wrong.
    pub fn new(reason: impl ToString) -> Self {
        UpdaterError {
            reason: reason.to_string(),
            when: vec![],
        }
    }

    /// Append a context to the error.
    ///
    /// This method can be used to build a chain of contexts describing
    /// when the error occurred.
    pub fn context(mut self, context: impl ToString) -> Self {
        self.when.push(context.to_string());
        self
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for UpdaterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "updater failed: {}", self.reason)?;

        if self.when.is_empty() {
            return Ok(());
        }

        write!(f, "; when: ({})", self.when.join("; "))
    }
}

/// Lets a refresh callback use `?` on [`Delegate::set_complete`](crate::Delegate::set_complete)
/// and [`Delegate::set_fail`](crate::Delegate::set_fail).
impl From<ProtocolError> for UpdaterError {
    fn from(err: ProtocolError) -> Self {
        UpdaterError::new(err)
    }
}
