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

/// The durable store behind a [`Backing`](crate::Backing) failed, or did not have a requested key.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub struct BackingError {
    reason: String,
    when: Vec<String>,
}

impl BackingError {
    pub fn new(reason: impl ToString) -> Self {
        BackingError {
            reason: reason.to_string(),
            when: vec![],
        }
    }

    /// The read callback finished without supplying `key`.
    pub fn not_found(key: &str) -> Self {
        BackingError::new(format!("key {} not found", key))
    }

    pub fn context(mut self, context: impl ToString) -> Self {
        self.when.push(context.to_string());
        self
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for BackingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "backing failed: {}", self.reason)?;

        if self.when.is_empty() {
            return Ok(());
        }

        write!(f, "; when: ({})", self.when.join("; "))
    }
}
