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

use crate::errors::BackingError;
use crate::errors::ConfigError;
use crate::errors::UpdaterError;
use crate::token::TokenKind;

/// Errors returned to callers of the cache's data path.
///
/// A plain miss is never an error: it resolves to `None`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("{0}")]
    Updater(#[from] UpdaterError),

    #[error("{0}")]
    Backing(#[from] BackingError),

    #[error("{kind} request for key {key} was not settled by Updater({updater})")]
    Unsettled {
        updater: String,
        key: String,
        kind: TokenKind,
    },

    #[error("Updater({0}) is shut down")]
    Shutdown(String),

    #[error("no Updaters registered")]
    NoUpdaters,

    #[error("Updater id {0} is not known")]
    UnknownUpdater(String),

    #[error("invalid options: {0}")]
    Config(#[from] ConfigError),

    #[error("closed: {0}")]
    Closed(String),
}

impl CacheError {
    pub fn context(self, context: impl fmt::Display) -> Self {
        match self {
            Self::Updater(e) => Self::Updater(e.context(context)),
            Self::Backing(e) => Self::Backing(e.context(context)),
            other => other,
        }
    }

    /// Whether the error came from a collaborator rather than from the cache itself.
    pub fn is_collaborator_failure(&self) -> bool {
        matches!(self, Self::Updater(_) | Self::Backing(_) | Self::Unsettled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_reaches_collaborator_errors() {
        let err = CacheError::from(UpdaterError::new("timeout")).context("get_data(k1)");
        assert_eq!(err.to_string(), "updater failed: timeout; when: (get_data(k1))");

        let err = CacheError::NoUpdaters.context("run_updaters");
        assert_eq!(err, CacheError::NoUpdaters);
    }

    #[test]
    fn test_unsettled_display() {
        let err = CacheError::Unsettled {
            updater: "u1".to_string(),
            key: "k1".to_string(),
            kind: TokenKind::Write,
        };
        assert_eq!(
            err.to_string(),
            "write request for key k1 was not settled by Updater(u1)"
        );
        assert!(err.is_collaborator_failure());
        assert!(!CacheError::Shutdown("u1".to_string()).is_collaborator_failure());
    }
}
