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

use futures::future::BoxFuture;
use futures::future::Shared;
use futures::FutureExt;
use tokio::sync::oneshot;

use crate::errors::CacheError;

/// A future every caller waiting on the same pending request can hold a clone of.
pub type TokenFuture<T> = Shared<BoxFuture<'static, Result<T, CacheError>>>;

/// The kind of a pending request queued in a [`Delegate`](crate::Delegate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Read,
    Write,
    Delete,
    /// A bare request to run the refresh cycle.
    Update,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TokenKind::Read => write!(f, "read"),
            TokenKind::Write => write!(f, "write"),
            TokenKind::Delete => write!(f, "delete"),
            TokenKind::Update => write!(f, "update"),
        }
    }
}

/// The settling end of one pending request.
///
/// Consuming `resolve()`/`reject()` makes double settlement impossible. A token dropped
/// without being settled settles its waiters with [`CacheError::Closed`].
pub(crate) struct Token<T>
where
    T: Clone + Send + Sync + 'static,
{
    tx: oneshot::Sender<Result<T, CacheError>>,
    fu: TokenFuture<T>,
}

impl<T> Token<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        let (tx, rx) = oneshot::channel::<Result<T, CacheError>>();

        let fu = async move {
            match rx.await {
                Ok(res) => res,
                Err(_) => Err(CacheError::Closed(
                    "request dropped before it was settled".to_string(),
                )),
            }
        }
        .boxed()
        .shared();

        Token { tx, fu }
    }

    pub(crate) fn future(&self) -> TokenFuture<T> {
        self.fu.clone()
    }

    pub(crate) fn resolve(self, value: T) {
        self.tx.send(Ok(value)).ok();
    }

    pub(crate) fn reject(self, err: CacheError) {
        self.tx.send(Err(err)).ok();
    }
}

/// A future that is already settled, for requests refused before they were queued.
pub(crate) fn settled<T>(res: Result<T, CacheError>) -> TokenFuture<T>
where
    T: Clone + Send + Sync + 'static,
{
    futures::future::ready(res).boxed().shared()
}
