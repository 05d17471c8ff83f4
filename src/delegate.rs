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

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use log::error;
use log::warn;

use crate::cache::CacheInner;
use crate::config::Equality;
use crate::errors::CacheError;
use crate::errors::ProtocolError;
use crate::errors::UpdaterError;
use crate::event_stream::EventSource;
use crate::token::Token;
use crate::token::TokenFuture;
use crate::token::TokenKind;
use crate::TypeConfig;

/// The requests queued for one refresh cycle of one Updater.
///
/// A read entry of `None` is an opportunistic read: nobody waits for it, but it still makes the
/// queue dirty. A real read for the same key upgrades it.
#[derive(Default)]
pub(crate) struct TokenQueue {
    reads: BTreeMap<String, Option<Token<()>>>,
    writes: BTreeMap<String, Token<()>>,
    deletes: BTreeMap<String, Token<()>>,
    update: Option<Token<()>>,
}

impl TokenQueue {
    pub(crate) fn is_dirty(&self) -> bool {
        !self.reads.is_empty()
            || !self.writes.is_empty()
            || !self.deletes.is_empty()
            || self.update.is_some()
    }

    pub(crate) fn read(&mut self, key: &str) -> TokenFuture<()> {
        self.reads
            .entry(key.to_string())
            .or_default()
            .get_or_insert_with(Token::new)
            .future()
    }

    pub(crate) fn opportunistic_read(&mut self, key: &str) {
        self.reads.entry(key.to_string()).or_default();
    }

    pub(crate) fn write(&mut self, key: &str) -> TokenFuture<()> {
        self.writes
            .entry(key.to_string())
            .or_insert_with(Token::new)
            .future()
    }

    pub(crate) fn delete(&mut self, key: &str) -> TokenFuture<()> {
        self.deletes
            .entry(key.to_string())
            .or_insert_with(Token::new)
            .future()
    }

    pub(crate) fn update(&mut self) -> TokenFuture<()> {
        self.update.get_or_insert_with(Token::new).future()
    }

    /// Settle `key` with write, read, delete precedence.
    ///
    /// Returns `false` if there is nothing outstanding for `key`.
    fn settle(&mut self, key: &str, res: Result<(), CacheError>) -> bool {
        let token = if let Some(t) = self.writes.remove(key) {
            Some(t)
        } else if let Some(t) = self.reads.remove(key) {
            // An opportunistic read has nobody to notify.
            t
        } else if let Some(t) = self.deletes.remove(key) {
            Some(t)
        } else {
            return false;
        };

        if let Some(t) = token {
            match res {
                Ok(()) => t.resolve(()),
                Err(e) => t.reject(e),
            }
        }
        true
    }

    /// Settle everything left at the end of a cycle.
    ///
    /// On success, leftover key requests fail as unsettled and the bare update request resolves.
    /// On failure, everything fails with the callback's error.
    pub(crate) fn finish(self, updater_id: &str, outcome: Result<(), UpdaterError>) {
        let err = match outcome {
            Ok(()) => {
                let unsettled = |key: String, kind: TokenKind| CacheError::Unsettled {
                    updater: updater_id.to_string(),
                    key,
                    kind,
                };

                for (key, t) in self.reads {
                    if let Some(t) = t {
                        t.reject(unsettled(key, TokenKind::Read));
                    }
                }
                for (key, t) in self.writes {
                    t.reject(unsettled(key, TokenKind::Write));
                }
                for (key, t) in self.deletes {
                    t.reject(unsettled(key, TokenKind::Delete));
                }
                if let Some(t) = self.update {
                    t.resolve(());
                }
                return;
            }
            Err(e) => CacheError::Updater(e),
        };

        self.close(err);
    }

    /// Fail every request with `err`.
    pub(crate) fn close(self, err: CacheError) {
        let tokens = self
            .reads
            .into_values()
            .flatten()
            .chain(self.writes.into_values())
            .chain(self.deletes.into_values())
            .chain(self.update);

        for t in tokens {
            t.reject(err.clone());
        }
    }

    fn keys<T>(m: &BTreeMap<String, T>) -> Vec<String> {
        m.keys().cloned().collect()
    }
}

/// The handle a refresh callback works through during one cycle.
///
/// It lists the requests queued for this cycle and writes results back into the cache.
/// Every request a callback neither completes nor fails is failed when the callback returns.
pub struct Delegate<C: TypeConfig> {
    cache: Arc<CacheInner<C>>,
    updater_id: String,
    equality: Option<Equality<C::Value>>,
    tokens: TokenQueue,
    heartbeat: bool,
}

impl<C> fmt::Display for Delegate<C>
where
    C: TypeConfig,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Delegate(Updater({}))", self.updater_id)
    }
}

impl<C> Delegate<C>
where
    C: TypeConfig,
{
    pub(crate) fn new(
        cache: Arc<CacheInner<C>>,
        updater_id: String,
        equality: Option<Equality<C::Value>>,
        tokens: TokenQueue,
    ) -> Self {
        let heartbeat = !tokens.is_dirty();
        Delegate {
            cache,
            updater_id,
            equality,
            tokens,
            heartbeat,
        }
    }

    pub fn updater_id(&self) -> &str {
        &self.updater_id
    }

    /// Whether this cycle was started by the interval timer with nothing queued.
    pub fn is_heartbeat(&self) -> bool {
        self.heartbeat
    }

    /// Keys waiting to be read, opportunistic reads included.
    pub fn read_requests(&self) -> Vec<String> {
        TokenQueue::keys(&self.tokens.reads)
    }

    /// Keys whose current store value should be persisted.
    pub fn write_requests(&self) -> Vec<String> {
        TokenQueue::keys(&self.tokens.writes)
    }

    /// Keys to delete from the external system.
    pub fn delete_requests(&self) -> Vec<String> {
        TokenQueue::keys(&self.tokens.deletes)
    }

    /// The current store value of `key`.
    pub fn get(&self, key: &str) -> Option<C::Value> {
        self.cache.data.lock().store.get(key)
    }

    /// Write `key` with the cache's default TTL. See [`Delegate::set_with_ttl`].
    pub fn set(&mut self, key: &str, value: C::Value) {
        self.write(key, value, None)
    }

    /// Write `key` into the cache and settle a read request for it.
    ///
    /// The key is routed to this Updater and the value is forwarded to the Backing,
    /// whether or not anyone asked for it.
    pub fn set_with_ttl(&mut self, key: &str, value: C::Value, ttl: Duration) {
        self.write(key, value, Some(ttl))
    }

    fn write(&mut self, key: &str, value: C::Value, ttl: Option<Duration>) {
        self.cache
            .write_from_updater(key, value, ttl, &self.updater_id, self.equality.as_ref());

        if let Some(Some(t)) = self.tokens.reads.remove(key) {
            t.resolve(());
        }
    }

    /// Delete `key` from the cache as this Updater and settle a delete request for it.
    pub fn del(&mut self, key: &str) {
        let fu = self
            .cache
            .delete_key(key, EventSource::Updater, Some(&self.updater_id));

        let name = format!("{}-del({})", self, key);
        let n = name.clone();
        C::spawn(
            async move {
                if let Err(e) = fu.await {
                    warn!("{}: failed: {}", n, e);
                }
            },
            name,
        );

        if let Some(t) = self.tokens.deletes.remove(key) {
            t.resolve(());
        }
    }

    /// Resolve the write, read or delete request for `key`, in that order of precedence.
    pub fn set_complete(&mut self, key: &str) -> Result<(), ProtocolError> {
        if self.tokens.settle(key, Ok(())) {
            if self.cache.config.debug {
                debug!("{}: completed {}", self, key);
            }
            return Ok(());
        }
        Err(self.protocol_error(key))
    }

    /// Reject the write, read or delete request for `key`, in that order of precedence.
    pub fn set_fail(&mut self, key: &str, err: UpdaterError) -> Result<(), ProtocolError> {
        let err = err.context(format!("Updater({}) key {}", self.updater_id, key));
        if self.tokens.settle(key, Err(CacheError::Updater(err))) {
            return Ok(());
        }
        Err(self.protocol_error(key))
    }

    fn protocol_error(&self, key: &str) -> ProtocolError {
        let err = ProtocolError::NoOutstandingToken {
            updater: self.updater_id.clone(),
            key: key.to_string(),
        };
        error!("{}: {}", self, err);
        err
    }

    /// End the cycle: settle whatever the callback left outstanding.
    pub(crate) fn complete(self, outcome: Result<(), UpdaterError>) {
        self.tokens.finish(&self.updater_id, outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_repeated_requests_share_a_token() {
        let mut q = TokenQueue::default();
        assert!(!q.is_dirty());

        let a = q.write("k");
        let b = q.write("k");
        assert!(q.is_dirty());
        assert_eq!(q.writes.len(), 1);

        assert!(q.settle("k", Ok(())));
        assert_eq!(a.await, Ok(()));
        assert_eq!(b.await, Ok(()));
    }

    #[tokio::test]
    async fn test_real_read_upgrades_opportunistic_read() {
        let mut q = TokenQueue::default();

        q.opportunistic_read("k");
        assert!(q.is_dirty());
        assert!(matches!(q.reads.get("k"), Some(None)));

        let fu = q.read("k");
        assert!(matches!(q.reads.get("k"), Some(Some(_))));

        // A second opportunistic read does not downgrade it.
        q.opportunistic_read("k");
        assert!(matches!(q.reads.get("k"), Some(Some(_))));

        assert!(q.settle("k", Ok(())));
        assert_eq!(fu.await, Ok(()));
    }

    #[tokio::test]
    async fn test_settle_precedence() {
        let mut q = TokenQueue::default();
        let r = q.read("k");
        let w = q.write("k");

        assert!(q.settle("k", Err(CacheError::NoUpdaters)));
        assert_eq!(w.await, Err(CacheError::NoUpdaters));

        assert!(q.settle("k", Ok(())));
        assert_eq!(r.await, Ok(()));

        assert!(!q.settle("k", Ok(())));
    }

    #[tokio::test]
    async fn test_finish_success_fails_leftovers() {
        let mut q = TokenQueue::default();
        let r = q.read("a");
        let d = q.delete("b");
        let u = q.update();
        q.opportunistic_read("c");

        q.finish("u1", Ok(()));

        assert_eq!(
            r.await,
            Err(CacheError::Unsettled {
                updater: "u1".to_string(),
                key: "a".to_string(),
                kind: TokenKind::Read,
            })
        );
        assert_eq!(
            d.await,
            Err(CacheError::Unsettled {
                updater: "u1".to_string(),
                key: "b".to_string(),
                kind: TokenKind::Delete,
            })
        );
        assert_eq!(u.await, Ok(()));
    }

    #[tokio::test]
    async fn test_finish_failure_rejects_everything() {
        let mut q = TokenQueue::default();
        let w = q.write("a");
        let u = q.update();

        let err = UpdaterError::new("boom");
        q.finish("u1", Err(err.clone()));

        assert_eq!(w.await, Err(CacheError::Updater(err.clone())));
        assert_eq!(u.await, Err(CacheError::Updater(err)));
    }
}
