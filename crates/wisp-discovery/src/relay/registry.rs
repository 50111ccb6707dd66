//! Alias and request-id bookkeeping.
//!
//! One relay connection multiplexes many sockets, servers, queries and
//! in-flight requests. Each is named by a `u32` that is unique among the live
//! entries of its table. Both sides allocate from their own parity so an
//! alias never needs to say which side created it: the endpoint hands out
//! even aliases, the relay odd ones.

use dashmap::DashMap;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::hash::Hash;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::oneshot;
use wisp_crypto::PublicKey;

/// Key of a pending connect: endpoint alias plus the peer it targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    /// Endpoint socket alias
    pub alias: u32,
    /// Remote public key
    pub public_key: PublicKey,
}

impl ConnectionKey {
    /// Key for `alias` connecting to `public_key`
    #[must_use]
    pub fn new(alias: u32, public_key: PublicKey) -> Self {
        Self { alias, public_key }
    }
}

/// Table of live entries owned by one dispatch task
#[derive(Debug)]
pub struct Registry<K, V> {
    entries: HashMap<K, V>,
}

impl<K: Eq + Hash, V> Registry<K, V> {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Insert `value`, returning the entry it replaced
    pub fn add(&mut self, key: K, value: V) -> Option<V> {
        self.entries.insert(key, value)
    }

    /// Insert `value` unless `key` is taken
    ///
    /// # Errors
    ///
    /// Returns `value` back when the key is live.
    pub fn try_add(&mut self, key: K, value: V) -> Result<&mut V, V> {
        match self.entries.entry(key) {
            Entry::Occupied(_) => Err(value),
            Entry::Vacant(entry) => Ok(entry.insert(value)),
        }
    }

    /// Entry for `key`
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Mutable entry for `key`
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key)
    }

    /// Whether `key` is live
    #[must_use]
    pub fn has(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove and return the entry for `key`
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key)
    }

    /// First live entry matching `predicate`
    pub fn find(&self, mut predicate: impl FnMut(&K, &V) -> bool) -> Option<(&K, &V)> {
        self.entries.iter().find(|(k, v)| predicate(k, v))
    }

    /// Keep only entries matching `keep`
    pub fn retain(&mut self, keep: impl FnMut(&K, &mut V) -> bool) {
        self.entries.retain(keep);
    }

    /// Live keys
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    /// Live values
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values()
    }

    /// Remove every entry, for bulk teardown
    pub fn drain(&mut self) -> impl Iterator<Item = (K, V)> + '_ {
        self.entries.drain()
    }

    /// Number of live entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entry is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Eq + Hash, V> Default for Registry<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Which side of the relay link allocates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    /// 1, 3, 5, ...
    Odd,
    /// 2, 4, 6, ...
    Even,
}

/// Allocates aliases of one parity.
///
/// Wraps around at `u32::MAX`, never yields zero and skips aliases the owner
/// still has live.
#[derive(Debug)]
pub struct AliasGenerator {
    next: AtomicU32,
}

impl AliasGenerator {
    /// Generator starting at the first alias of `parity`
    #[must_use]
    pub fn new(parity: Parity) -> Self {
        let seed = match parity {
            Parity::Odd => 1,
            Parity::Even => 2,
        };
        Self {
            next: AtomicU32::new(seed),
        }
    }

    /// Generator for the relay side
    #[must_use]
    pub fn relay() -> Self {
        Self::new(Parity::Odd)
    }

    /// Generator for the endpoint side
    #[must_use]
    pub fn endpoint() -> Self {
        Self::new(Parity::Even)
    }

    /// Next alias for which `is_live` is false
    pub fn next(&self, is_live: impl Fn(u32) -> bool) -> u32 {
        // Half the space has our parity; after that every alias is live and
        // the caller overwrites.
        let mut candidate = 0;
        for _ in 0..=u32::MAX / 2 {
            candidate = self.next.fetch_add(2, Ordering::Relaxed);
            if candidate != 0 && !is_live(candidate) {
                return candidate;
            }
        }
        candidate
    }
}

/// Allocates request ids (handshakes, firewall and signature requests, queries)
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU32,
}

impl IdGenerator {
    /// Generator starting at 1
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    /// Next non-zero id
    pub fn next(&self) -> u32 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Next non-zero id for which `is_live` is false
    pub fn next_free(&self, is_live: impl Fn(u32) -> bool) -> u32 {
        let mut id = self.next();
        for _ in 0..u32::MAX {
            if !is_live(id) {
                break;
            }
            id = self.next();
        }
        id
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Requests waiting for one answer each, correlated by id
#[derive(Debug)]
pub struct PendingRequests<T> {
    waiters: DashMap<u32, oneshot::Sender<T>>,
    ids: IdGenerator,
}

impl<T> PendingRequests<T> {
    /// Empty table
    #[must_use]
    pub fn new() -> Self {
        Self {
            waiters: DashMap::new(),
            ids: IdGenerator::new(),
        }
    }

    /// Allocate an id and the receiver its answer arrives on
    pub fn register(&self) -> (u32, oneshot::Receiver<T>) {
        let id = self.ids.next_free(|id| self.waiters.contains_key(&id));
        (id, self.insert(id))
    }

    /// Wait on an id allocated elsewhere, replacing any earlier waiter
    pub fn insert(&self, id: u32) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);
        rx
    }

    /// Deliver the answer for `id`; false if nobody waits on it
    pub fn resolve(&self, id: u32, value: T) -> bool {
        match self.waiters.remove(&id) {
            Some((_, tx)) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Drop the waiter for `id`; its receiver sees the sender gone
    pub fn cancel(&self, id: u32) -> bool {
        self.waiters.remove(&id).is_some()
    }

    /// Drop every waiter
    pub fn cancel_all(&self) {
        self.waiters.clear();
    }

    /// Whether `id` has a waiter
    #[must_use]
    pub fn is_pending(&self, id: u32) -> bool {
        self.waiters.contains_key(&id)
    }

    /// Number of waiters
    #[must_use]
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Whether nobody waits
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self::new()
    }
}
