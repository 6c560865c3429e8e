//! `BlessingStore` and its immutable/fixed wrappers (§4.B).

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::blessings::Blessings;
use crate::discharge::DischargeCache;
use crate::pattern::BlessingPattern;
use crate::SecurityError;

/// What a principal presents to peers: a mapping from peer pattern to the
/// blessing offered to peers matching that pattern, plus a default blessing
/// used when serving or when no pattern matches, plus the discharge cache.
pub trait BlessingStore: Send + Sync {
    /// Replace the blessing offered to peers matching `pattern`, returning
    /// whatever was previously stored there. An empty `blessings` removes
    /// the entry.
    fn set(&self, blessings: Blessings, pattern: BlessingPattern) -> crate::Result<Blessings>;

    /// The union of every stored blessing whose pattern matches any of
    /// `peer_blessing_names`, with the default entry unioned in last.
    /// Patterns are iterated in lexicographic order for deterministic
    /// output.
    fn for_peer(&self, peer_blessing_names: &[String]) -> Blessings;

    /// The blessing used when serving (no specific peer in mind).
    fn default_blessings(&self) -> Blessings;

    /// Replace the default blessing.
    fn set_default(&self, blessings: Blessings) -> crate::Result<()>;

    /// The discharge cache associated with this store.
    fn discharge_cache(&self) -> &DischargeCache;
}

/// The straightforward, mutable `BlessingStore` implementation: an
/// in-memory map guarded by a single read-write lock. Readers (`for_peer`,
/// `default_blessings`) proceed in parallel; mutators take the write half.
#[derive(Default)]
pub struct InMemoryBlessingStore {
    by_pattern: RwLock<BTreeMap<BlessingPattern, Blessings>>,
    default: RwLock<Blessings>,
    discharges: DischargeCache,
}

impl InMemoryBlessingStore {
    /// A new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Export every `(pattern, blessings)` entry plus the default blessing,
    /// for persistence (§4.L).
    pub fn export(&self) -> (Vec<(BlessingPattern, Blessings)>, Blessings) {
        let map = self.by_pattern.read().expect("blessing store lock poisoned");
        let entries = map.iter().map(|(p, b)| (p.clone(), b.clone())).collect();
        let default = self.default.read().expect("blessing store lock poisoned").clone();
        (entries, default)
    }

    /// Rebuild a store from entries previously produced by
    /// [`export`](Self::export). The discharge cache starts empty.
    pub fn import(entries: Vec<(BlessingPattern, Blessings)>, default: Blessings) -> Self {
        Self {
            by_pattern: RwLock::new(entries.into_iter().collect()),
            default: RwLock::new(default),
            discharges: DischargeCache::new(),
        }
    }
}

impl BlessingStore for InMemoryBlessingStore {
    fn set(&self, blessings: Blessings, pattern: BlessingPattern) -> crate::Result<Blessings> {
        let mut map = self.by_pattern.write().expect("blessing store lock poisoned");
        if blessings.is_empty() {
            Ok(map.remove(&pattern).unwrap_or_else(Blessings::empty))
        } else {
            Ok(map.insert(pattern, blessings).unwrap_or_else(Blessings::empty))
        }
    }

    fn for_peer(&self, peer_blessing_names: &[String]) -> Blessings {
        let map = self.by_pattern.read().expect("blessing store lock poisoned");
        let mut result = Blessings::empty();
        for (pattern, blessings) in map.iter() {
            if pattern.matches_any(peer_blessing_names.iter().map(String::as_str)) {
                result = result.union(blessings.clone());
            }
        }
        let default = self.default.read().expect("blessing store lock poisoned");
        result.union(default.clone())
    }

    fn default_blessings(&self) -> Blessings {
        self.default.read().expect("blessing store lock poisoned").clone()
    }

    fn set_default(&self, blessings: Blessings) -> crate::Result<()> {
        *self.default.write().expect("blessing store lock poisoned") = blessings;
        Ok(())
    }

    fn discharge_cache(&self) -> &DischargeCache {
        &self.discharges
    }
}

/// Wraps any `BlessingStore` so every mutating call fails with
/// [`SecurityError::ImmutableStore`], without changing what `for_peer` and
/// `default_blessings` return. Used to run a process with a narrower
/// authority than its key could otherwise carry.
pub struct ImmutableBlessingStore<S> {
    inner: S,
}

impl<S: BlessingStore> ImmutableBlessingStore<S> {
    /// Wrap `inner`, freezing it against further mutation.
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S: BlessingStore> BlessingStore for ImmutableBlessingStore<S> {
    fn set(&self, _blessings: Blessings, _pattern: BlessingPattern) -> crate::Result<Blessings> {
        Err(SecurityError::ImmutableStore)
    }

    fn for_peer(&self, peer_blessing_names: &[String]) -> Blessings {
        self.inner.for_peer(peer_blessing_names)
    }

    fn default_blessings(&self) -> Blessings {
        self.inner.default_blessings()
    }

    fn set_default(&self, _blessings: Blessings) -> crate::Result<()> {
        Err(SecurityError::ImmutableStore)
    }

    fn discharge_cache(&self) -> &DischargeCache {
        self.inner.discharge_cache()
    }
}

/// A store that returns one precomputed `Blessings` for every `for_peer` and
/// `default_blessings` call, and rejects all mutation. Used to hand a
/// subprocess a single fixed identity with no further delegation surface.
pub struct FixedBlessingStore {
    blessings: Blessings,
    discharges: DischargeCache,
}

impl FixedBlessingStore {
    /// Wrap a single, unchanging `Blessings` value.
    pub fn new(blessings: Blessings) -> Self {
        Self {
            blessings,
            discharges: DischargeCache::new(),
        }
    }
}

impl BlessingStore for FixedBlessingStore {
    fn set(&self, _blessings: Blessings, _pattern: BlessingPattern) -> crate::Result<Blessings> {
        Err(SecurityError::ImmutableStore)
    }

    fn for_peer(&self, _peer_blessing_names: &[String]) -> Blessings {
        self.blessings.clone()
    }

    fn default_blessings(&self) -> Blessings {
        self.blessings.clone()
    }

    fn set_default(&self, _blessings: Blessings) -> crate::Result<()> {
        Err(SecurityError::ImmutableStore)
    }

    fn discharge_cache(&self) -> &DischargeCache {
        &self.discharges
    }
}
