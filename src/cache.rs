//! Per-frame caches of previously computed results.

use std::fmt::{self, Debug, Formatter};
use std::ops::BitOr;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ir::{ModuleName, NodeId, Weight};
use crate::value::{MethodCall, TypeTag, Value};

/// Selects the sub-indices of a [`RuntimeCache`] an operation touches.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Indexes(u8);

impl Indexes {
    pub const NONE: Self = Self(0);
    pub const VALUES: Self = Self(1);
    pub const TYPES: Self = Self(1 << 1);
    pub const CALLS: Self = Self(1 << 2);
    pub const WEIGHTS: Self = Self(1 << 3);
    /// Values, types and call-targets. What an edit invalidates.
    pub const COMPUTED: Self = Self(Self::VALUES.0 | Self::TYPES.0 | Self::CALLS.0);
    pub const ALL: Self = Self(Self::COMPUTED.0 | Self::WEIGHTS.0);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Indexes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Debug for Indexes {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let names = [
            (Self::VALUES, "values"),
            (Self::TYPES, "types"),
            (Self::CALLS, "calls"),
            (Self::WEIGHTS, "weights"),
        ];
        f.debug_set()
            .entries(names.iter().filter(|(i, _)| self.contains(*i)).map(|(_, n)| n))
            .finish()
    }
}

/// A cached result.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: Value,
    pub ty: Option<TypeTag>,
    pub call: Option<MethodCall>,
    pub weight: Weight,
}

/// The results of one stack frame, keyed by the node that produced them.
///
/// Values, types, call-targets and weights live in separate stores so that
/// invalidations can target a subset of them. Weights are hints for
/// [`shrink`](Self::shrink) and are only touched when explicitly selected.
#[derive(Debug, Clone, Default)]
pub struct RuntimeCache {
    values: FxHashMap<NodeId, Value>,
    types: FxHashMap<NodeId, TypeTag>,
    calls: FxHashMap<NodeId, MethodCall>,
    weights: FxHashMap<NodeId, Weight>,
}

impl RuntimeCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a cached value together with what is known about it.
    pub fn get(&self, id: NodeId) -> Option<CacheEntry> {
        let value = self.values.get(&id)?;
        Some(CacheEntry {
            value: value.clone(),
            ty: self.types.get(&id).cloned(),
            call: self.calls.get(&id).cloned(),
            weight: self.weight(id),
        })
    }

    /// Look up only the cached value.
    pub fn value(&self, id: NodeId) -> Option<&Value> {
        self.values.get(&id)
    }

    pub fn ty(&self, id: NodeId) -> Option<&TypeTag> {
        self.types.get(&id)
    }

    pub fn call(&self, id: NodeId) -> Option<&MethodCall> {
        self.calls.get(&id)
    }

    pub fn weight(&self, id: NodeId) -> Weight {
        self.weights.get(&id).copied().unwrap_or_default()
    }

    /// Store a result.
    pub fn put(
        &mut self,
        id: NodeId,
        value: Value,
        ty: Option<TypeTag>,
        call: Option<MethodCall>,
        weight: Weight,
    ) {
        self.values.insert(id, value);
        self.weights.insert(id, weight);
        self.record(id, ty, call);
    }

    /// Store what is known about a result without keeping the value itself.
    pub fn record(&mut self, id: NodeId, ty: Option<TypeTag>, call: Option<MethodCall>) {
        match ty {
            Some(ty) => self.types.insert(id, ty),
            None => self.types.remove(&id),
        };
        match call {
            Some(call) => self.calls.insert(id, call),
            None => self.calls.remove(&id),
        };
    }

    /// Drop the computed results of the given nodes. Ids that are not cached
    /// are ignored.
    pub fn invalidate<'a>(&mut self, ids: impl IntoIterator<Item = &'a NodeId>) {
        self.invalidate_indexes(ids, Indexes::COMPUTED);
    }

    /// Drop the given nodes from the selected stores.
    pub fn invalidate_indexes<'a>(
        &mut self,
        ids: impl IntoIterator<Item = &'a NodeId>,
        indexes: Indexes,
    ) {
        for id in ids {
            if indexes.contains(Indexes::VALUES) {
                self.values.remove(id);
            }
            if indexes.contains(Indexes::TYPES) {
                self.types.remove(id);
            }
            if indexes.contains(Indexes::CALLS) {
                self.calls.remove(id);
            }
            if indexes.contains(Indexes::WEIGHTS) {
                self.weights.remove(id);
            }
        }
    }

    /// Drop all computed results. Weights are kept.
    pub fn invalidate_all(&mut self) {
        self.invalidate_all_indexes(Indexes::COMPUTED);
    }

    /// Clear the selected stores.
    pub fn invalidate_all_indexes(&mut self, indexes: Indexes) {
        if indexes.contains(Indexes::VALUES) {
            self.values.clear();
        }
        if indexes.contains(Indexes::TYPES) {
            self.types.clear();
        }
        if indexes.contains(Indexes::CALLS) {
            self.calls.clear();
        }
        if indexes.contains(Indexes::WEIGHTS) {
            self.weights.clear();
        }
    }

    /// Replace the weights with the ones computed for a module.
    pub fn set_weights(&mut self, weights: &FxHashMap<NodeId, Weight>) {
        self.weights.clone_from(weights);
    }

    /// Evict values until at most `capacity` remain, dropping the lightest
    /// ones first. Types and call-targets are kept.
    pub fn shrink(&mut self, capacity: usize) -> usize {
        let excess = self.values.len().saturating_sub(capacity);
        if excess == 0 {
            return 0;
        }

        let mut ids: Vec<NodeId> = self.values.keys().copied().collect();
        ids.sort_by_key(|&id| (self.weight(id), id));
        for id in &ids[..excess] {
            self.values.remove(id);
        }
        excess
    }

    /// The nodes that have a cached call-target.
    pub fn called(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.calls.keys().copied()
    }

    /// The modules that cached call-targets point into.
    pub fn call_modules(&self) -> FxHashSet<&ModuleName> {
        self.calls.values().map(|call| &call.method.module).collect()
    }

    /// The number of cached values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.types.is_empty() && self.calls.is_empty()
    }
}

/// Records which calls were executed during one run.
///
/// Whatever has a cached call-target but was not executed remained valid and
/// was skipped; those calls are reported from the cache instead.
#[derive(Debug, Clone, Default)]
pub struct MethodCallsCache {
    executed: FxHashSet<NodeId>,
}

impl MethodCallsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a call as executed. Returns false if it already was.
    pub fn set_executed(&mut self, id: NodeId) -> bool {
        self.executed.insert(id)
    }

    pub fn is_executed(&self, id: NodeId) -> bool {
        self.executed.contains(&id)
    }

    /// The calls with a cached call-target that were not executed, in id
    /// order.
    pub fn not_executed(&self, cache: &RuntimeCache) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> =
            cache.called().filter(|&id| !self.is_executed(id)).collect();
        ids.sort();
        ids
    }
}
