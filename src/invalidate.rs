//! Planning which cached results an edit invalidates.

use std::sync::Arc;

use rustc_hash::FxHashSet;
use tracing::{debug, trace};

use crate::cache::Indexes;
use crate::context::ExecutionContext;
use crate::graph::{DependencyGraph, Key, closure};
use crate::ir::{ModuleName, NodeId};

/// Which frames of a stack an invalidation applies to.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum StackSelector {
    /// Only the innermost frame.
    Top,
    /// Every frame.
    All,
}

/// What to drop from the selected frames' caches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Drop the given keys. Dynamic keys are resolved through the graph of
    /// each frame's module.
    InvalidateKeys(FxHashSet<Key>),
    /// Drop nodes that no longer exist.
    InvalidateStale(FxHashSet<NodeId>),
    InvalidateAll,
}

/// An instruction to evict cache entries of an execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheInvalidation {
    pub stack: StackSelector,
    pub command: Command,
    pub indexes: Indexes,
    /// The module whose graph produced the keys. Frames executing elsewhere
    /// resolve dynamic keys through their own module's graph.
    pub origin: Option<ModuleName>,
}

impl CacheInvalidation {
    pub fn new(stack: StackSelector, command: Command, indexes: Indexes) -> Self {
        Self { stack, command, indexes, origin: None }
    }

    /// Apply the invalidation to a context.
    ///
    /// `graph_of` provides the dependency graph of a module by name.
    pub fn apply(
        &self,
        ctx: &mut ExecutionContext,
        graph_of: &dyn Fn(&ModuleName) -> Option<Arc<DependencyGraph>>,
    ) {
        let id = ctx.id();
        let frames = match self.stack {
            StackSelector::All => ctx.stack_mut(),
            StackSelector::Top => {
                let len = ctx.stack().len();
                &mut ctx.stack_mut()[len.saturating_sub(1)..]
            }
        };

        for frame in frames {
            match &self.command {
                Command::InvalidateKeys(keys) => {
                    let mut ids: FxHashSet<NodeId> = keys.iter().filter_map(Key::as_node).collect();
                    let foreign =
                        frame.module.as_ref().filter(|m| Some(*m) != self.origin.as_ref());
                    if let Some(graph) = foreign.and_then(graph_of) {
                        let dynamic = keys.iter().filter(|k| k.as_node().is_none());
                        let reached = graph.transitive_dependents(dynamic);
                        ids.extend(reached.iter().filter_map(Key::as_node));
                    }
                    trace!(context = %id, nodes = ids.len(), "invalidating keys");
                    frame.cache.invalidate_indexes(&ids, self.indexes);
                }
                Command::InvalidateStale(ids) => {
                    frame.cache.invalidate_indexes(ids, self.indexes);
                }
                Command::InvalidateAll => {
                    frame.cache.invalidate_all_indexes(self.indexes);
                }
            }
        }
    }
}

/// The result of planning the invalidations for a recompiled module.
#[derive(Debug, Clone)]
pub struct Plan {
    /// The changed and stale keys.
    pub direct: FxHashSet<Key>,
    /// The direct keys and everything that transitively depends on them.
    pub invalidated: FxHashSet<Key>,
    pub commands: Vec<CacheInvalidation>,
}

impl Plan {
    /// Plan the invalidations of a module recompilation.
    ///
    /// `changed` are the nodes whose text was edited, `stale` the nodes that
    /// no longer exist. Dependents are followed through the old graph as well
    /// as the new one, so that dependents of removed nodes are reached.
    pub fn compute(
        module: &ModuleName,
        changed: &FxHashSet<NodeId>,
        stale: &FxHashSet<NodeId>,
        old: Option<&DependencyGraph>,
        new: &DependencyGraph,
    ) -> Self {
        let direct: FxHashSet<Key> =
            changed.iter().chain(stale).map(|&id| Key::node(id)).collect();
        let invalidated = closure(old.into_iter().chain([new]), &direct);

        debug!(
            module = %module,
            changed = changed.len(),
            stale = stale.len(),
            invalidated = invalidated.len(),
            "invalidation planned",
        );

        let commands = vec![
            CacheInvalidation {
                origin: Some(module.clone()),
                ..CacheInvalidation::new(
                    StackSelector::All,
                    Command::InvalidateKeys(invalidated.clone()),
                    Indexes::COMPUTED,
                )
            },
            CacheInvalidation {
                origin: Some(module.clone()),
                ..CacheInvalidation::new(
                    StackSelector::All,
                    Command::InvalidateStale(stale.clone()),
                    Indexes::ALL,
                )
            },
        ];

        Self { direct, invalidated, commands }
    }

    /// Apply every command to a context.
    pub fn apply(
        &self,
        ctx: &mut ExecutionContext,
        graph_of: &dyn Fn(&ModuleName) -> Option<Arc<DependencyGraph>>,
    ) {
        for command in &self.commands {
            command.apply(ctx, graph_of);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.invalidated.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextId, StackItem};
    use crate::ir::Symbol;
    use crate::value::{MethodPointer, TypeTag, Value};

    fn key(id: u64) -> Key {
        Key::node(NodeId(id))
    }

    fn ids(ids: &[u64]) -> FxHashSet<NodeId> {
        ids.iter().map(|&id| NodeId(id)).collect()
    }

    fn context(module: &str, cached: &[u64]) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(ContextId(0));
        ctx.push(StackItem::explicit(MethodPointer::new(module, module, "main"))).unwrap();
        for &id in cached {
            let ty = Some(TypeTag::new("Int"));
            ctx.stack_mut()[0].cache.put(NodeId(id), Value::Int(id as i64), ty, None, 1);
        }
        ctx
    }

    #[test]
    fn test_plan_invalidates_dependents_and_stale() {
        let mut graph = DependencyGraph::new();
        graph.insert(key(1), key(2));
        graph.insert(key(2), key(3));
        let plan = Plan::compute(&"Main".into(), &ids(&[3]), &ids(&[7]), None, &graph);
        assert_eq!(plan.invalidated, [1, 2, 3, 7].into_iter().map(key).collect::<FxHashSet<_>>());

        let mut ctx = context("Main", &[1, 2, 3, 4, 7]);
        let weights: rustc_hash::FxHashMap<_, _> =
            [(NodeId(4), 2), (NodeId(7), 2)].into_iter().collect();
        ctx.stack_mut()[0].cache.set_weights(&weights);
        plan.apply(&mut ctx, &|_| None);
        let cache = &ctx.stack()[0].cache;
        assert!([1, 2, 3, 7].iter().all(|&id| cache.get(NodeId(id)).is_none()));
        assert_eq!(cache.get(NodeId(4)).unwrap().value, Value::Int(4));
        assert_eq!(cache.weight(NodeId(4)), 2);
        assert_eq!(cache.weight(NodeId(7)), 0);
    }

    #[test]
    fn test_plan_follows_old_graph_for_removed_nodes() {
        let mut old = DependencyGraph::new();
        old.insert(key(1), key(5));
        let new = DependencyGraph::new();
        let plan = Plan::compute(&"Main".into(), &ids(&[]), &ids(&[5]), Some(&old), &new);
        assert!(plan.invalidated.contains(&key(1)));
    }

    #[test]
    fn test_dynamic_keys_reach_other_modules() {
        // `Main` uses `helper` from `Lib` at node 11, feeding node 10.
        let mut main_graph = DependencyGraph::new();
        main_graph.insert(key(11), Key::symbol(Symbol::new("helper")));
        main_graph.insert(key(10), key(11));
        let main_graph = Arc::new(main_graph);

        let mut lib_graph = DependencyGraph::new();
        lib_graph.insert(key(1), key(2));
        lib_graph.insert(Key::symbol(Symbol::new("helper")), key(1));

        let plan = Plan::compute(&"Lib".into(), &ids(&[2]), &ids(&[]), None, &lib_graph);
        let mut ctx = context("Main", &[10, 11, 12]);
        plan.apply(&mut ctx, &|m| (m.as_str() == "Main").then(|| main_graph.clone()));
        let cache = &ctx.stack()[0].cache;
        assert!(cache.get(NodeId(10)).is_none());
        assert!(cache.get(NodeId(11)).is_none());
        assert!(cache.get(NodeId(12)).is_some());
    }

    #[test]
    fn test_top_selector_only_touches_innermost_frame() {
        let mut ctx = context("Main", &[1]);
        ctx.push(StackItem::local(NodeId(1))).unwrap();
        ctx.stack_mut()[1].cache.put(NodeId(1), Value::Unit, None, None, 1);
        let invalidation =
            CacheInvalidation::new(StackSelector::Top, Command::InvalidateAll, Indexes::COMPUTED);
        invalidation.apply(&mut ctx, &|_| None);
        assert!(ctx.stack()[0].cache.get(NodeId(1)).is_some());
        assert!(ctx.stack()[1].cache.get(NodeId(1)).is_none());
    }
}
