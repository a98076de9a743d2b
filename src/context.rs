//! Execution contexts: client sessions holding a stack of frames.

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashSet;

use crate::cache::RuntimeCache;
use crate::error::{Error, Result};
use crate::ir::{ModuleName, NodeId};
use crate::value::{FunctionCall, MethodPointer, Value};

/// Identifies an execution context.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ContextId(pub u64);

impl Display for ContextId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Identifies a visualization.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VisualizationId(pub u64);

impl Display for VisualizationId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "vis-{}", self.0)
    }
}

/// An entry of an execution stack as requested by a client.
#[derive(Debug, Clone, PartialEq)]
pub enum StackItem {
    /// An explicit entry point. Only valid at the bottom of a stack.
    Explicit { method: MethodPointer, args: Vec<Value> },
    /// Re-entry into the call an expression of the frame below made.
    Local { expression_id: NodeId },
}

impl StackItem {
    pub fn explicit(method: MethodPointer) -> Self {
        Self::Explicit { method, args: vec![] }
    }

    pub fn local(expression_id: NodeId) -> Self {
        Self::Local { expression_id }
    }
}

/// One entry of an execution stack with its own cache.
#[derive(Debug, Clone)]
pub struct Frame {
    pub item: StackItem,
    pub cache: RuntimeCache,
    /// The module the frame executed in during the last run.
    pub module: Option<ModuleName>,
    /// Which compilation of which module the cache weights were taken from.
    pub weights_of: Option<(ModuleName, u64)>,
}

impl Frame {
    pub fn new(item: StackItem) -> Self {
        let module = match &item {
            StackItem::Explicit { method, .. } => Some(method.module.clone()),
            StackItem::Local { .. } => None,
        };
        Self { item, cache: RuntimeCache::new(), module, weights_of: None }
    }

    /// The call that enters the frame, if it is a root frame.
    pub fn root_call(&self) -> Option<FunctionCall> {
        match &self.item {
            StackItem::Explicit { method, args } => {
                Some(FunctionCall::new(method.clone(), args.clone()))
            }
            StackItem::Local { .. } => None,
        }
    }

    pub fn expression_id(&self) -> Option<NodeId> {
        match self.item {
            StackItem::Local { expression_id } => Some(expression_id),
            StackItem::Explicit { .. } => None,
        }
    }
}

/// A subscription evaluating a method on the value of an expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Visualization {
    pub id: VisualizationId,
    pub expression_id: NodeId,
    /// Called with the expression's value followed by `args`.
    pub method: MethodPointer,
    pub args: Vec<Value>,
}

impl Visualization {
    /// The call evaluating the visualization for a value.
    pub fn call(&self, value: Value) -> FunctionCall {
        let args = std::iter::once(value).chain(self.args.iter().cloned()).collect();
        FunctionCall::new(self.method.clone(), args)
    }
}

/// A client session: a stack of frames plus visualizations.
#[derive(Debug)]
pub struct ExecutionContext {
    id: ContextId,
    stack: Vec<Frame>,
    visualizations: IndexMap<VisualizationId, Visualization>,
    reachable: usize,
}

impl ExecutionContext {
    pub fn new(id: ContextId) -> Self {
        Self { id, stack: vec![], visualizations: IndexMap::new(), reachable: 0 }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn stack(&self) -> &[Frame] {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut [Frame] {
        &mut self.stack
    }

    /// The frames and the visualizations, borrowed independently.
    pub fn split_mut(&mut self) -> (&mut [Frame], &IndexMap<VisualizationId, Visualization>) {
        (&mut self.stack, &self.visualizations)
    }

    /// Push a frame. The bottom frame must be explicit, all others local.
    pub fn push(&mut self, item: StackItem) -> Result<()> {
        match (&item, self.stack.is_empty()) {
            (StackItem::Explicit { .. }, false) => {
                return Err(Error::InvalidStackItem("explicit call above the root frame"));
            }
            (StackItem::Local { .. }, true) => {
                return Err(Error::InvalidStackItem("local call as the root frame"));
            }
            _ => {}
        }
        self.stack.push(Frame::new(item));
        Ok(())
    }

    /// Pop the top frame, dropping its cache.
    pub fn pop(&mut self) -> Result<Frame> {
        self.stack.pop().ok_or(Error::EmptyStack(self.id))
    }

    /// How many frames the last run could enter. Frames beyond are not
    /// displayed until the client pushes them again.
    pub fn reachable(&self) -> usize {
        self.reachable.min(self.stack.len())
    }

    pub fn set_reachable(&mut self, depth: usize) {
        self.reachable = depth;
    }

    pub fn visualizations(&self) -> &IndexMap<VisualizationId, Visualization> {
        &self.visualizations
    }

    pub fn attach(&mut self, visualization: Visualization) {
        self.visualizations.insert(visualization.id, visualization);
    }

    /// Replace the method and arguments of a visualization.
    pub fn modify(
        &mut self,
        id: VisualizationId,
        method: MethodPointer,
        args: Vec<Value>,
    ) -> Result<&Visualization> {
        let visualization =
            self.visualizations.get_mut(&id).ok_or(Error::VisualizationNotFound(id))?;
        visualization.method = method;
        visualization.args = args;
        Ok(visualization)
    }

    pub fn detach(&mut self, id: VisualizationId) -> Result<Visualization> {
        self.visualizations.shift_remove(&id).ok_or(Error::VisualizationNotFound(id))
    }

    /// The modules the context's frames execute in or call into.
    pub fn modules(&self) -> FxHashSet<ModuleName> {
        let mut modules = FxHashSet::default();
        for frame in &self.stack {
            modules.extend(frame.module.iter().cloned());
            modules.extend(frame.cache.call_modules().into_iter().cloned());
        }
        modules
    }

    /// Whether a change of the module can affect this context.
    pub fn references(&self, module: &ModuleName) -> bool {
        self.stack.iter().any(|frame| {
            frame.module.as_ref() == Some(module)
                || frame.cache.call_modules().contains(module)
        })
    }

    /// The most recent cached value of a node in any frame, innermost first.
    pub fn cached_value(&self, node: NodeId) -> Option<Value> {
        self.stack.iter().rev().find_map(|frame| frame.cache.value(node).cloned())
    }
}

/// All open execution contexts.
#[derive(Default)]
pub struct Contexts {
    map: RwLock<IndexMap<ContextId, Arc<Mutex<ExecutionContext>>>>,
    next_context: AtomicU64,
    next_visualization: AtomicU64,
}

impl Contexts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self) -> ContextId {
        let id = ContextId(self.next_context.fetch_add(1, Ordering::SeqCst));
        self.map.write().insert(id, Arc::new(Mutex::new(ExecutionContext::new(id))));
        id
    }

    /// Remove a context, releasing all frames' caches.
    pub fn destroy(&self, id: ContextId) -> Result<()> {
        self.map.write().shift_remove(&id).map(drop).ok_or(Error::ContextNotFound(id))
    }

    pub fn get(&self, id: ContextId) -> Result<Arc<Mutex<ExecutionContext>>> {
        self.map.read().get(&id).cloned().ok_or(Error::ContextNotFound(id))
    }

    /// All contexts in creation order.
    pub fn all(&self) -> Vec<Arc<Mutex<ExecutionContext>>> {
        self.map.read().values().cloned().collect()
    }

    pub fn next_visualization_id(&self) -> VisualizationId {
        VisualizationId(self.next_visualization.fetch_add(1, Ordering::SeqCst))
    }
}
