//! Incremental execution with precise cache invalidation.
//!
//! A [`Runtime`] keeps the modules of a program and a set of execution
//! contexts. Each context holds a stack of frames: an explicit entry point at
//! the bottom and, above it, calls made by expressions of the frame below.
//! Every frame caches the values, types and call-targets of the expressions
//! it evaluated.
//!
//! When a file is edited, its module is recompiled and a dependency graph is
//! built from the new IR. The nodes the edit touched, together with the nodes
//! that no longer exist, are followed through the graph to everything that
//! depends on them, and exactly those entries are evicted from the caches of
//! the contexts using the module. The next run then serves everything else
//! from the caches:
//!
//! ```
//! use retrace::{DependencyGraph, Key, NodeId, Plan};
//!
//! // 1 depends on 2, 2 depends on 3.
//! let mut graph = DependencyGraph::new();
//! graph.insert(Key::node(NodeId(1)), Key::node(NodeId(2)));
//! graph.insert(Key::node(NodeId(2)), Key::node(NodeId(3)));
//!
//! let changed = [NodeId(3)].into_iter().collect();
//! let plan = Plan::compute(&"Main".into(), &changed, &Default::default(), None, &graph);
//! assert_eq!(plan.invalidated.len(), 3);
//! ```
//!
//! The runtime talks to three collaborators: a [`Compiler`] turning sources
//! into [`ModuleIr`], a [`Substrate`] executing calls, and a [`SymbolIndex`]
//! receiving the public symbols of compiled modules. Everything a client may
//! want to observe is sent to a [`Sink`] as a [`Notification`].

mod cache;
mod changeset;
mod config;
mod context;
mod engine;
mod error;
mod graph;
mod hash;
mod index;
mod invalidate;
mod ir;
mod jobs;
mod lock;
mod module;
mod notify;
mod preference;
mod runtime;
mod scheduler;
mod symbols;
mod value;

pub use crate::cache::{CacheEntry, Indexes, MethodCallsCache, RuntimeCache};
pub use crate::changeset::{Changeset, TextEdit};
pub use crate::config::Config;
pub use crate::context::{
    ContextId, Contexts, ExecutionContext, Frame, StackItem, Visualization, VisualizationId,
};
pub use crate::engine::{CallObserver, ComputedValue, Engine, Outcome, Substrate, Unobserved};
pub use crate::error::{Error, Raised, Result};
pub use crate::graph::{DependencyGraph, Key, closure};
pub use crate::index::{
    ExportUpdate, IndexAction, IndexUpdate, NoIndex, Suggestion, SuggestionUpdate, SymbolIndex,
};
pub use crate::invalidate::{CacheInvalidation, Command, Plan, StackSelector};
pub use crate::ir::{
    Expr, ExprKind, ExternalId, Method, ModuleIr, ModuleName, NodeId, NodeInfo, Symbol, Weight,
};
pub use crate::lock::Locks;
pub use crate::module::{CompilationStage, Compiled, Compiler, Module, Modules, Snapshot};
pub use crate::notify::{Diagnostic, Discard, Notification, Severity, Sink, ValueUpdate};
pub use crate::preference::{ALWAYS, analyze as preferences};
pub use crate::runtime::{Collaborators, Invalidate, Runtime};
pub use crate::scheduler::{Footprint, Job, JobHandle, JobStatus, Scheduler};
pub use crate::symbols::{Definition, SymbolTable};
pub use crate::value::{FunctionCall, MethodCall, MethodPointer, TypeTag, Value};
