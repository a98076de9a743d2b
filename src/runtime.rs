//! The request surface tying modules, contexts and jobs together.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::cache::Indexes;
use crate::changeset::TextEdit;
use crate::config::Config;
use crate::context::{
    ContextId, Contexts, ExecutionContext, StackItem, Visualization, VisualizationId,
};
use crate::engine::{Engine, Substrate};
use crate::error::{Error, Result};
use crate::graph::Key;
use crate::index::{NoIndex, SymbolIndex};
use crate::invalidate::{CacheInvalidation, Command, StackSelector};
use crate::ir::{ModuleName, NodeId};
use crate::jobs::{CompileFiles, CompileStack, ExecuteContext};
use crate::lock::Locks;
use crate::module::{Compiler, Module, Modules};
use crate::notify::Sink;
use crate::scheduler::{JobHandle, Scheduler};
use crate::value::{MethodPointer, Value};

/// The services a runtime builds on.
#[derive(Clone)]
pub struct Collaborators {
    pub compiler: Arc<dyn Compiler>,
    pub substrate: Arc<dyn Substrate>,
    pub index: Arc<dyn SymbolIndex>,
    pub sink: Arc<dyn Sink>,
}

impl Collaborators {
    pub fn new(
        compiler: impl Compiler + 'static,
        substrate: impl Substrate + 'static,
        sink: impl Sink + 'static,
    ) -> Self {
        Self {
            compiler: Arc::new(compiler),
            substrate: Arc::new(substrate),
            index: Arc::new(NoIndex),
            sink: Arc::new(sink),
        }
    }

    pub fn with_index(mut self, index: impl SymbolIndex + 'static) -> Self {
        self.index = Arc::new(index);
        self
    }
}

/// What a recompute request drops before executing again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidate {
    All,
    Expressions(Vec<NodeId>),
}

/// Everything jobs share.
pub(crate) struct Env {
    pub config: Config,
    pub compiler: Arc<dyn Compiler>,
    pub substrate: Arc<dyn Substrate>,
    pub index: Arc<dyn SymbolIndex>,
    pub sink: Arc<dyn Sink>,
    pub modules: Modules,
    pub contexts: Contexts,
    pub locks: Locks,
}

impl Env {
    pub fn engine(&self) -> Engine<'_> {
        Engine::new(&*self.substrate, &self.modules, &*self.sink, &self.config)
    }
}

/// An incremental execution runtime.
///
/// Requests are answered right away. Compilation and execution happen on the
/// runtime's workers and report back through the notification sink.
pub struct Runtime {
    scheduler: Scheduler<Env>,
}

impl Runtime {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let Collaborators { compiler, substrate, index, sink } = collaborators;
        let workers = config.workers;
        let env = Env {
            config,
            compiler,
            substrate,
            index,
            sink,
            modules: Modules::new(),
            contexts: Contexts::new(),
            locks: Locks::new(),
        };
        info!(workers = workers.get(), "runtime started");
        Self { scheduler: Scheduler::new(workers, env) }
    }

    fn env(&self) -> &Env {
        self.scheduler.env()
    }

    pub fn config(&self) -> &Config {
        &self.env().config
    }

    pub fn create_context(&self) -> ContextId {
        let id = self.env().contexts.create();
        debug!(context = %id, "context created");
        id
    }

    /// Destroy a context. Its queued jobs are dropped.
    pub fn destroy_context(&self, id: ContextId) -> Result<()> {
        self.env().contexts.destroy(id)?;
        self.scheduler.cancel(|job| job.footprint().context == Some(id));
        debug!(context = %id, "context destroyed");
        Ok(())
    }

    /// Push a frame and execute the stack.
    pub fn push_frame(&self, id: ContextId, item: StackItem) -> Result<()> {
        let ctx = self.env().contexts.get(id)?;
        let mut ctx = ctx.lock();
        ctx.push(item)?;
        self.schedule_execution(&ctx);
        Ok(())
    }

    /// Pop the top frame and execute what remains.
    pub fn pop_frame(&self, id: ContextId) -> Result<()> {
        let ctx = self.env().contexts.get(id)?;
        let mut ctx = ctx.lock();
        ctx.pop()?;
        if !ctx.stack().is_empty() {
            self.schedule_execution(&ctx);
        }
        Ok(())
    }

    /// Drop cached values of the innermost frame and execute again.
    pub fn recompute(&self, id: ContextId, invalidate: Invalidate) -> Result<()> {
        let command = match invalidate {
            Invalidate::All => Command::InvalidateAll,
            Invalidate::Expressions(ids) => {
                Command::InvalidateKeys(ids.into_iter().map(Key::node).collect())
            }
        };
        let invalidation = CacheInvalidation::new(StackSelector::Top, command, Indexes::COMPUTED);

        let ctx = self.env().contexts.get(id)?;
        let mut ctx = ctx.lock();
        if ctx.stack().is_empty() {
            return Err(Error::EmptyStack(id));
        }
        invalidation.apply(&mut ctx, &|module| self.env().modules.graph(module));
        self.schedule_execution(&ctx);
        Ok(())
    }

    /// Subscribe to the values of an expression.
    pub fn attach_visualization(
        &self,
        id: ContextId,
        expression_id: NodeId,
        method: MethodPointer,
        args: Vec<Value>,
    ) -> Result<VisualizationId> {
        let ctx = self.env().contexts.get(id)?;
        let mut ctx = ctx.lock();
        let visualization = Visualization {
            id: self.env().contexts.next_visualization_id(),
            expression_id,
            method,
            args,
        };
        ctx.attach(visualization.clone());
        self.refresh(&ctx, &visualization);
        Ok(visualization.id)
    }

    /// Change what a visualization evaluates.
    pub fn modify_visualization(
        &self,
        id: ContextId,
        visualization: VisualizationId,
        method: MethodPointer,
        args: Vec<Value>,
    ) -> Result<()> {
        let ctx = self.env().contexts.get(id)?;
        let mut ctx = ctx.lock();
        let visualization = ctx.modify(visualization, method, args)?.clone();
        self.refresh(&ctx, &visualization);
        Ok(())
    }

    pub fn detach_visualization(
        &self,
        id: ContextId,
        visualization: VisualizationId,
    ) -> Result<()> {
        let ctx = self.env().contexts.get(id)?;
        ctx.lock().detach(visualization)?;
        Ok(())
    }

    /// Register a module's source. Re-opening replaces the source.
    pub fn open_file(&self, path: impl Into<PathBuf>, module: &str, source: &str) {
        let (env, path) = (self.env(), path.into());
        env.locks.with_file(&path, || {
            env.modules.open(path.clone(), ModuleName::new(module), source.into());
        });
        debug!(path = %path.display(), module, "file opened");
    }

    /// Queue edits of a file, recompile it and execute every context that
    /// depends on it.
    pub fn edit_file(&self, path: &Path, edits: Vec<TextEdit>) -> Result<JobHandle> {
        let env = self.env();
        let module = env.modules.by_path(path)?;
        let name = env.locks.with_file(path, || {
            let mut module = module.lock();
            module.queue_edits(edits)?;
            Ok::<_, Error>(module.name().clone())
        })?;

        let files = [(path.to_path_buf(), name.clone())];
        let handle = self.scheduler.submit(CompileFiles::new(files));
        for ctx in env.contexts.all() {
            let ctx = ctx.lock();
            if ctx.references(&name) && !ctx.stack().is_empty() {
                self.execute(&ctx);
            }
        }
        Ok(handle)
    }

    /// Close a file. Queued edits are dropped and further edits rejected.
    pub fn close_file(&self, path: &Path) -> Result<()> {
        let env = self.env();
        let module = env.modules.by_path(path)?;
        env.locks.with_file(path, || module.lock().close());
        env.locks.remove_file(path);
        debug!(path = %path.display(), "file closed");
        Ok(())
    }

    /// Inspect a context.
    pub fn with_context<R>(
        &self,
        id: ContextId,
        f: impl FnOnce(&ExecutionContext) -> R,
    ) -> Result<R> {
        let ctx = self.env().contexts.get(id)?;
        let ctx = ctx.lock();
        Ok(f(&ctx))
    }

    pub fn module(&self, name: &str) -> Option<Arc<Mutex<Module>>> {
        self.env().modules.get(&ModuleName::new(name))
    }

    /// Block until all submitted work is done.
    pub fn wait_idle(&self) {
        self.scheduler.wait_idle();
    }

    /// Compile what the stack needs, then execute it.
    fn schedule_execution(&self, ctx: &ExecutionContext) {
        let modules = ctx.modules();
        let stale = modules.iter().any(|name| {
            self.env().modules.get(name).is_none_or(|module| module.lock().needs_compilation())
        });
        if stale {
            self.scheduler.submit(CompileStack::new(ctx.id(), modules));
        }
        self.execute(ctx);
    }

    /// Submit an execution, replacing one that is still queued.
    fn execute(&self, ctx: &ExecutionContext) {
        let id = ctx.id();
        let replaced = self.scheduler.cancel(|job| {
            let footprint = job.footprint();
            !footprint.compilation && footprint.context == Some(id)
        });
        if replaced > 0 {
            debug!(context = %id, replaced, "queued execution replaced");
        }
        self.scheduler.submit(ExecuteContext::new(id, ctx.modules()));
    }

    /// Evaluate a visualization right away if a value is cached, or else
    /// execute the context.
    fn refresh(&self, ctx: &ExecutionContext, visualization: &Visualization) {
        let cached = self
            .config()
            .visualize_on_attach
            .then(|| ctx.cached_value(visualization.expression_id));
        match cached.flatten() {
            Some(value) => self.env().engine().visualize(ctx.id(), visualization, value),
            None if !ctx.stack().is_empty() => self.schedule_execution(ctx),
            None => {}
        }
    }
}
