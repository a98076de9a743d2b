//! The jobs a runtime schedules: compiling files, compiling the modules of a
//! stack and executing a context.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tracing::{debug, error, info, instrument, warn};

use crate::changeset::Changeset;
use crate::context::ContextId;
use crate::error::{Error, Result};
use crate::graph::DependencyGraph;
use crate::index::IndexUpdate;
use crate::invalidate::Plan;
use crate::ir::{ModuleName, NodeId};
use crate::module::{Compiled, Module};
use crate::notify::{Diagnostic, Notification};
use crate::runtime::Env;
use crate::scheduler::{Footprint, Job};

/// Applies the queued edits of files and recompiles their modules.
pub(crate) struct CompileFiles {
    files: Vec<PathBuf>,
    footprint: Footprint,
}

impl CompileFiles {
    pub fn new(files: impl IntoIterator<Item = (PathBuf, ModuleName)>) -> Self {
        let (files, modules): (Vec<_>, Vec<_>) = files.into_iter().unzip();
        Self { files, footprint: Footprint::compilation(modules) }
    }
}

impl Job<Env> for CompileFiles {
    fn name(&self) -> &'static str {
        "compile-files"
    }

    fn footprint(&self) -> &Footprint {
        &self.footprint
    }

    fn is_cancellable(&self) -> bool {
        false
    }

    #[instrument(skip_all, name = "compile_files", fields(files = self.files.len()))]
    fn run(&self, env: &Env) {
        env.locks.with_compilation(|| {
            for path in &self.files {
                let module = match env.modules.by_path(path) {
                    Ok(module) => module,
                    Err(err) => {
                        warn!(path = %path.display(), %err, "skipping file");
                        continue;
                    }
                };
                if abort(env, &module, compile(env, &module)) {
                    return;
                }
            }
        });
    }
}

/// Compiles the modules a context's stack needs.
pub(crate) struct CompileStack {
    context: ContextId,
    footprint: Footprint,
}

impl CompileStack {
    pub fn new(context: ContextId, modules: impl IntoIterator<Item = ModuleName>) -> Self {
        Self { context, footprint: Footprint::compilation(modules) }
    }
}

impl Job<Env> for CompileStack {
    fn name(&self) -> &'static str {
        "compile-stack"
    }

    fn footprint(&self) -> &Footprint {
        &self.footprint
    }

    #[instrument(skip_all, name = "compile_stack", fields(context = %self.context))]
    fn run(&self, env: &Env) {
        env.locks.with_compilation(|| {
            let mut modules: Vec<_> = self.footprint.modules.iter().collect();
            modules.sort();
            for name in modules {
                let Some(module) = env.modules.get(name) else {
                    debug!(module = %name, "module is not open");
                    continue;
                };
                if abort(env, &module, compile(env, &module)) {
                    return;
                }
            }
        });
    }
}

/// Runs the stack of a context.
pub(crate) struct ExecuteContext {
    context: ContextId,
    footprint: Footprint,
}

impl ExecuteContext {
    pub fn new(context: ContextId, modules: impl IntoIterator<Item = ModuleName>) -> Self {
        Self { context, footprint: Footprint::execution(context, modules) }
    }
}

impl Job<Env> for ExecuteContext {
    fn name(&self) -> &'static str {
        "execute-context"
    }

    fn footprint(&self) -> &Footprint {
        &self.footprint
    }

    #[instrument(skip_all, name = "execute_context", fields(context = %self.context))]
    fn run(&self, env: &Env) {
        let Ok(ctx) = env.contexts.get(self.context) else {
            debug!("context was destroyed");
            return;
        };
        let mut ctx = ctx.lock();
        if let Err(err) = env.engine().run(&mut ctx) {
            debug!(%err, "nothing to execute");
        }
    }
}

/// Handle the result of compiling a module. Returns whether the job must
/// stop because the engine itself is broken.
fn abort(env: &Env, module: &Mutex<Module>, result: Result<()>) -> bool {
    let Err(err) = result else { return false };
    let (name, path) = {
        let mut module = module.lock();
        if err.is_internal() {
            module.fail();
        }
        (module.name().clone(), module.path().to_path_buf())
    };

    if !err.is_internal() {
        warn!(module = %name, %err, "compilation skipped");
        return false;
    }

    error!(module = %name, %err, "aborting compilation");
    let diagnostic = Diagnostic::error(format!("internal error: {err}")).with_file(path);
    emit_diagnostics(env, &name, vec![diagnostic]);
    true
}

/// Apply the queued edits of a module and recompile it if needed.
fn compile(env: &Env, module: &Mutex<Module>) -> Result<()> {
    let path = module.lock().path().to_path_buf();
    let (name, changeset, rejected, old, needed, replaced) = env.locks.with_file(&path, || {
        let mut module = module.lock();
        let edits = module.take_edits();
        let replaced = module.take_replaced();
        let old = module.ir().cloned().zip(module.graph().cloned());
        let source = module.source().to_string();
        // Spans of the last good IR do not match the source of a failed
        // compilation or a replaced one.
        let spans = old
            .as_ref()
            .map(|(ir, _)| &**ir)
            .filter(|_| !module.has_errors() && !replaced);
        let (changeset, rejected) = match Changeset::compute(&source, &edits, spans) {
            Ok(changeset) => {
                module.set_source(changeset.after.clone());
                (changeset, None)
            }
            Err(err) => {
                let unchanged =
                    Changeset { after: source.clone(), before: source, ..Changeset::default() };
                (unchanged, Some(err))
            }
        };
        let needed = module.needs_compilation();
        (module.name().clone(), changeset, rejected, old, needed, replaced)
    });

    if let Some(err) = rejected {
        warn!(module = %name, %err, "rejecting edits");
        let mut diagnostic = Diagnostic::warning(err.to_string()).with_file(path.clone());
        if let Error::InvalidEdit { range, .. } = &err {
            diagnostic = diagnostic.with_range(range.clone());
        }
        emit_diagnostics(env, &name, vec![diagnostic]);
    }

    if !needed && changeset.is_noop() {
        debug!(module = %name, "module is up to date");
        return Ok(());
    }

    let Compiled { ir, diagnostics } = match env.compiler.compile(&name, &changeset.after) {
        Ok(compiled) => compiled,
        Err(diagnostics) => {
            let errors = diagnostics.iter().filter(|d| d.is_error()).count();
            info!(module = %name, errors, "compilation failed");
            module.lock().fail();
            emit_diagnostics(env, &name, with_file(diagnostics, &path));
            return Ok(());
        }
    };

    let symbols = env.modules.symbols().with_module(&ir);
    let graph = DependencyGraph::build(&ir, &symbols)?;
    graph.validate()?;

    let mut stale: FxHashSet<NodeId> =
        env.compiler.parse_metadata(&changeset.before).into_iter().collect();
    if let Some((old_ir, _)) = &old {
        stale.extend(old_ir.node_ids());
    }
    stale.retain(|&id| !ir.contains(id));

    let (ir, graph) = (Arc::new(ir), Arc::new(graph));
    let (version, indexed, had_errors) = {
        let mut module = module.lock();
        let had_errors = module.has_errors();
        module.install(ir.clone(), graph.clone());
        (module.version(), module.is_indexed(), had_errors)
    };
    env.modules.publish(&ir);

    let changed: FxHashSet<NodeId> = match &old {
        Some((old_ir, _)) if had_errors || replaced => old_ir.node_ids().collect(),
        _ => changeset.changed,
    };
    let plan = Plan::compute(&name, &changed, &stale, old.as_ref().map(|(_, g)| &**g), &graph);
    let mut invalidated = 0;
    for ctx in env.contexts.all() {
        let mut ctx = ctx.lock();
        if ctx.references(&name) {
            plan.apply(&mut ctx, &|module| env.modules.graph(module));
            invalidated += 1;
        }
    }

    if !diagnostics.is_empty() || had_errors {
        emit_diagnostics(env, &name, with_file(diagnostics, &path));
    }

    let previous = old.as_ref().map(|(ir, _)| &**ir).filter(|_| indexed);
    let update = IndexUpdate::diff(version, previous, &ir);
    if !update.is_empty() {
        env.index.apply(&update);
        env.sink.emit(Notification::ModuleIndexUpdated(update));
    }
    module.lock().set_indexed();

    info!(
        module = %name,
        version,
        keys = plan.invalidated.len(),
        stale = stale.len(),
        contexts = invalidated,
        "module compiled",
    );
    Ok(())
}

fn with_file(diagnostics: Vec<Diagnostic>, path: &Path) -> Vec<Diagnostic> {
    diagnostics
        .into_iter()
        .map(|d| if d.file.is_some() { d } else { d.with_file(path.to_path_buf()) })
        .collect()
}

/// Send diagnostics of a module to every context depending on it, or to
/// nobody in particular if there is none.
fn emit_diagnostics(env: &Env, module: &ModuleName, diagnostics: Vec<Diagnostic>) {
    let contexts: Vec<ContextId> = env
        .contexts
        .all()
        .into_iter()
        .filter_map(|ctx| {
            let ctx = ctx.lock();
            ctx.references(module).then(|| ctx.id())
        })
        .collect();

    if contexts.is_empty() {
        env.sink.emit(Notification::DiagnosticsUpdated {
            context: None,
            module: module.clone(),
            diagnostics,
        });
        return;
    }
    for context in contexts {
        env.sink.emit(Notification::DiagnosticsUpdated {
            context: Some(context),
            module: module.clone(),
            diagnostics: diagnostics.clone(),
        });
    }
}
