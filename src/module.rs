//! Modules, their compilation state and the compiler collaborator.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::changeset::TextEdit;
use crate::error::{Error, Result};
use crate::graph::DependencyGraph;
use crate::ir::{ModuleIr, ModuleName, NodeId};
use crate::notify::Diagnostic;
use crate::symbols::SymbolTable;

/// How far a module has been compiled. Only ever moves forward, except that
/// an edit moves it back to [`Parsed`](Self::Parsed).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum CompilationStage {
    Unparsed,
    Parsed,
    IrBuilt,
    ScopeCompiled,
}

/// What a successful compilation produced.
#[derive(Debug, Clone)]
pub struct Compiled {
    pub ir: ModuleIr,
    /// Warnings.
    pub diagnostics: Vec<Diagnostic>,
}

/// Turns module sources into IR.
pub trait Compiler: Send + Sync {
    /// Compile a module. Fails with at least one error diagnostic.
    fn compile(
        &self,
        module: &ModuleName,
        source: &str,
    ) -> std::result::Result<Compiled, Vec<Diagnostic>>;

    /// The node ids recorded in metadata embedded in a source.
    fn parse_metadata(&self, _source: &str) -> Vec<NodeId> {
        vec![]
    }
}

/// A module of the program.
#[derive(Debug)]
pub struct Module {
    name: ModuleName,
    path: PathBuf,
    source: String,
    stage: CompilationStage,
    indexed: bool,
    open: bool,
    version: u64,
    ir: Option<Arc<ModuleIr>>,
    graph: Option<Arc<DependencyGraph>>,
    pending: Vec<TextEdit>,
    replaced: bool,
    errors: bool,
}

impl Module {
    pub fn new(name: ModuleName, path: PathBuf, source: String) -> Self {
        Self {
            name,
            path,
            source,
            stage: CompilationStage::Unparsed,
            indexed: false,
            open: true,
            version: 0,
            ir: None,
            graph: None,
            pending: vec![],
            replaced: false,
            errors: false,
        }
    }

    pub fn name(&self) -> &ModuleName {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn stage(&self) -> CompilationStage {
        self.stage
    }

    pub fn is_indexed(&self) -> bool {
        self.indexed
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Incremented on every successful compilation.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn ir(&self) -> Option<&Arc<ModuleIr>> {
        self.ir.as_ref()
    }

    pub fn graph(&self) -> Option<&Arc<DependencyGraph>> {
        self.graph.as_ref()
    }

    /// Whether the last compilation failed.
    pub fn has_errors(&self) -> bool {
        self.errors
    }

    /// Whether the module can be executed as it is.
    pub fn is_compiled(&self) -> bool {
        self.stage == CompilationStage::ScopeCompiled && !self.errors && self.ir.is_some()
    }

    /// Whether a compilation job has work to do for this module.
    pub fn needs_compilation(&self) -> bool {
        self.stage < CompilationStage::ScopeCompiled || !self.pending.is_empty()
    }

    /// Move the module forward to `stage`. Never moves it backward.
    pub fn advance(&mut self, stage: CompilationStage) {
        self.stage = self.stage.max(stage);
    }

    /// Move the module back to `Parsed` after an edit. A module that was never
    /// parsed stays unparsed.
    pub fn reset_to_parsed(&mut self) {
        self.stage = self.stage.min(CompilationStage::Parsed);
    }

    /// Queue edits for the next compilation.
    pub fn queue_edits(&mut self, edits: impl IntoIterator<Item = TextEdit>) -> Result<()> {
        if !self.open {
            return Err(Error::FileNotOpen(self.path.clone()));
        }
        self.pending.extend(edits);
        self.reset_to_parsed();
        Ok(())
    }

    /// Take the queued edits.
    pub fn take_edits(&mut self) -> Vec<TextEdit> {
        std::mem::take(&mut self.pending)
    }

    /// Replace the source with an edited one.
    pub fn set_source(&mut self, source: String) {
        self.source = source;
    }

    /// Re-open the module from `path` with a new source. Queued edits are
    /// dropped.
    pub fn reopen(&mut self, path: PathBuf, source: String) {
        if source != self.source {
            self.source = source;
            self.replaced = true;
            self.reset_to_parsed();
        }
        self.path = path;
        self.pending.clear();
        self.open = true;
    }

    /// Whether the source was replaced wholesale since the last call. The
    /// spans of the old IR say nothing about a replaced source.
    pub fn take_replaced(&mut self) -> bool {
        std::mem::take(&mut self.replaced)
    }

    pub fn close(&mut self) {
        self.pending.clear();
        self.open = false;
    }

    /// Install the result of a successful compilation.
    pub fn install(&mut self, ir: Arc<ModuleIr>, graph: Arc<DependencyGraph>) {
        self.advance(CompilationStage::Parsed);
        self.advance(CompilationStage::IrBuilt);
        self.ir = Some(ir);
        self.graph = Some(graph);
        self.advance(CompilationStage::ScopeCompiled);
        self.errors = false;
        self.version += 1;
    }

    /// Record a failed compilation. The last good IR is kept for diffing.
    pub fn fail(&mut self) {
        self.advance(CompilationStage::Parsed);
        self.errors = true;
    }

    /// Mark the module's symbols as emitted to the index.
    pub fn set_indexed(&mut self) {
        self.indexed = true;
    }
}

/// An executable compilation of a module.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub ir: Arc<ModuleIr>,
    pub graph: Arc<DependencyGraph>,
    pub version: u64,
}

/// All modules of the program plus the symbol table derived from them.
#[derive(Default)]
pub struct Modules {
    by_name: RwLock<FxHashMap<ModuleName, Arc<Mutex<Module>>>>,
    by_path: RwLock<FxHashMap<PathBuf, ModuleName>>,
    symbols: RwLock<Arc<SymbolTable>>,
}

impl Modules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module, or re-open an existing one with a new source. A
    /// module re-opened from another path is no longer found by the old one.
    pub fn open(&self, path: PathBuf, name: ModuleName, source: String) -> Arc<Mutex<Module>> {
        let mut by_path = self.by_path.write();
        let mut by_name = self.by_name.write();
        by_path.insert(path.clone(), name.clone());
        if let Some(module) = by_name.get(&name) {
            let mut locked = module.lock();
            if locked.path() != path {
                by_path.remove(locked.path());
            }
            locked.reopen(path, source);
            drop(locked);
            return module.clone();
        }
        let module = Arc::new(Mutex::new(Module::new(name.clone(), path, source)));
        by_name.insert(name, module.clone());
        module
    }

    pub fn get(&self, name: &ModuleName) -> Option<Arc<Mutex<Module>>> {
        self.by_name.read().get(name).cloned()
    }

    pub fn by_path(&self, path: &Path) -> Result<Arc<Mutex<Module>>> {
        let name = self
            .by_path
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::FileNotOpen(path.to_path_buf()))?;
        self.get(&name).ok_or(Error::ModuleNotFound(name))
    }

    /// The compiled state of a module, if it is executable.
    pub fn compiled(&self, name: &ModuleName) -> Option<Snapshot> {
        let module = self.get(name)?;
        let module = module.lock();
        if !module.is_compiled() {
            return None;
        }
        Some(Snapshot {
            ir: module.ir.clone()?,
            graph: module.graph.clone()?,
            version: module.version,
        })
    }

    /// The last successfully built graph of a module.
    pub fn graph(&self, name: &ModuleName) -> Option<Arc<DependencyGraph>> {
        self.get(name)?.lock().graph.clone()
    }

    /// The current symbol table.
    pub fn symbols(&self) -> Arc<SymbolTable> {
        self.symbols.read().clone()
    }

    /// Publish the bindings of a freshly compiled module.
    pub fn publish(&self, ir: &ModuleIr) -> Arc<SymbolTable> {
        let mut symbols = self.symbols.write();
        *symbols = Arc::new(symbols.with_module(ir));
        symbols.clone()
    }
}
