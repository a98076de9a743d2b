use rustc_hash::FxHashMap;

use crate::ir::{ModuleIr, ModuleName, NodeId, Symbol};

/// Where a symbol is currently defined.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Definition {
    pub module: ModuleName,
    pub node: NodeId,
}

/// A versioned snapshot of the program's global bindings.
///
/// Dependency graph construction resolves names that are not lexically bound
/// against such a snapshot. The table is never mutated in place: every change
/// produces a new version, so a graph can always tell which bindings it saw.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    version: u64,
    bindings: FxHashMap<Symbol, Definition>,
}

impl SymbolTable {
    /// An empty table at version zero.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn lookup(&self, symbol: &Symbol) -> Option<&Definition> {
        self.bindings.get(symbol)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// A new version in which the module's methods replace every binding the
    /// previous version of that module contributed.
    pub fn with_module(&self, ir: &ModuleIr) -> Self {
        let mut next = self.clone();
        next.version += 1;
        next.bindings.retain(|_, def| def.module != *ir.name());
        for method in ir.methods() {
            next.bindings.insert(
                method.symbol(),
                Definition { module: ir.name().clone(), node: method.id },
            );
        }
        next
    }
}
