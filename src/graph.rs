//! Dependency graphs over the expressions of a module.

use std::fmt::{self, Debug, Formatter};
use std::hash::{Hash, Hasher};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{Error, Result};
use crate::ir::{Expr, ExprKind, ExternalId, ModuleIr, NodeId, Symbol};
use crate::symbols::SymbolTable;

/// Something whose change can invalidate other things.
///
/// The external id is carried for correlation only and does not take part in
/// equality or hashing.
#[derive(Clone)]
pub enum Key {
    /// A specific expression instance.
    Static { node: NodeId, external_id: Option<ExternalId> },
    /// A name resolved by lookup. Rebinding it invalidates all of its uses.
    Dynamic { symbol: Symbol, external_id: Option<ExternalId> },
}

impl Key {
    pub fn node(node: NodeId) -> Self {
        Self::Static { node, external_id: None }
    }

    pub fn symbol(symbol: Symbol) -> Self {
        Self::Dynamic { symbol, external_id: None }
    }

    /// The node id of a static key.
    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            Self::Static { node, .. } => Some(*node),
            Self::Dynamic { .. } => None,
        }
    }

    pub fn external_id(&self) -> Option<ExternalId> {
        match self {
            Self::Static { external_id, .. } | Self::Dynamic { external_id, .. } => *external_id,
        }
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Static { node: a, .. }, Self::Static { node: b, .. }) => a == b,
            (Self::Dynamic { symbol: a, .. }, Self::Dynamic { symbol: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Static { node, .. } => {
                state.write_u8(0);
                node.hash(state);
            }
            Self::Dynamic { symbol, .. } => {
                state.write_u8(1);
                symbol.hash(state);
            }
        }
    }
}

impl Debug for Key {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Static { node, .. } => write!(f, "Static({node})"),
            Self::Dynamic { symbol, .. } => write!(f, "Dynamic({symbol:?})"),
        }
    }
}

impl From<NodeId> for Key {
    fn from(node: NodeId) -> Self {
        Self::node(node)
    }
}

/// Which keys must be invalidated when a key changes, and the reverse.
///
/// The two mappings are adjoint: `b ∈ dependents(a) ⇔ a ∈ dependencies(b)`.
/// A graph is immutable once built; recompiling a module builds a new one.
#[derive(Clone, Default)]
pub struct DependencyGraph {
    dependents: FxHashMap<Key, FxHashSet<Key>>,
    dependencies: FxHashMap<Key, FxHashSet<Key>>,
    symbols_version: u64,
}

impl DependencyGraph {
    /// An empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph of a module, resolving free names against `symbols`.
    pub fn build(ir: &ModuleIr, symbols: &SymbolTable) -> Result<Self> {
        let mut builder = Builder {
            ir,
            symbols,
            graph: Self { symbols_version: symbols.version(), ..Self::default() },
            visited: FxHashSet::default(),
        };

        for method in ir.methods() {
            builder.enter(method.id)?;
            let scope = Scope::root(method.params.iter().map(|p| (p.clone(), method.id)));
            builder.visit(&method.body, &scope)?;
            let (this, body) = (builder.key(method.id), builder.key(method.body.id));
            builder.graph.insert(this.clone(), body);
            builder.graph.insert(
                Key::Dynamic { symbol: method.symbol(), external_id: method.external_id },
                this,
            );
        }

        Ok(builder.graph)
    }

    /// Record that `dependent` must be invalidated whenever `dependency` is.
    pub fn insert(&mut self, dependent: Key, dependency: Key) {
        self.dependents.entry(dependency.clone()).or_default().insert(dependent.clone());
        self.dependencies.entry(dependent).or_default().insert(dependency);
    }

    /// The keys that directly depend on `key`.
    pub fn dependents(&self, key: &Key) -> impl Iterator<Item = &Key> {
        self.dependents.get(key).into_iter().flatten()
    }

    /// The keys that `key` directly depends on.
    pub fn dependencies(&self, key: &Key) -> impl Iterator<Item = &Key> {
        self.dependencies.get(key).into_iter().flatten()
    }

    /// The version of the symbol table the graph was resolved against.
    pub fn symbols_version(&self) -> u64 {
        self.symbols_version
    }

    /// Every key occurring in the graph.
    pub fn keys(&self) -> FxHashSet<&Key> {
        self.dependents.keys().chain(self.dependencies.keys()).collect()
    }

    /// The number of edges.
    pub fn len(&self) -> usize {
        self.dependents.values().map(FxHashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.dependents.is_empty()
    }

    /// The seeds and everything that transitively depends on them.
    pub fn transitive_dependents<'a>(
        &self,
        seeds: impl IntoIterator<Item = &'a Key>,
    ) -> FxHashSet<Key> {
        closure([self], seeds)
    }

    /// Check that the two mappings are adjoint.
    pub fn validate(&self) -> Result<()> {
        for (dependency, dependents) in &self.dependents {
            for dependent in dependents {
                if !self.dependencies.get(dependent).is_some_and(|set| set.contains(dependency)) {
                    return Err(Error::Invariant(format!(
                        "{dependent:?} is a dependent of {dependency:?} but not the reverse"
                    )));
                }
            }
        }
        for (dependent, dependencies) in &self.dependencies {
            for dependency in dependencies {
                if !self.dependents.get(dependency).is_some_and(|set| set.contains(dependent)) {
                    return Err(Error::Invariant(format!(
                        "{dependency:?} is a dependency of {dependent:?} but not the reverse"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Debug for DependencyGraph {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let mut edges: Vec<_> = self
            .dependents
            .iter()
            .flat_map(|(dependency, dependents)| dependents.iter().map(move |d| (d, dependency)))
            .collect();
        edges.sort_by_key(|(a, b)| format!("{a:?}{b:?}"));
        for (dependent, dependency) in edges {
            writeln!(f, "{dependent:?} -> {dependency:?}")?;
        }
        Ok(())
    }
}

/// Compute the transitive dependents of the seeds over several graphs at once.
///
/// Uses an explicit worklist and a visited set, so cycles terminate and the
/// host stack does not grow with the length of dependency chains.
pub fn closure<'a, 'g>(
    graphs: impl IntoIterator<Item = &'g DependencyGraph>,
    seeds: impl IntoIterator<Item = &'a Key>,
) -> FxHashSet<Key> {
    let graphs: Vec<&DependencyGraph> = graphs.into_iter().collect();
    let mut visited: FxHashSet<Key> = FxHashSet::default();
    let mut frontier: Vec<Key> = vec![];
    for seed in seeds {
        if visited.insert(seed.clone()) {
            frontier.push(seed.clone());
        }
    }

    while let Some(key) = frontier.pop() {
        for graph in &graphs {
            for dependent in graph.dependents(&key) {
                if visited.insert(dependent.clone()) {
                    frontier.push(dependent.clone());
                }
            }
        }
    }

    visited
}

/// Names bound in the current lexical scope, innermost last.
struct Scope<'p> {
    names: FxHashMap<String, NodeId>,
    parent: Option<&'p Scope<'p>>,
}

impl<'p> Scope<'p> {
    fn root(names: impl IntoIterator<Item = (String, NodeId)>) -> Self {
        Self { names: names.into_iter().collect(), parent: None }
    }

    fn child(&'p self) -> Self {
        Self { names: FxHashMap::default(), parent: Some(self) }
    }

    fn lookup(&self, name: &str) -> Option<NodeId> {
        let mut scope = Some(self);
        while let Some(current) = scope {
            if let Some(&id) = current.names.get(name) {
                return Some(id);
            }
            scope = current.parent;
        }
        None
    }
}

struct Builder<'a> {
    ir: &'a ModuleIr,
    symbols: &'a SymbolTable,
    graph: DependencyGraph,
    visited: FxHashSet<NodeId>,
}

impl Builder<'_> {
    fn key(&self, node: NodeId) -> Key {
        Key::Static { node, external_id: self.ir.external_id(node) }
    }

    fn depend(&mut self, dependent: NodeId, dependency: NodeId) {
        let (a, b) = (self.key(dependent), self.key(dependency));
        self.graph.insert(a, b);
    }

    fn enter(&mut self, node: NodeId) -> Result<()> {
        if self.visited.insert(node) { Ok(()) } else { Err(Error::DuplicateNode(node)) }
    }

    fn visit(&mut self, expr: &Expr, scope: &Scope) -> Result<()> {
        self.enter(expr.id)?;
        match &expr.kind {
            ExprKind::Literal(_) => {}
            ExprKind::Name(name) => {
                let dependency = self.resolve(name, scope);
                let this = self.key(expr.id);
                self.graph.insert(this, dependency);
            }
            ExprKind::Block { statements, trailing } => {
                let mut inner = scope.child();
                for statement in statements {
                    if let ExprKind::Binding { name, .. } = &statement.kind {
                        if let ExprKind::Name(name) = &name.kind {
                            // Visible in its own body to allow recursion.
                            inner.names.insert(name.clone(), statement.id);
                        }
                    }
                    self.visit(statement, &inner)?;
                }
                self.visit(trailing, &inner)?;
                self.depend(expr.id, trailing.id);
            }
            ExprKind::Binding { name, expr: bound } => {
                self.enter(name.id)?;
                self.visit(bound, scope)?;
                self.depend(expr.id, name.id);
                self.depend(expr.id, bound.id);
            }
            ExprKind::Application { callee, args } => {
                self.visit(callee, scope)?;
                self.depend(expr.id, callee.id);
                for arg in args {
                    self.visit(arg, scope)?;
                    self.depend(expr.id, arg.id);
                }
            }
            ExprKind::Case { scrutinee, branches } => {
                self.visit(scrutinee, scope)?;
                self.depend(expr.id, scrutinee.id);
                for branch in branches {
                    self.visit(branch, scope)?;
                    self.depend(expr.id, branch.id);
                }
            }
            ExprKind::Branch { pattern, body } => {
                let mut inner = scope.child();
                self.visit_pattern(pattern, scope, &mut inner)?;
                self.visit(body, &inner)?;
                self.depend(expr.id, pattern.id);
                self.depend(expr.id, body.id);
            }
            ExprKind::Lambda { params, body } => {
                let mut inner = scope.child();
                for param in params {
                    inner.names.insert(param.clone(), expr.id);
                }
                self.visit(body, &inner)?;
                self.depend(expr.id, body.id);
            }
        }
        Ok(())
    }

    /// Patterns bind their names into `bindings`. Constructor names are uses.
    fn visit_pattern(&mut self, pattern: &Expr, scope: &Scope, bindings: &mut Scope) -> Result<()> {
        self.enter(pattern.id)?;
        match &pattern.kind {
            ExprKind::Name(name) => {
                if name != "_" {
                    bindings.names.insert(name.clone(), pattern.id);
                }
            }
            ExprKind::Application { callee, args } => {
                self.visit(callee, scope)?;
                self.depend(pattern.id, callee.id);
                for arg in args {
                    self.visit_pattern(arg, scope, bindings)?;
                    self.depend(pattern.id, arg.id);
                }
            }
            ExprKind::Literal(_) => {}
            _ => {
                return Err(Error::Invariant(format!(
                    "node {} is not a valid pattern",
                    pattern.id
                )));
            }
        }
        Ok(())
    }

    /// Resolve a name use to what it depends on.
    fn resolve(&self, name: &str, scope: &Scope) -> Key {
        if let Some(definition) = scope.lookup(name) {
            return self.key(definition);
        }

        if let Some(method) = self.ir.methods().iter().find(|m| m.name == name) {
            return self.key(method.id);
        }

        let symbol = Symbol::new(name);
        match self.symbols.lookup(&symbol) {
            Some(definition) if definition.module == *self.ir.name() => self.key(definition.node),
            _ => Key::Dynamic { symbol, external_id: None },
        }
    }
}
