//! The compiled intermediate representation the engine works on.
//!
//! Producing the IR is the compiler's business. The engine only relies on node
//! identity: a [`NodeId`] is unique across all modules of a program and stays
//! the same across recompilations as long as the node itself is unchanged.

use std::fmt::{self, Debug, Display, Formatter};
use std::ops::Range;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::preference;
use crate::value::Value;

/// Identifies an IR node.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(pub u64);

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A stable identifier that survives reparsing, e.g. an on-screen node.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ExternalId(pub u128);

/// The fully qualified name of a module.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ModuleName(Arc<str>);

impl ModuleName {
    pub fn new(name: &str) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Debug for ModuleName {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Debug::fmt(&*self.0, f)
    }
}

impl Display for ModuleName {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for ModuleName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// A name that is resolved by lookup at runtime.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Symbol(Arc<str>);

impl Symbol {
    pub fn new(name: &str) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Debug for Symbol {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "`{}`", self.0)
    }
}

impl Display for Symbol {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for Symbol {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Eviction priority of a cached value. Zero means "do not cache the value".
pub type Weight = u32;

/// An expression node.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub id: NodeId,
    pub external_id: Option<ExternalId>,
    /// Byte range in the module source.
    pub span: Option<Range<usize>>,
    pub kind: ExprKind,
}

/// The different kinds of expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Literal(Value),
    /// A use of a name, or a definition when in binding or pattern position.
    Name(String),
    Block { statements: Vec<Expr>, trailing: Box<Expr> },
    /// `name` is always a [`ExprKind::Name`] node.
    Binding { name: Box<Expr>, expr: Box<Expr> },
    Application { callee: Box<Expr>, args: Vec<Expr> },
    /// Every branch is a [`ExprKind::Branch`] node.
    Case { scrutinee: Box<Expr>, branches: Vec<Expr> },
    /// Names in the pattern bind. A pattern is a literal, a name or an
    /// application of a constructor name to sub-patterns.
    Branch { pattern: Box<Expr>, body: Box<Expr> },
    Lambda { params: Vec<String>, body: Box<Expr> },
}

impl Expr {
    pub fn new(id: u64, kind: ExprKind) -> Self {
        Self { id: NodeId(id), external_id: None, span: None, kind }
    }

    pub fn literal(id: u64, value: Value) -> Self {
        Self::new(id, ExprKind::Literal(value))
    }

    pub fn name(id: u64, name: &str) -> Self {
        Self::new(id, ExprKind::Name(name.into()))
    }

    pub fn block(id: u64, statements: Vec<Expr>, trailing: Expr) -> Self {
        Self::new(id, ExprKind::Block { statements, trailing: Box::new(trailing) })
    }

    pub fn binding(id: u64, name: Expr, expr: Expr) -> Self {
        Self::new(id, ExprKind::Binding { name: Box::new(name), expr: Box::new(expr) })
    }

    pub fn apply(id: u64, callee: Expr, args: Vec<Expr>) -> Self {
        Self::new(id, ExprKind::Application { callee: Box::new(callee), args })
    }

    pub fn case(id: u64, scrutinee: Expr, branches: Vec<Expr>) -> Self {
        Self::new(id, ExprKind::Case { scrutinee: Box::new(scrutinee), branches })
    }

    pub fn branch(id: u64, pattern: Expr, body: Expr) -> Self {
        Self::new(id, ExprKind::Branch { pattern: Box::new(pattern), body: Box::new(body) })
    }

    pub fn lambda(id: u64, params: &[&str], body: Expr) -> Self {
        let params = params.iter().map(|p| p.to_string()).collect();
        Self::new(id, ExprKind::Lambda { params, body: Box::new(body) })
    }

    pub fn with_span(mut self, span: Range<usize>) -> Self {
        self.span = Some(span);
        self
    }

    pub fn with_external_id(mut self, id: u128) -> Self {
        self.external_id = Some(ExternalId(id));
        self
    }

    /// The direct children of this node in evaluation order.
    pub fn children(&self) -> Vec<&Expr> {
        match &self.kind {
            ExprKind::Literal(_) | ExprKind::Name(_) => vec![],
            ExprKind::Block { statements, trailing } => {
                statements.iter().chain(std::iter::once(&**trailing)).collect()
            }
            ExprKind::Binding { name, expr } => vec![name, expr],
            ExprKind::Application { callee, args } => {
                std::iter::once(&**callee).chain(args).collect()
            }
            ExprKind::Case { scrutinee, branches } => {
                std::iter::once(&**scrutinee).chain(branches).collect()
            }
            ExprKind::Branch { pattern, body } => vec![pattern, body],
            ExprKind::Lambda { body, .. } => vec![body],
        }
    }
}

/// A method definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Method {
    pub id: NodeId,
    pub external_id: Option<ExternalId>,
    pub span: Option<Range<usize>>,
    /// The type the method is defined on. Module-level methods use the
    /// module's name.
    pub defined_on: String,
    pub name: String,
    pub params: Vec<String>,
    pub body: Expr,
}

impl Method {
    pub fn new(id: u64, defined_on: &str, name: &str, params: &[&str], body: Expr) -> Self {
        Self {
            id: NodeId(id),
            external_id: None,
            span: None,
            defined_on: defined_on.into(),
            name: name.into(),
            params: params.iter().map(|p| p.to_string()).collect(),
            body,
        }
    }

    pub fn with_span(mut self, span: Range<usize>) -> Self {
        self.span = Some(span);
        self
    }

    pub fn with_external_id(mut self, id: u128) -> Self {
        self.external_id = Some(ExternalId(id));
        self
    }

    /// The symbol through which the method is looked up.
    pub fn symbol(&self) -> Symbol {
        Symbol::new(&self.name)
    }
}

/// Where a node sits in the module.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub external_id: Option<ExternalId>,
    pub span: Option<Range<usize>>,
    pub parent: Option<NodeId>,
}

/// The compiled IR of one module.
#[derive(Debug, Clone)]
pub struct ModuleIr {
    name: ModuleName,
    methods: Vec<Method>,
    exports: Vec<Symbol>,
    nodes: FxHashMap<NodeId, NodeInfo>,
    weights: FxHashMap<NodeId, Weight>,
}

impl ModuleIr {
    /// Index a module's methods. Cache weights default to the result of the
    /// cache preference analysis.
    pub fn new(name: ModuleName, methods: Vec<Method>, exports: Vec<Symbol>) -> Result<Self> {
        let mut nodes = FxHashMap::default();
        for method in &methods {
            let info = NodeInfo {
                external_id: method.external_id,
                span: method.span.clone(),
                parent: None,
            };
            if nodes.insert(method.id, info).is_some() {
                return Err(Error::DuplicateNode(method.id));
            }

            let mut work = vec![(&method.body, method.id)];
            while let Some((expr, parent)) = work.pop() {
                let info = NodeInfo {
                    external_id: expr.external_id,
                    span: expr.span.clone(),
                    parent: Some(parent),
                };
                if nodes.insert(expr.id, info).is_some() {
                    return Err(Error::DuplicateNode(expr.id));
                }
                work.extend(expr.children().into_iter().map(|child| (child, expr.id)));
            }
        }

        let weights = preference::analyze(&methods);
        Ok(Self { name, methods, exports, nodes, weights })
    }

    /// Replace the cache weights of the module.
    pub fn with_weights(mut self, weights: FxHashMap<NodeId, Weight>) -> Self {
        self.weights = weights;
        self
    }

    pub fn name(&self) -> &ModuleName {
        &self.name
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    pub fn exports(&self) -> &[Symbol] {
        &self.exports
    }

    pub fn weights(&self) -> &FxHashMap<NodeId, Weight> {
        &self.weights
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeInfo> {
        self.nodes.get(&id)
    }

    pub fn external_id(&self, id: NodeId) -> Option<ExternalId> {
        self.nodes.get(&id).and_then(|info| info.external_id)
    }

    /// All node ids of the module, methods included.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
