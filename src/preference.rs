//! Static analysis deciding which values are worth keeping in a frame cache.

use rustc_hash::FxHashMap;

use crate::ir::{Expr, ExprKind, Method, NodeId, Weight};

/// The weight given to values worth caching.
pub const ALWAYS: Weight = 1;

/// Compute the default cache weights of a module's methods.
///
/// The value bound by every binding and the result of every method body are
/// cached. Intermediate values of nested expressions are not; they are cheap
/// to recompute from their cached inputs.
pub fn analyze(methods: &[Method]) -> FxHashMap<NodeId, Weight> {
    let mut weights = FxHashMap::default();
    for method in methods {
        let result = match &method.body.kind {
            ExprKind::Block { trailing, .. } => trailing,
            _ => &method.body,
        };
        weights.insert(result.id, ALWAYS);

        let mut work: Vec<&Expr> = vec![&method.body];
        while let Some(expr) = work.pop() {
            if let ExprKind::Binding { expr: bound, .. } = &expr.kind {
                weights.insert(bound.id, ALWAYS);
            }
            work.extend(expr.children());
        }
    }
    weights
}
