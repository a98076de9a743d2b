//! Updates of the external symbol index.

use indexmap::IndexMap;

use crate::hash::fingerprint;
use crate::ir::{ExternalId, ModuleIr, ModuleName, Symbol};

/// Something a client can complete to: currently, a method.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Suggestion {
    pub module: ModuleName,
    pub self_type: String,
    pub name: String,
    pub arguments: Vec<String>,
    pub external_id: Option<ExternalId>,
}

impl Suggestion {
    /// The suggestions a module contributes, in definition order.
    pub fn of(ir: &ModuleIr) -> Vec<Self> {
        ir.methods()
            .iter()
            .map(|method| Self {
                module: ir.name().clone(),
                self_type: method.defined_on.clone(),
                name: method.name.clone(),
                arguments: method.params.clone(),
                external_id: method.external_id,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SuggestionUpdate {
    Added(Suggestion),
    Removed(Suggestion),
    Modified { old: Suggestion, new: Suggestion },
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ExportUpdate {
    Added(Symbol),
    Removed(Symbol),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum IndexAction {
    /// Drop everything the index knows about the module before applying the
    /// rest of the update.
    CleanModule(ModuleName),
}

/// One batch of changes for the symbol index.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct IndexUpdate {
    pub module: ModuleName,
    pub version: u64,
    pub actions: Vec<IndexAction>,
    pub exports: Vec<ExportUpdate>,
    pub suggestions: Vec<SuggestionUpdate>,
}

impl IndexUpdate {
    /// Compute the update leading from `old` to `new`.
    ///
    /// Without an old IR, the module was never indexed: the update cleans the
    /// module and adds everything.
    pub fn diff(version: u64, old: Option<&ModuleIr>, new: &ModuleIr) -> Self {
        let key = |s: &Suggestion| (s.self_type.clone(), s.name.clone());
        let before: IndexMap<_, _> = old
            .map(Suggestion::of)
            .unwrap_or_default()
            .into_iter()
            .map(|s| (key(&s), s))
            .collect();
        let after: IndexMap<_, _> =
            Suggestion::of(new).into_iter().map(|s| (key(&s), s)).collect();

        let mut suggestions = vec![];
        for (k, s) in &before {
            if !after.contains_key(k) {
                suggestions.push(SuggestionUpdate::Removed(s.clone()));
            }
        }
        for (k, s) in &after {
            match before.get(k) {
                None => suggestions.push(SuggestionUpdate::Added(s.clone())),
                Some(prev) if fingerprint(prev) != fingerprint(s) => {
                    let (old, new) = (prev.clone(), s.clone());
                    suggestions.push(SuggestionUpdate::Modified { old, new })
                }
                Some(_) => {}
            }
        }

        let old_exports = old.map(ModuleIr::exports).unwrap_or_default();
        let mut exports: Vec<ExportUpdate> = old_exports
            .iter()
            .filter(|e| !new.exports().contains(e))
            .map(|e| ExportUpdate::Removed(e.clone()))
            .collect();
        exports.extend(
            new.exports()
                .iter()
                .filter(|e| !old_exports.contains(e))
                .map(|e| ExportUpdate::Added(e.clone())),
        );

        let actions = match old {
            None => vec![IndexAction::CleanModule(new.name().clone())],
            Some(_) => vec![],
        };

        Self { module: new.name().clone(), version, actions, exports, suggestions }
    }

    /// Whether applying the update would change nothing.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.exports.is_empty() && self.suggestions.is_empty()
    }
}

/// The external symbol index. Accepts updates and never calls back.
pub trait SymbolIndex: Send + Sync {
    fn apply(&self, update: &IndexUpdate);
}

/// An index that ignores all updates.
pub struct NoIndex;

impl SymbolIndex for NoIndex {
    fn apply(&self, _: &IndexUpdate) {}
}
