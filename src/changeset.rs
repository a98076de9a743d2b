//! Applying text edits and finding the IR nodes they touch.

use std::ops::Range;

use rustc_hash::FxHashSet;

use crate::error::{Error, Result};
use crate::ir::{ModuleIr, NodeId};

/// Replaces a byte range of a source with new text.
///
/// Edits of one batch are applied in order; each range is expressed in the
/// coordinates of the text produced by the previous edits.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct TextEdit {
    pub range: Range<usize>,
    pub text: String,
}

impl TextEdit {
    pub fn new(range: Range<usize>, text: &str) -> Self {
        Self { range, text: text.into() }
    }
}

/// The result of applying a batch of edits to a module source.
#[derive(Debug, Clone, Default)]
pub struct Changeset {
    /// The source before the edits.
    pub before: String,
    /// The source after the edits.
    pub after: String,
    /// The edited ranges in the coordinates of `before`.
    pub ranges: Vec<Range<usize>>,
    /// The innermost nodes of the old IR whose text was edited.
    pub changed: FxHashSet<NodeId>,
}

impl Changeset {
    /// Apply the edits and compute what they touched in `old`.
    ///
    /// Fails without applying anything if any range is out of bounds or does
    /// not fall on character boundaries.
    pub fn compute(before: &str, edits: &[TextEdit], old: Option<&ModuleIr>) -> Result<Self> {
        let mut after = before.to_string();
        let mut applied: Vec<(usize, usize, usize)> = Vec::with_capacity(edits.len());
        let mut ranges = Vec::with_capacity(edits.len());

        for edit in edits {
            let Range { start, end } = edit.range.clone();
            if start > end
                || end > after.len()
                || !after.is_char_boundary(start)
                || !after.is_char_boundary(end)
            {
                return Err(Error::InvalidEdit { range: edit.range.clone(), len: after.len() });
            }

            ranges.push(map_back(start, &applied, false)..map_back(end, &applied, true));
            after.replace_range(start..end, &edit.text);
            applied.push((start, end - start, edit.text.len()));
        }

        let changed = old.map(|ir| touched(ir, &ranges)).unwrap_or_default();
        Ok(Self { before: before.to_string(), after, ranges, changed })
    }

    /// Whether the edits left the text as it was.
    pub fn is_noop(&self) -> bool {
        self.before == self.after
    }
}

/// Map a position through previously applied edits back to the original text.
fn map_back(mut pos: usize, applied: &[(usize, usize, usize)], is_end: bool) -> usize {
    for &(start, old_len, new_len) in applied.iter().rev() {
        if pos >= start + new_len {
            pos = pos - new_len + old_len;
        } else if pos > start {
            pos = if is_end { start + old_len } else { start };
        }
    }
    pos
}

/// The innermost nodes whose span intersects one of the ranges. An empty
/// range touches the nodes it sits in or at the border of.
fn touched(ir: &ModuleIr, ranges: &[Range<usize>]) -> FxHashSet<NodeId> {
    let hits = |span: &Range<usize>| {
        ranges.iter().any(|range| {
            if range.is_empty() {
                span.start <= range.start && range.start <= span.end
            } else {
                span.start < range.end && range.start < span.end
            }
        })
    };

    let matching: FxHashSet<NodeId> = ir
        .node_ids()
        .filter(|&id| ir.node(id).and_then(|info| info.span.as_ref()).is_some_and(&hits))
        .collect();

    let enclosing: FxHashSet<NodeId> = matching
        .iter()
        .filter_map(|&id| ir.node(id).and_then(|info| info.parent))
        .collect();

    matching.difference(&enclosing).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Expr, Method};
    use crate::value::Value;

    // main =
    //     x = 1
    //     x
    const SOURCE: &str = "main =\n    x = 1\n    x";

    fn ir() -> ModuleIr {
        let body = Expr::block(
            2,
            vec![
                Expr::binding(
                    3,
                    Expr::name(4, "x").with_span(11..12),
                    Expr::literal(5, Value::Int(1)).with_span(15..16),
                )
                .with_span(11..16),
            ],
            Expr::name(6, "x").with_span(21..22),
        )
        .with_span(11..22);
        let method = Method::new(1, "Main", "main", &[], body).with_span(0..22);
        ModuleIr::new("Main".into(), vec![method], vec![]).unwrap()
    }

    #[test]
    fn test_edit_literal() {
        let set = Changeset::compute(SOURCE, &[TextEdit::new(15..16, "42")], Some(&ir())).unwrap();
        assert_eq!(set.after, "main =\n    x = 42\n    x");
        assert_eq!(set.ranges, vec![15..16]);
        assert_eq!(set.changed, FxHashSet::from_iter([NodeId(5)]));
    }

    #[test]
    fn test_sequential_edits_map_to_original_coordinates() {
        // The second edit is expressed after the first one grew the text by
        // one byte.
        let edits = [TextEdit::new(15..16, "42"), TextEdit::new(22..23, "x + 1")];
        let set = Changeset::compute(SOURCE, &edits, Some(&ir())).unwrap();
        assert_eq!(set.after, "main =\n    x = 42\n    x + 1");
        assert_eq!(set.ranges, vec![15..16, 21..22]);
        assert_eq!(set.changed, FxHashSet::from_iter([NodeId(5), NodeId(6)]));
    }

    #[test]
    fn test_insertion_touches_enclosing_node() {
        let set = Changeset::compute(SOURCE, &[TextEdit::new(16..16, "0")], Some(&ir())).unwrap();
        assert_eq!(set.after, "main =\n    x = 10\n    x");
        assert_eq!(set.changed, FxHashSet::from_iter([NodeId(5)]));
    }

    #[test]
    fn test_invalid_edit() {
        let err = Changeset::compute(SOURCE, &[TextEdit::new(20..40, "")], None).unwrap_err();
        assert_eq!(err, Error::InvalidEdit { range: 20..40, len: SOURCE.len() });
        let err = Changeset::compute("ä", &[TextEdit::new(1..2, "")], None).unwrap_err();
        assert!(matches!(err, Error::InvalidEdit { .. }));
    }
}
