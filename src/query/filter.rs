use std::collections::HashSet;

use roaring::RoaringTreemap;

use crate::cell::CellIndex;
use crate::feature::{Element, Feature, FeatureKind};
use crate::query::QueryType;
use crate::reader::GridReader;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A compiled filter tree. Tag and key conditions reference dictionary
/// ids; condition strings unknown to the dictionary compile to [`Never`]
/// (an empty result, not an error).
///
/// [`Never`]: FilterExpr::Never
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    /// Compare the object's value-id for `key` against `value`. An object
    /// without the key never matches, whatever the operator.
    Tag { key: u32, value: u32, op: CompareOp },
    /// Key presence (or absence, with `present: false`).
    Key { key: u32, present: bool },
    /// Matches nothing.
    Never,
    Not(Box<FilterExpr>),
    And(Box<FilterExpr>, Box<FilterExpr>),
    Or(Box<FilterExpr>, Box<FilterExpr>),
    Sub(SubStatement),
}

/// A nested statement used as a predicate: true iff the context object
/// is related to at least one object matching the inner filter. The
/// location is inherited from the context's own cells.
#[derive(Debug, Clone, PartialEq)]
pub struct SubStatement {
    pub query_type: QueryType,
    pub filter: Box<FilterExpr>,
    /// Index into the per-execution state table.
    pub(crate) slot: usize,
}

/// Per-execution state: one visited-cell set and one matched-id cache per
/// sub-statement instance.
pub(crate) struct ExecContext<'a> {
    reader: &'a GridReader,
    states: Vec<SubState>,
}

#[derive(Default)]
struct SubState {
    visited: HashSet<CellIndex>,
    matches: RoaringTreemap,
}

impl<'a> ExecContext<'a> {
    pub(crate) fn new(reader: &'a GridReader, slots: usize) -> Self {
        let states = (0..slots).map(|_| SubState::default()).collect();
        Self { reader, states }
    }
}

impl FilterExpr {
    /// Whether `feature` satisfies the filter. `And` short-circuits on a
    /// false left side, `Or` on a true one; no operand reordering.
    pub(crate) fn applies(&self, feature: &Feature, ctx: &mut ExecContext) -> Result<bool> {
        match self {
            FilterExpr::Tag { key, value, op } => {
                let Some(actual) = feature.tags().value_id(*key) else {
                    return Ok(false);
                };
                Ok(match op {
                    CompareOp::Eq => actual == *value,
                    CompareOp::Ne => actual != *value,
                    CompareOp::Lt => actual < *value,
                    CompareOp::Le => actual <= *value,
                    CompareOp::Gt => actual > *value,
                    CompareOp::Ge => actual >= *value,
                })
            }
            FilterExpr::Key { key, present } => Ok(feature.has_key(*key) == *present),
            FilterExpr::Never => Ok(false),
            FilterExpr::Not(inner) => Ok(!inner.applies(feature, ctx)?),
            FilterExpr::And(a, b) => Ok(a.applies(feature, ctx)? && b.applies(feature, ctx)?),
            FilterExpr::Or(a, b) => Ok(a.applies(feature, ctx)? || b.applies(feature, ctx)?),
            FilterExpr::Sub(sub) => sub.applies(feature, ctx),
        }
    }
}

impl SubStatement {
    fn applies(&self, feature: &Feature, ctx: &mut ExecContext) -> Result<bool> {
        let related = related_ids(feature, self.query_type)?;
        if related.is_empty() {
            return Ok(false);
        }

        // Candidate cells come from the context's geometry, minus what
        // this instance already pulled in.
        let candidates: Vec<CellIndex> = feature
            .cells(ctx.reader.cell_width(), ctx.reader.cell_height())
            .into_iter()
            .filter(|cell| !ctx.states[self.slot].visited.contains(cell))
            .collect();
        if !candidates.is_empty() {
            let stream = ctx.reader.query_cells(candidates.clone(), self.query_type.kind());
            for batch in stream {
                let (_, features) = batch?;
                for inner in features {
                    if self.filter.applies(&inner, ctx)? {
                        ctx.states[self.slot].matches.insert(inner.id());
                    }
                }
            }
            ctx.states[self.slot].visited.extend(candidates);
        }

        let matches = &ctx.states[self.slot].matches;
        Ok(related.iter().any(|id| matches.contains(*id)))
    }
}

/// The ids of the context's related objects for the requested inner
/// query type; which list applies depends on the pair of kinds.
fn related_ids(feature: &Feature, query_type: QueryType) -> Result<Vec<u64>> {
    match (feature, query_type) {
        (Feature::Node(node), QueryType::Ways) => Ok(node.way_ids.clone()),
        (Feature::Node(node), QueryType::Relations) => Ok(node.relation_ids.clone()),
        (Feature::Way(way), QueryType::Nodes) => Ok(way.nodes.iter().map(|n| n.id).collect()),
        (Feature::Way(way), QueryType::Relations) => Ok(way.relation_ids.clone()),
        (Feature::Relation(relation), QueryType::Nodes) => Ok(relation.node_ids.clone()),
        (Feature::Relation(relation), QueryType::Ways) => Ok(relation.way_ids.clone()),
        (Feature::Relation(relation), QueryType::Relations) => {
            Ok(relation.parent_relation_ids.clone())
        }
        (Feature::Relation(relation), QueryType::ChildRelations) => {
            Ok(relation.child_relation_ids.clone())
        }
        _ => Err(invalid_pairing(feature.kind(), query_type)),
    }
}

pub(crate) fn pairing_is_valid(context: FeatureKind, query_type: QueryType) -> bool {
    matches!(
        (context, query_type),
        (FeatureKind::Node, QueryType::Ways)
            | (FeatureKind::Node, QueryType::Relations)
            | (FeatureKind::Way, QueryType::Nodes)
            | (FeatureKind::Way, QueryType::Relations)
            | (FeatureKind::Relation, _)
    )
}

pub(crate) fn invalid_pairing(context: FeatureKind, query_type: QueryType) -> Error {
    Error::QuerySemantics(format!(
        "a {context} context cannot nest a `{query_type}` sub-statement"
    ))
}
