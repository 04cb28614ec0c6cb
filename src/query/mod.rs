//! The query engine: a parsed query is a list of statements, each one a
//! location, a query type and a filter tree evaluated against the grid
//! index.

use geo_types::Rect;
use roaring::RoaringTreemap;

use crate::dictionary::TagDictionary;
use crate::feature::{Element, Feature, FeatureKind};
use crate::reader::GridReader;
use crate::Result;

mod filter;
mod parser;

pub use filter::{CompareOp, FilterExpr, SubStatement};

use filter::ExecContext;

/// What a statement (or sub-statement) asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    Nodes,
    Ways,
    Relations,
    /// Only meaningful inside a relation context, where it selects the
    /// child relations instead of the parents.
    ChildRelations,
}

impl QueryType {
    /// The object kind backing this query type.
    pub fn kind(self) -> FeatureKind {
        match self {
            QueryType::Nodes => FeatureKind::Node,
            QueryType::Ways => FeatureKind::Way,
            QueryType::Relations | QueryType::ChildRelations => FeatureKind::Relation,
        }
    }
}

impl std::fmt::Display for QueryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            QueryType::Nodes => "nodes",
            QueryType::Ways => "ways",
            QueryType::Relations => "relations",
            QueryType::ChildRelations => "child_relations",
        })
    }
}

/// Where a top-level statement looks for candidates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LocationExpr {
    Bbox(Rect<f64>),
}

impl LocationExpr {
    fn get_features(&self, reader: &GridReader, kind: FeatureKind) -> crate::reader::FeatureStream {
        match self {
            LocationExpr::Bbox(bbox) => reader.query_bbox(*bbox, kind),
        }
    }
}

/// `Location . QueryType { Filter }`, the unit of query execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub location: LocationExpr,
    pub query_type: QueryType,
    pub filter: FilterExpr,
    /// Number of sub-statement instances in the filter tree.
    pub(crate) slots: usize,
}

impl Statement {
    /// Stream candidates from the location and keep those the filter
    /// accepts. Sub-statement caches live for this one call. Ways and
    /// relations reside in every cell they touch; the id set keeps them
    /// from being emitted once per cell.
    pub fn execute(&self, reader: &GridReader, out: &mut Vec<Feature>) -> Result<()> {
        let mut ctx = ExecContext::new(reader, self.slots);
        let mut emitted = RoaringTreemap::new();
        for batch in self.location.get_features(reader, self.query_type.kind()) {
            let (_, features) = batch?;
            for feature in features {
                if !emitted.contains(feature.id()) && self.filter.applies(&feature, &mut ctx)? {
                    emitted.insert(feature.id());
                    out.push(feature);
                }
            }
        }
        Ok(())
    }
}

/// A parsed query: one or more top-level statements.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub statements: Vec<Statement>,
}

impl Query {
    /// Parse and compile a query string against the dictionary. Filter
    /// literals are translated to ids here; strings the dictionary never
    /// saw compile to filters that match nothing.
    pub fn parse(input: &str, dictionary: &TagDictionary) -> Result<Query> {
        parser::parse_query(input, dictionary)
    }

    /// Run every statement and concatenate their matches. Output order
    /// is per-cell grouped, cells interleaved by worker.
    pub fn execute(&self, reader: &GridReader) -> Result<Vec<Feature>> {
        let mut out = Vec::new();
        for statement in &self.statements {
            statement.execute(reader, &mut out)?;
        }
        Ok(out)
    }
}
