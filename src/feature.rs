use std::fmt;

use geo_types::{Coord, Rect};

use crate::cell::{CellExtent, CellIndex};
use crate::tags::EncodedTags;

pub type FeatureId = u64;

/// The three indexed object kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureKind {
    Node,
    Way,
    Relation,
}

impl FeatureKind {
    pub const ALL: [FeatureKind; 3] = [FeatureKind::Node, FeatureKind::Way, FeatureKind::Relation];

    /// Directory name under `grid-index/`.
    pub fn dir_name(&self) -> &'static str {
        match self {
            FeatureKind::Node => "node",
            FeatureKind::Way => "way",
            FeatureKind::Relation => "relation",
        }
    }
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// One resolved point of a way's polyline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WayNode {
    pub id: FeatureId,
    pub lon: f32,
    pub lat: f32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Node {
    pub id: FeatureId,
    pub lon: f32,
    pub lat: f32,
    pub tags: EncodedTags,
    /// Ways this node belongs to, filled by the enrichment pass.
    pub way_ids: Vec<FeatureId>,
    /// Relations this node belongs to, filled by the enrichment pass.
    pub relation_ids: Vec<FeatureId>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Way {
    pub id: FeatureId,
    pub tags: EncodedTags,
    pub nodes: Vec<WayNode>,
    /// Relations this way belongs to, filled by the enrichment pass.
    pub relation_ids: Vec<FeatureId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    pub id: FeatureId,
    /// Union bounding box of the resolved members, the relation's proxy
    /// geometry.
    pub bound: Rect<f32>,
    pub tags: EncodedTags,
    pub node_ids: Vec<FeatureId>,
    pub way_ids: Vec<FeatureId>,
    pub child_relation_ids: Vec<FeatureId>,
    /// Relations this relation belongs to, filled by the enrichment pass.
    pub parent_relation_ids: Vec<FeatureId>,
}

/// Capabilities shared by every object kind.
pub trait Element {
    fn id(&self) -> FeatureId;
    fn tags(&self) -> &EncodedTags;
    /// Axis-aligned bounding box in degree space.
    fn bound(&self) -> Rect<f64>;

    fn has_key(&self, key_id: u32) -> bool {
        self.tags().has_key(key_id)
    }

    fn has_tag(&self, key_id: u32, value_id: u32) -> bool {
        self.tags().value_id(key_id) == Some(value_id)
    }
}

impl Element for Node {
    fn id(&self) -> FeatureId {
        self.id
    }

    fn tags(&self) -> &EncodedTags {
        &self.tags
    }

    fn bound(&self) -> Rect<f64> {
        let point = Coord { x: self.lon as f64, y: self.lat as f64 };
        Rect::new(point, point)
    }
}

impl Element for Way {
    fn id(&self) -> FeatureId {
        self.id
    }

    fn tags(&self) -> &EncodedTags {
        &self.tags
    }

    fn bound(&self) -> Rect<f64> {
        bound_of_points(self.nodes.iter().map(|n| (n.lon, n.lat)))
    }
}

impl Element for Relation {
    fn id(&self) -> FeatureId {
        self.id
    }

    fn tags(&self) -> &EncodedTags {
        &self.tags
    }

    fn bound(&self) -> Rect<f64> {
        Rect::new(
            Coord { x: self.bound.min().x as f64, y: self.bound.min().y as f64 },
            Coord { x: self.bound.max().x as f64, y: self.bound.max().y as f64 },
        )
    }
}

pub(crate) fn bound_of_points(points: impl Iterator<Item = (f32, f32)>) -> Rect<f64> {
    let mut bound: Option<Rect<f64>> = None;
    for (lon, lat) in points {
        let point = Coord { x: lon as f64, y: lat as f64 };
        bound = Some(match bound {
            None => Rect::new(point, point),
            Some(b) => Rect::new(
                Coord { x: b.min().x.min(point.x), y: b.min().y.min(point.y) },
                Coord { x: b.max().x.max(point.x), y: b.max().y.max(point.y) },
            ),
        });
    }
    bound.unwrap_or(Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 0.0, y: 0.0 }))
}

/// A decoded object of any kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Feature {
    Node(Node),
    Way(Way),
    Relation(Relation),
}

impl Feature {
    pub fn kind(&self) -> FeatureKind {
        match self {
            Feature::Node(_) => FeatureKind::Node,
            Feature::Way(_) => FeatureKind::Way,
            Feature::Relation(_) => FeatureKind::Relation,
        }
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Feature::Node(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_way(&self) -> Option<&Way> {
        match self {
            Feature::Way(way) => Some(way),
            _ => None,
        }
    }

    pub fn as_relation(&self) -> Option<&Relation> {
        match self {
            Feature::Relation(relation) => Some(relation),
            _ => None,
        }
    }

    /// The cells this feature was written into: a node its own cell, a way
    /// every cell one of its nodes falls in, a relation every cell its
    /// bounding box covers.
    pub fn cells(&self, width: f64, height: f64) -> Vec<CellIndex> {
        match self {
            Feature::Node(node) => {
                vec![CellIndex::of_point(node.lon as f64, node.lat as f64, width, height)]
            }
            Feature::Way(way) => {
                let mut cells: Vec<_> = way
                    .nodes
                    .iter()
                    .map(|n| CellIndex::of_point(n.lon as f64, n.lat as f64, width, height))
                    .collect();
                cells.sort_unstable();
                cells.dedup();
                cells
            }
            Feature::Relation(_) => {
                CellExtent::of_rect(&self.bound(), width, height).cells().collect()
            }
        }
    }
}

impl Element for Feature {
    fn id(&self) -> FeatureId {
        match self {
            Feature::Node(node) => node.id,
            Feature::Way(way) => way.id,
            Feature::Relation(relation) => relation.id,
        }
    }

    fn tags(&self) -> &EncodedTags {
        match self {
            Feature::Node(node) => &node.tags,
            Feature::Way(way) => &way.tags,
            Feature::Relation(relation) => &relation.tags,
        }
    }

    fn bound(&self) -> Rect<f64> {
        match self {
            Feature::Node(node) => node.bound(),
            Feature::Way(way) => way.bound(),
            Feature::Relation(relation) => relation.bound(),
        }
    }
}
