//! Binary cell-record codecs.
//!
//! One self-delimited record per object, little-endian throughout. The
//! key bit-vector is stored as its trimmed prefix, value-ids as 3-byte
//! integers, and every array is preceded by a u16 count, so a record can
//! be walked without sentinels.

use std::io::{self, Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use geo_types::{Coord, Rect};

use crate::cell::CellIndex;
use crate::feature::{Element, Feature, FeatureKind, Node, Relation, Way, WayNode};
use crate::tags::{self, EncodedTags};
use crate::{Error, Result};

/// Fail before writing a record whose array lengths overflow the u16
/// counts of the layout.
pub(crate) fn check_counts(feature: &Feature) -> Result<()> {
    let check = |len: usize, what: &'static str| {
        if len > u16::MAX as usize {
            Err(Error::OversizedRecord { kind: feature.kind(), id: feature.id(), what })
        } else {
            Ok(())
        }
    };
    check(feature.tags().keys.len(), "key byte")?;
    check(feature.tags().values.len(), "value")?;
    match feature {
        Feature::Node(node) => {
            check(node.way_ids.len(), "way id")?;
            check(node.relation_ids.len(), "relation id")?;
        }
        Feature::Way(way) => {
            check(way.nodes.len(), "node")?;
            check(way.relation_ids.len(), "relation id")?;
        }
        Feature::Relation(relation) => {
            check(relation.node_ids.len(), "node id")?;
            check(relation.way_ids.len(), "way id")?;
            check(relation.child_relation_ids.len(), "child relation id")?;
            check(relation.parent_relation_ids.len(), "parent relation id")?;
        }
    }
    Ok(())
}

pub(crate) fn write_feature<W: Write>(writer: &mut W, feature: &Feature) -> io::Result<()> {
    match feature {
        Feature::Node(node) => write_node(writer, node),
        Feature::Way(way) => write_way(writer, way),
        Feature::Relation(relation) => write_relation(writer, relation),
    }
}

fn write_tags<W: Write>(writer: &mut W, tags: &EncodedTags) -> io::Result<()> {
    writer.write_all(&tags.keys)?;
    for &value_id in &tags.values {
        writer.write_u24::<LittleEndian>(value_id)?;
    }
    Ok(())
}

fn write_ids<W: Write>(writer: &mut W, ids: &[u64]) -> io::Result<()> {
    for &id in ids {
        writer.write_u64::<LittleEndian>(id)?;
    }
    Ok(())
}

fn write_node<W: Write>(writer: &mut W, node: &Node) -> io::Result<()> {
    writer.write_u64::<LittleEndian>(node.id)?;
    writer.write_f32::<LittleEndian>(node.lon)?;
    writer.write_f32::<LittleEndian>(node.lat)?;
    writer.write_u16::<LittleEndian>(node.tags.keys.len() as u16)?;
    writer.write_u16::<LittleEndian>(node.tags.values.len() as u16)?;
    writer.write_u16::<LittleEndian>(node.way_ids.len() as u16)?;
    writer.write_u16::<LittleEndian>(node.relation_ids.len() as u16)?;
    write_tags(writer, &node.tags)?;
    write_ids(writer, &node.way_ids)?;
    write_ids(writer, &node.relation_ids)
}

fn write_way<W: Write>(writer: &mut W, way: &Way) -> io::Result<()> {
    writer.write_u64::<LittleEndian>(way.id)?;
    writer.write_u16::<LittleEndian>(way.tags.keys.len() as u16)?;
    writer.write_u16::<LittleEndian>(way.tags.values.len() as u16)?;
    writer.write_u16::<LittleEndian>(way.nodes.len() as u16)?;
    writer.write_u16::<LittleEndian>(way.relation_ids.len() as u16)?;
    write_tags(writer, &way.tags)?;
    for node in &way.nodes {
        writer.write_u64::<LittleEndian>(node.id)?;
        writer.write_f32::<LittleEndian>(node.lon)?;
        writer.write_f32::<LittleEndian>(node.lat)?;
    }
    write_ids(writer, &way.relation_ids)
}

fn write_relation<W: Write>(writer: &mut W, relation: &Relation) -> io::Result<()> {
    writer.write_u64::<LittleEndian>(relation.id)?;
    writer.write_f32::<LittleEndian>(relation.bound.min().x)?;
    writer.write_f32::<LittleEndian>(relation.bound.min().y)?;
    writer.write_f32::<LittleEndian>(relation.bound.max().x)?;
    writer.write_f32::<LittleEndian>(relation.bound.max().y)?;
    writer.write_u16::<LittleEndian>(relation.tags.keys.len() as u16)?;
    writer.write_u16::<LittleEndian>(relation.tags.values.len() as u16)?;
    writer.write_u16::<LittleEndian>(relation.node_ids.len() as u16)?;
    writer.write_u16::<LittleEndian>(relation.way_ids.len() as u16)?;
    writer.write_u16::<LittleEndian>(relation.child_relation_ids.len() as u16)?;
    writer.write_u16::<LittleEndian>(relation.parent_relation_ids.len() as u16)?;
    write_tags(writer, &relation.tags)?;
    write_ids(writer, &relation.node_ids)?;
    write_ids(writer, &relation.way_ids)?;
    write_ids(writer, &relation.child_relation_ids)?;
    write_ids(writer, &relation.parent_relation_ids)
}

fn read_tags(cursor: &mut Cursor<&[u8]>, num_key_bytes: u16, num_values: u16) -> io::Result<EncodedTags> {
    let mut keys = vec![0u8; num_key_bytes as usize];
    cursor.read_exact(&mut keys)?;
    let mut values = Vec::with_capacity(num_values as usize);
    for _ in 0..num_values {
        values.push(cursor.read_u24::<LittleEndian>()?);
    }
    Ok(EncodedTags { keys, values })
}

fn read_ids(cursor: &mut Cursor<&[u8]>, count: u16) -> io::Result<Vec<u64>> {
    let mut ids = Vec::with_capacity(count as usize);
    for _ in 0..count {
        ids.push(cursor.read_u64::<LittleEndian>()?);
    }
    Ok(ids)
}

fn read_node(cursor: &mut Cursor<&[u8]>) -> io::Result<Node> {
    let id = cursor.read_u64::<LittleEndian>()?;
    let lon = cursor.read_f32::<LittleEndian>()?;
    let lat = cursor.read_f32::<LittleEndian>()?;
    let num_key_bytes = cursor.read_u16::<LittleEndian>()?;
    let num_values = cursor.read_u16::<LittleEndian>()?;
    let num_way_ids = cursor.read_u16::<LittleEndian>()?;
    let num_relation_ids = cursor.read_u16::<LittleEndian>()?;
    let tags = read_tags(cursor, num_key_bytes, num_values)?;
    let way_ids = read_ids(cursor, num_way_ids)?;
    let relation_ids = read_ids(cursor, num_relation_ids)?;
    Ok(Node { id, lon, lat, tags, way_ids, relation_ids })
}

fn read_way(cursor: &mut Cursor<&[u8]>) -> io::Result<Way> {
    let id = cursor.read_u64::<LittleEndian>()?;
    let num_key_bytes = cursor.read_u16::<LittleEndian>()?;
    let num_values = cursor.read_u16::<LittleEndian>()?;
    let num_nodes = cursor.read_u16::<LittleEndian>()?;
    let num_relation_ids = cursor.read_u16::<LittleEndian>()?;
    let tags = read_tags(cursor, num_key_bytes, num_values)?;
    let mut nodes = Vec::with_capacity(num_nodes as usize);
    for _ in 0..num_nodes {
        let id = cursor.read_u64::<LittleEndian>()?;
        let lon = cursor.read_f32::<LittleEndian>()?;
        let lat = cursor.read_f32::<LittleEndian>()?;
        nodes.push(WayNode { id, lon, lat });
    }
    let relation_ids = read_ids(cursor, num_relation_ids)?;
    Ok(Way { id, tags, nodes, relation_ids })
}

fn read_relation(cursor: &mut Cursor<&[u8]>) -> io::Result<Relation> {
    let id = cursor.read_u64::<LittleEndian>()?;
    let min_lon = cursor.read_f32::<LittleEndian>()?;
    let min_lat = cursor.read_f32::<LittleEndian>()?;
    let max_lon = cursor.read_f32::<LittleEndian>()?;
    let max_lat = cursor.read_f32::<LittleEndian>()?;
    let num_key_bytes = cursor.read_u16::<LittleEndian>()?;
    let num_values = cursor.read_u16::<LittleEndian>()?;
    let num_nodes = cursor.read_u16::<LittleEndian>()?;
    let num_ways = cursor.read_u16::<LittleEndian>()?;
    let num_child_rels = cursor.read_u16::<LittleEndian>()?;
    let num_parent_rels = cursor.read_u16::<LittleEndian>()?;
    let tags = read_tags(cursor, num_key_bytes, num_values)?;
    let node_ids = read_ids(cursor, num_nodes)?;
    let way_ids = read_ids(cursor, num_ways)?;
    let child_relation_ids = read_ids(cursor, num_child_rels)?;
    let parent_relation_ids = read_ids(cursor, num_parent_rels)?;
    Ok(Relation {
        id,
        bound: Rect::new(
            Coord { x: min_lon, y: min_lat },
            Coord { x: max_lon, y: max_lat },
        ),
        tags,
        node_ids,
        way_ids,
        child_relation_ids,
        parent_relation_ids,
    })
}

/// Sequential walk over one cell file's bytes.
///
/// A record that decodes completely but breaks the keys/values invariant
/// yields an error and the walk continues; a record cut short by the end
/// of the buffer yields an error and ends the walk.
pub(crate) struct CellDecoder<'a> {
    cursor: Cursor<&'a [u8]>,
    kind: FeatureKind,
    cell: CellIndex,
    done: bool,
}

impl<'a> CellDecoder<'a> {
    pub(crate) fn new(buffer: &'a [u8], kind: FeatureKind, cell: CellIndex) -> Self {
        Self { cursor: Cursor::new(buffer), kind, cell, done: false }
    }

    fn corrupt(&self, message: impl Into<String>) -> Error {
        Error::Corrupt { kind: self.kind, cell: self.cell, message: message.into() }
    }
}

impl Iterator for CellDecoder<'_> {
    type Item = Result<Feature>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.cursor.position() == self.cursor.get_ref().len() as u64 {
            return None;
        }
        let feature = match self.kind {
            FeatureKind::Node => read_node(&mut self.cursor).map(Feature::Node),
            FeatureKind::Way => read_way(&mut self.cursor).map(Feature::Way),
            FeatureKind::Relation => read_relation(&mut self.cursor).map(Feature::Relation),
        };
        let feature = match feature {
            Ok(feature) => feature,
            Err(err) => {
                self.done = true;
                return Some(Err(self.corrupt(format!("truncated record: {err}"))));
            }
        };
        let tags = feature.tags();
        if tags::popcount(&tags.keys) != tags.values.len() {
            return Some(Err(self.corrupt(format!(
                "record {}: keys popcount {} != {} values",
                feature.id(),
                tags::popcount(&tags.keys),
                tags.values.len(),
            ))));
        }
        Some(Ok(feature))
    }
}
