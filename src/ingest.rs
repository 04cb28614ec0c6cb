//! Ingestion-side collaborators.
//!
//! The stream decoder is an external component; this module fixes the
//! typed records it produces ([`RawElement`]) and the plumbing the import
//! needs around it: a temp spool holding the raw stream per kind (tags can
//! only be encoded once the dictionary is finalized, which requires a full
//! first pass), and the density aggregator tracking per-cell node counts
//! and the world extent of the ingest.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use intmap::IntMap;
use tempfile::TempDir;

use crate::cell::{CellExtent, CellIndex};
use crate::{Error, Result};

pub type RawTags = Vec<(String, String)>;

#[derive(Debug, Clone, PartialEq)]
pub struct RawNode {
    pub id: u64,
    pub lon: f64,
    pub lat: f64,
    pub tags: RawTags,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawWay {
    pub id: u64,
    pub node_ids: Vec<u64>,
    pub tags: RawTags,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawRelation {
    pub id: u64,
    pub node_ids: Vec<u64>,
    pub way_ids: Vec<u64>,
    pub relation_ids: Vec<u64>,
    pub tags: RawTags,
}

/// One typed record of the input stream.
#[derive(Debug, Clone, PartialEq)]
pub enum RawElement {
    Node(RawNode),
    Way(RawWay),
    Relation(RawRelation),
}

impl RawElement {
    pub fn tags(&self) -> &RawTags {
        match self {
            RawElement::Node(node) => &node.tags,
            RawElement::Way(way) => &way.tags,
            RawElement::Relation(relation) => &relation.tags,
        }
    }
}

/// The interface of the stream decoder collaborator. Members of a
/// relation are expected before the relation itself.
pub trait ElementSource {
    fn read_elements(&mut self, sink: &mut dyn FnMut(RawElement) -> Result<()>) -> Result<()>;
}

/// In-memory source, mostly useful in tests.
impl ElementSource for Vec<RawElement> {
    fn read_elements(&mut self, sink: &mut dyn FnMut(RawElement) -> Result<()>) -> Result<()> {
        for element in self.drain(..) {
            sink(element)?;
        }
        Ok(())
    }
}

/// Per-cell node counts plus the extent of everything seen.
#[derive(Debug)]
pub struct DensityAggregator {
    cell_width: f64,
    cell_height: f64,
    counts: IntMap<u64, u64>,
    extent: Option<CellExtent>,
}

impl DensityAggregator {
    pub fn new(cell_width: f64, cell_height: f64) -> Self {
        Self { cell_width, cell_height, counts: IntMap::new(), extent: None }
    }

    pub fn record(&mut self, lon: f64, lat: f64) {
        let cell = CellIndex::of_point(lon, lat, self.cell_width, self.cell_height);
        match self.counts.get_mut(cell.pack()) {
            Some(count) => *count += 1,
            None => {
                self.counts.insert(cell.pack(), 1);
            }
        }
        self.extent = Some(match self.extent {
            None => CellExtent::of_cell(cell),
            Some(extent) => extent.expand(cell),
        });
    }

    pub fn node_count(&self, cell: CellIndex) -> u64 {
        self.counts.get(cell.pack()).copied().unwrap_or(0)
    }

    /// The minimal extent covering every recorded node, `None` for an
    /// empty ingest.
    pub fn world_extent(&self) -> Option<CellExtent> {
        self.extent
    }
}

/// Temp spool of the raw stream, one file per kind.
pub struct RawFeatureRepository {
    dir: TempDir,
    nodes: SpoolWriter,
    ways: SpoolWriter,
    relations: SpoolWriter,
    node_count: u64,
    way_count: u64,
    relation_count: u64,
}

impl RawFeatureRepository {
    pub fn create() -> Result<Self> {
        let dir = tempfile::tempdir().map_err(Error::io("raw-feature-spool"))?;
        let nodes = SpoolWriter::create(dir.path().join("nodes.raw"))?;
        let ways = SpoolWriter::create(dir.path().join("ways.raw"))?;
        let relations = SpoolWriter::create(dir.path().join("relations.raw"))?;
        Ok(Self { dir, nodes, ways, relations, node_count: 0, way_count: 0, relation_count: 0 })
    }

    pub fn append(&mut self, element: &RawElement) -> Result<()> {
        match element {
            RawElement::Node(node) => {
                self.node_count += 1;
                self.nodes.write(|w| {
                    w.write_u64::<LittleEndian>(node.id)?;
                    w.write_f64::<LittleEndian>(node.lon)?;
                    w.write_f64::<LittleEndian>(node.lat)?;
                    write_raw_tags(w, &node.tags)
                })
            }
            RawElement::Way(way) => {
                self.way_count += 1;
                self.ways.write(|w| {
                    w.write_u64::<LittleEndian>(way.id)?;
                    write_raw_ids(w, &way.node_ids)?;
                    write_raw_tags(w, &way.tags)
                })
            }
            RawElement::Relation(relation) => {
                self.relation_count += 1;
                self.relations.write(|w| {
                    w.write_u64::<LittleEndian>(relation.id)?;
                    write_raw_ids(w, &relation.node_ids)?;
                    write_raw_ids(w, &relation.way_ids)?;
                    write_raw_ids(w, &relation.relation_ids)?;
                    write_raw_tags(w, &relation.tags)
                })
            }
        }
    }

    /// Flush everything and switch to the read side.
    pub fn finish(self) -> Result<RawStreams> {
        let node_path = self.nodes.finish()?;
        let way_path = self.ways.finish()?;
        let relation_path = self.relations.finish()?;
        Ok(RawStreams {
            _dir: self.dir,
            node_path,
            way_path,
            relation_path,
            node_count: self.node_count,
            way_count: self.way_count,
            relation_count: self.relation_count,
        })
    }
}

/// Read side of the spool. The backing temp dir lives as long as this.
pub struct RawStreams {
    _dir: TempDir,
    node_path: PathBuf,
    way_path: PathBuf,
    relation_path: PathBuf,
    node_count: u64,
    way_count: u64,
    relation_count: u64,
}

impl RawStreams {
    pub fn node_count(&self) -> u64 {
        self.node_count
    }

    pub fn way_count(&self) -> u64 {
        self.way_count
    }

    pub fn relation_count(&self) -> u64 {
        self.relation_count
    }

    pub fn nodes(&self) -> Result<impl Iterator<Item = Result<RawNode>> + use<>> {
        SpoolReader::open(self.node_path.clone()).map(|reader| {
            reader.records(|id, r| {
                let lon = r.read_f64::<LittleEndian>()?;
                let lat = r.read_f64::<LittleEndian>()?;
                let tags = read_raw_tags(r)?;
                Ok(RawNode { id, lon, lat, tags })
            })
        })
    }

    pub fn ways(&self) -> Result<impl Iterator<Item = Result<RawWay>> + use<>> {
        SpoolReader::open(self.way_path.clone()).map(|reader| {
            reader.records(|id, r| {
                let node_ids = read_raw_ids(r)?;
                let tags = read_raw_tags(r)?;
                Ok(RawWay { id, node_ids, tags })
            })
        })
    }

    pub fn relations(&self) -> Result<impl Iterator<Item = Result<RawRelation>> + use<>> {
        SpoolReader::open(self.relation_path.clone()).map(|reader| {
            reader.records(|id, r| {
                let node_ids = read_raw_ids(r)?;
                let way_ids = read_raw_ids(r)?;
                let relation_ids = read_raw_ids(r)?;
                let tags = read_raw_tags(r)?;
                Ok(RawRelation { id, node_ids, way_ids, relation_ids, tags })
            })
        })
    }
}

struct SpoolWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl SpoolWriter {
    fn create(path: PathBuf) -> Result<Self> {
        let file = File::create(&path).map_err(Error::io(&path))?;
        Ok(Self { path, writer: BufWriter::new(file) })
    }

    fn write(&mut self, record: impl FnOnce(&mut BufWriter<File>) -> io::Result<()>) -> Result<()> {
        record(&mut self.writer).map_err(Error::io(&self.path))
    }

    fn finish(mut self) -> Result<PathBuf> {
        self.writer.flush().map_err(Error::io(&self.path))?;
        Ok(self.path)
    }
}

struct SpoolReader {
    path: PathBuf,
    reader: BufReader<File>,
}

impl SpoolReader {
    fn open(path: PathBuf) -> Result<Self> {
        let file = File::open(&path).map_err(Error::io(&path))?;
        Ok(Self { path, reader: BufReader::new(file) })
    }

    /// Iterate records decoded by `decode`. Every record starts with its
    /// u64 id, read here so a clean end-of-file between records can be
    /// told apart from a truncated record.
    fn records<T>(
        self,
        decode: impl Fn(u64, &mut BufReader<File>) -> io::Result<T>,
    ) -> impl Iterator<Item = Result<T>> {
        let SpoolReader { path, mut reader } = self;
        let mut done = false;
        std::iter::from_fn(move || {
            if done {
                return None;
            }
            let mut id_bytes = [0u8; 8];
            let mut filled = 0;
            while filled < id_bytes.len() {
                match reader.read(&mut id_bytes[filled..]) {
                    Ok(0) if filled == 0 => {
                        done = true;
                        return None;
                    }
                    Ok(0) => {
                        done = true;
                        let err = io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "truncated spool record",
                        );
                        return Some(Err(Error::io(&path)(err)));
                    }
                    Ok(n) => filled += n,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => {
                        done = true;
                        return Some(Err(Error::io(&path)(err)));
                    }
                }
            }
            let record = decode(u64::from_le_bytes(id_bytes), &mut reader);
            if record.is_err() {
                done = true;
            }
            Some(record.map_err(Error::io(&path)))
        })
    }
}

fn write_raw_tags<W: Write>(writer: &mut W, tags: &RawTags) -> io::Result<()> {
    writer.write_u32::<LittleEndian>(tags.len() as u32)?;
    for (key, value) in tags {
        write_raw_str(writer, key)?;
        write_raw_str(writer, value)?;
    }
    Ok(())
}

fn write_raw_str<W: Write>(writer: &mut W, s: &str) -> io::Result<()> {
    writer.write_u32::<LittleEndian>(s.len() as u32)?;
    writer.write_all(s.as_bytes())
}

fn write_raw_ids<W: Write>(writer: &mut W, ids: &[u64]) -> io::Result<()> {
    writer.write_u32::<LittleEndian>(ids.len() as u32)?;
    for &id in ids {
        writer.write_u64::<LittleEndian>(id)?;
    }
    Ok(())
}

fn read_raw_tags<R: Read>(reader: &mut R) -> io::Result<RawTags> {
    let count = reader.read_u32::<LittleEndian>()?;
    let mut tags = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let key = read_raw_str(reader)?;
        let value = read_raw_str(reader)?;
        tags.push((key, value));
    }
    Ok(tags)
}

fn read_raw_str<R: Read>(reader: &mut R) -> io::Result<String> {
    let len = reader.read_u32::<LittleEndian>()?;
    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

fn read_raw_ids<R: Read>(reader: &mut R) -> io::Result<Vec<u64>> {
    let count = reader.read_u32::<LittleEndian>()?;
    let mut ids = Vec::with_capacity(count as usize);
    for _ in 0..count {
        ids.push(reader.read_u64::<LittleEndian>()?);
    }
    Ok(ids)
}

#[cfg(test)]
mod test {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> RawTags {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn spool_roundtrip() {
        let mut repository = RawFeatureRepository::create().unwrap();
        let node = RawNode { id: 1, lon: 13.4, lat: 52.5, tags: tags(&[("amenity", "bench")]) };
        let way = RawWay { id: 2, node_ids: vec![1, 5, 9], tags: tags(&[("highway", "path")]) };
        let relation = RawRelation {
            id: 3,
            node_ids: vec![1],
            way_ids: vec![2],
            relation_ids: vec![],
            tags: tags(&[("type", "route")]),
        };
        repository.append(&RawElement::Node(node.clone())).unwrap();
        repository.append(&RawElement::Way(way.clone())).unwrap();
        repository.append(&RawElement::Relation(relation.clone())).unwrap();

        let streams = repository.finish().unwrap();
        assert_eq!(streams.node_count(), 1);
        assert_eq!(streams.way_count(), 1);
        assert_eq!(streams.relation_count(), 1);

        let nodes: Vec<_> = streams.nodes().unwrap().map(Result::unwrap).collect();
        assert_eq!(nodes, vec![node]);
        let ways: Vec<_> = streams.ways().unwrap().map(Result::unwrap).collect();
        assert_eq!(ways, vec![way]);
        let relations: Vec<_> = streams.relations().unwrap().map(Result::unwrap).collect();
        assert_eq!(relations, vec![relation]);
    }

    #[test]
    fn spool_streams_are_replayable() {
        let mut repository = RawFeatureRepository::create().unwrap();
        for id in 0..10 {
            let node = RawNode { id, lon: id as f64, lat: 0.0, tags: vec![] };
            repository.append(&RawElement::Node(node)).unwrap();
        }
        let streams = repository.finish().unwrap();
        // two independent passes over the same spool
        assert_eq!(streams.nodes().unwrap().count(), 10);
        assert_eq!(streams.nodes().unwrap().count(), 10);
    }

    #[test]
    fn density_tracks_counts_and_extent() {
        let mut density = DensityAggregator::new(0.1, 0.1);
        assert!(density.world_extent().is_none());
        density.record(0.05, 0.05);
        density.record(0.06, 0.07);
        density.record(1.05, 2.05);
        assert_eq!(density.node_count(CellIndex::new(0, 0)), 2);
        assert_eq!(density.node_count(CellIndex::new(10, 20)), 1);
        assert_eq!(density.node_count(CellIndex::new(5, 5)), 0);
        let extent = density.world_extent().unwrap();
        assert_eq!(extent.lower_left, CellIndex::new(0, 0));
        assert_eq!(extent.upper_right, CellIndex::new(10, 20));
    }
}
