use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread;

use geo::Intersects;
use geo_types::{Coord, Rect};
use intmap::IntMap;
use steppe::Progress;

use crate::cell::{CellExtent, CellIndex};
use crate::codec;
use crate::dictionary::TagDictionary;
use crate::feature::{Element, Feature, FeatureKind, Node, Relation, Way, WayNode};
use crate::ingest::{RawRelation, RawStreams, RawTags, RawWay};
use crate::{
    cell_file_path, AtomicCellStep, AtomicItemStep, Error, ImportSteps, IndexConfig, Result,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportStats {
    pub nodes: u64,
    pub ways: u64,
    pub relations: u64,
    pub skipped_ways: u64,
    pub skipped_relations: u64,
    /// Distinct grid cells holding at least one record.
    pub cells: u64,
}

/// Builds the on-disk grid index from the spooled raw streams.
///
/// Phase 1 splits every object into the cell files it touches, phase 2
/// re-reads each cell and fills in the reverse references (node → ways,
/// node/way/relation → relations). The dictionary must be finalized.
pub struct GridWriter<'a> {
    config: &'a IndexConfig,
    dictionary: &'a TagDictionary,
    ingest_extent: Option<CellExtent>,
}

impl<'a> GridWriter<'a> {
    pub fn new(
        config: &'a IndexConfig,
        dictionary: &'a TagDictionary,
        ingest_extent: Option<CellExtent>,
    ) -> Self {
        Self { config, dictionary, ingest_extent }
    }

    pub fn write(
        &self,
        streams: &RawStreams,
        cancel: &(impl Fn() -> bool + Send + Sync),
        progress: &impl Progress,
    ) -> Result<ImportStats> {
        let registry = CellWriters::new(self.config.grid_dir());
        let mut stats = ImportStats::default();

        // Node and way coordinates resolve against these while streaming;
        // the input guarantees members appear before their relation.
        let mut node_coords: IntMap<u64, (f32, f32)> =
            IntMap::with_capacity(streams.node_count() as usize);

        self.write_nodes(streams, &registry, &mut node_coords, &mut stats, cancel, progress)?;
        let way_bounds =
            self.write_ways(streams, &registry, &node_coords, &mut stats, cancel, progress)?;
        self.write_relations(
            streams,
            &registry,
            &node_coords,
            &way_bounds,
            &mut stats,
            cancel,
            progress,
        )?;

        let mut cells: Vec<CellIndex> =
            registry.finish()?.into_iter().map(|(_, cell)| cell).collect();
        cells.sort_unstable();
        cells.dedup();
        stats.cells = cells.len() as u64;

        self.enrich(cells, cancel, progress)?;
        Ok(stats)
    }

    /// Nodes are processed in stream order on one thread.
    fn write_nodes(
        &self,
        streams: &RawStreams,
        registry: &CellWriters,
        node_coords: &mut IntMap<u64, (f32, f32)>,
        stats: &mut ImportStats,
        cancel: &(impl Fn() -> bool + Send + Sync),
        progress: &impl Progress,
    ) -> Result<()> {
        progress.update(ImportSteps::WriteNodes);
        let (atomic, step) = AtomicItemStep::new(streams.node_count());
        progress.update(step);

        let (width, height) = (self.config.cell_width, self.config.cell_height);
        for raw in streams.nodes()? {
            if cancel() {
                return Err(Error::BuildCanceled);
            }
            let raw = raw?;
            node_coords.insert(raw.id, (raw.lon as f32, raw.lat as f32));
            let node = Node {
                id: raw.id,
                lon: raw.lon as f32,
                lat: raw.lat as f32,
                tags: self.encode_tags(&raw.tags)?,
                way_ids: vec![],
                relation_ids: vec![],
            };
            let cell = CellIndex::of_point(raw.lon, raw.lat, width, height);
            let feature = Feature::Node(node);
            codec::check_counts(&feature)?;
            registry.write(FeatureKind::Node, cell, &feature)?;
            stats.nodes += 1;
            atomic.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Ways fan out over a bounded worker pool; each worker resolves the
    /// polyline against the node coordinates and writes into every cell
    /// the way touches.
    fn write_ways(
        &self,
        streams: &RawStreams,
        registry: &CellWriters,
        node_coords: &IntMap<u64, (f32, f32)>,
        stats: &mut ImportStats,
        cancel: &(impl Fn() -> bool + Send + Sync),
        progress: &impl Progress,
    ) -> Result<IntMap<u64, Rect<f32>>> {
        progress.update(ImportSteps::WriteWays);
        let (atomic, step) = AtomicItemStep::new(streams.way_count());
        progress.update(step);

        let way_bounds = Mutex::new(IntMap::with_capacity(streams.way_count() as usize));
        let written = AtomicU64::new(0);
        let skipped = AtomicU64::new(0);
        let (sender, receiver) = crossbeam::channel::bounded::<RawWay>(self.config.workers * 2);

        thread::scope(|scope| -> Result<()> {
            let mut handles = Vec::with_capacity(self.config.workers);
            for _ in 0..self.config.workers {
                let receiver = receiver.clone();
                let way_bounds = &way_bounds;
                let written = &written;
                let skipped = &skipped;
                let atomic = &atomic;
                handles.push(scope.spawn(move || -> Result<()> {
                    for raw in receiver.iter() {
                        if cancel() {
                            return Err(Error::BuildCanceled);
                        }
                        self.write_way(raw, registry, node_coords, way_bounds, written, skipped)?;
                        atomic.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(())
                }));
            }
            drop(receiver);

            let mut feed_error = None;
            for raw in streams.ways()? {
                match raw {
                    // send fails only when every worker already bailed out
                    Ok(way) => {
                        if sender.send(way).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        feed_error = Some(err);
                        break;
                    }
                }
            }
            drop(sender);

            for handle in handles {
                join_worker(handle)?;
            }
            match feed_error {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })?;

        stats.ways = written.into_inner();
        stats.skipped_ways = skipped.into_inner();
        Ok(way_bounds.into_inner().unwrap())
    }

    fn write_way(
        &self,
        raw: RawWay,
        registry: &CellWriters,
        node_coords: &IntMap<u64, (f32, f32)>,
        way_bounds: &Mutex<IntMap<u64, Rect<f32>>>,
        written: &AtomicU64,
        skipped: &AtomicU64,
    ) -> Result<()> {
        let mut nodes = Vec::with_capacity(raw.node_ids.len());
        for &node_id in &raw.node_ids {
            match node_coords.get(node_id) {
                Some(&(lon, lat)) => nodes.push(WayNode { id: node_id, lon, lat }),
                None => log::debug!("way {}: dropping unresolved node {node_id}", raw.id),
            }
        }
        if nodes.is_empty() {
            log::warn!("way {} has no resolvable nodes, skipping", raw.id);
            skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let way = Way {
            id: raw.id,
            tags: self.encode_tags(&raw.tags)?,
            nodes,
            relation_ids: vec![],
        };
        way_bounds.lock().unwrap().insert(raw.id, rect_to_f32(&way.bound()));

        let feature = Feature::Way(way);
        codec::check_counts(&feature)?;
        for cell in feature.cells(self.config.cell_width, self.config.cell_height) {
            registry.write(FeatureKind::Way, cell, &feature)?;
        }
        written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Relations resolve against everything seen so far, single-threaded.
    fn write_relations(
        &self,
        streams: &RawStreams,
        registry: &CellWriters,
        node_coords: &IntMap<u64, (f32, f32)>,
        way_bounds: &IntMap<u64, Rect<f32>>,
        stats: &mut ImportStats,
        cancel: &(impl Fn() -> bool + Send + Sync),
        progress: &impl Progress,
    ) -> Result<()> {
        progress.update(ImportSteps::WriteRelations);
        let (atomic, step) = AtomicItemStep::new(streams.relation_count());
        progress.update(step);

        let (width, height) = (self.config.cell_width, self.config.cell_height);
        let extent_bound = self.ingest_extent.map(|extent| extent.bound(width, height));
        let mut relation_bounds: IntMap<u64, Rect<f32>> = IntMap::new();

        for raw in streams.relations()? {
            if cancel() {
                return Err(Error::BuildCanceled);
            }
            let raw = raw?;
            atomic.fetch_add(1, Ordering::Relaxed);

            let Some(resolved) = resolve_members(&raw, node_coords, way_bounds, &relation_bounds)
            else {
                log::warn!("relation {} has no resolvable members, skipping", raw.id);
                stats.skipped_relations += 1;
                continue;
            };
            // Children record their bound even when the relation itself is
            // skipped below, so later parents still get a geometry.
            relation_bounds.insert(raw.id, resolved.bound);

            if self.config.skip_out_of_extent_relations {
                if let Some(extent_bound) = extent_bound {
                    if !rect_to_f64(&resolved.bound).intersects(&extent_bound) {
                        log::debug!("relation {} is outside the ingest extent, skipping", raw.id);
                        stats.skipped_relations += 1;
                        continue;
                    }
                }
            }

            let relation = Relation {
                id: raw.id,
                bound: resolved.bound,
                tags: self.encode_tags(&raw.tags)?,
                node_ids: resolved.node_ids,
                way_ids: resolved.way_ids,
                child_relation_ids: resolved.relation_ids,
                parent_relation_ids: vec![],
            };
            let feature = Feature::Relation(relation);
            codec::check_counts(&feature)?;
            let cells = CellExtent::of_rect(&rect_to_f64(&resolved.bound), width, height);
            for cell in cells.cells() {
                registry.write(FeatureKind::Relation, cell, &feature)?;
            }
            stats.relations += 1;
        }
        Ok(())
    }

    /// Phase 2: per cell, index the ways and relations stored there and
    /// rewrite all three files with the reverse references filled in.
    fn enrich(
        &self,
        cells: Vec<CellIndex>,
        cancel: &(impl Fn() -> bool + Send + Sync),
        progress: &impl Progress,
    ) -> Result<()> {
        progress.update(ImportSteps::EnrichCells);
        let (atomic, step) = AtomicCellStep::new(cells.len() as u64);
        progress.update(step);

        let (sender, receiver) = crossbeam::channel::unbounded();
        for cell in cells {
            // the receiver outlives every send, this cannot fail
            let _ = sender.send(cell);
        }
        drop(sender);

        thread::scope(|scope| -> Result<()> {
            let mut handles = Vec::with_capacity(self.config.workers);
            for _ in 0..self.config.workers {
                let receiver = receiver.clone();
                let atomic = &atomic;
                handles.push(scope.spawn(move || -> Result<()> {
                    for cell in receiver.iter() {
                        if cancel() {
                            return Err(Error::BuildCanceled);
                        }
                        self.enrich_cell(cell)?;
                        atomic.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(())
                }));
            }
            drop(receiver);
            for handle in handles {
                join_worker(handle)?;
            }
            Ok(())
        })
    }

    fn enrich_cell(&self, cell: CellIndex) -> Result<()> {
        let grid_dir = self.config.grid_dir();
        let node_path = cell_file_path(&grid_dir, FeatureKind::Node, cell);
        let way_path = cell_file_path(&grid_dir, FeatureKind::Way, cell);
        let relation_path = cell_file_path(&grid_dir, FeatureKind::Relation, cell);

        let mut ways: Vec<Way> = read_cell_records(&way_path, FeatureKind::Way, cell)?
            .into_iter()
            .filter_map(|feature| match feature {
                Feature::Way(way) => Some(way),
                _ => None,
            })
            .collect();
        let mut relations: Vec<Relation> =
            read_cell_records(&relation_path, FeatureKind::Relation, cell)?
                .into_iter()
                .filter_map(|feature| match feature {
                    Feature::Relation(relation) => Some(relation),
                    _ => None,
                })
                .collect();

        let mut node_to_ways: IntMap<u64, Vec<u64>> = IntMap::new();
        for way in &ways {
            for node in &way.nodes {
                push_reverse(&mut node_to_ways, node.id, way.id);
            }
        }
        let mut node_to_relations: IntMap<u64, Vec<u64>> = IntMap::new();
        let mut way_to_relations: IntMap<u64, Vec<u64>> = IntMap::new();
        let mut child_to_relations: IntMap<u64, Vec<u64>> = IntMap::new();
        for relation in &relations {
            for &node_id in &relation.node_ids {
                push_reverse(&mut node_to_relations, node_id, relation.id);
            }
            for &way_id in &relation.way_ids {
                push_reverse(&mut way_to_relations, way_id, relation.id);
            }
            for &child_id in &relation.child_relation_ids {
                push_reverse(&mut child_to_relations, child_id, relation.id);
            }
        }

        let mut nodes: Vec<Node> = read_cell_records(&node_path, FeatureKind::Node, cell)?
            .into_iter()
            .filter_map(|feature| match feature {
                Feature::Node(node) => Some(node),
                _ => None,
            })
            .collect();
        for node in &mut nodes {
            node.way_ids = node_to_ways.remove(node.id).unwrap_or_default();
            node.relation_ids = node_to_relations.remove(node.id).unwrap_or_default();
        }
        write_cell_records(&node_path, nodes.into_iter().map(Feature::Node))?;

        for way in &mut ways {
            way.relation_ids = way_to_relations.remove(way.id).unwrap_or_default();
        }
        write_cell_records(&way_path, ways.into_iter().map(Feature::Way))?;

        for relation in &mut relations {
            relation.parent_relation_ids =
                child_to_relations.get(relation.id).cloned().unwrap_or_default();
        }
        write_cell_records(&relation_path, relations.into_iter().map(Feature::Relation))?;

        Ok(())
    }

    fn encode_tags(&self, tags: &RawTags) -> Result<crate::tags::EncodedTags> {
        self.dictionary
            .encode(tags.iter().map(|(key, value)| (key.as_str(), value.as_str())))
    }
}

struct ResolvedMembers {
    bound: Rect<f32>,
    node_ids: Vec<u64>,
    way_ids: Vec<u64>,
    relation_ids: Vec<u64>,
}

/// Union the bounds of every resolvable member. `None` when nothing
/// resolves at all.
fn resolve_members(
    raw: &RawRelation,
    node_coords: &IntMap<u64, (f32, f32)>,
    way_bounds: &IntMap<u64, Rect<f32>>,
    relation_bounds: &IntMap<u64, Rect<f32>>,
) -> Option<ResolvedMembers> {
    let mut bound: Option<Rect<f32>> = None;
    let mut merge = |member: Rect<f32>| {
        bound = Some(match bound {
            None => member,
            Some(bound) => union(&bound, &member),
        });
    };

    let mut node_ids = Vec::with_capacity(raw.node_ids.len());
    for &node_id in &raw.node_ids {
        if let Some(&(lon, lat)) = node_coords.get(node_id) {
            merge(Rect::new(Coord { x: lon, y: lat }, Coord { x: lon, y: lat }));
            node_ids.push(node_id);
        }
    }
    let mut way_ids = Vec::with_capacity(raw.way_ids.len());
    for &way_id in &raw.way_ids {
        if let Some(way_bound) = way_bounds.get(way_id) {
            merge(*way_bound);
            way_ids.push(way_id);
        }
    }
    let mut relation_ids = Vec::with_capacity(raw.relation_ids.len());
    for &relation_id in &raw.relation_ids {
        if let Some(relation_bound) = relation_bounds.get(relation_id) {
            merge(*relation_bound);
            relation_ids.push(relation_id);
        }
    }

    Some(ResolvedMembers { bound: bound?, node_ids, way_ids, relation_ids })
}

fn union(a: &Rect<f32>, b: &Rect<f32>) -> Rect<f32> {
    Rect::new(
        Coord { x: a.min().x.min(b.min().x), y: a.min().y.min(b.min().y) },
        Coord { x: a.max().x.max(b.max().x), y: a.max().y.max(b.max().y) },
    )
}

fn rect_to_f32(rect: &Rect<f64>) -> Rect<f32> {
    Rect::new(
        Coord { x: rect.min().x as f32, y: rect.min().y as f32 },
        Coord { x: rect.max().x as f32, y: rect.max().y as f32 },
    )
}

fn rect_to_f64(rect: &Rect<f32>) -> Rect<f64> {
    Rect::new(
        Coord { x: rect.min().x as f64, y: rect.min().y as f64 },
        Coord { x: rect.max().x as f64, y: rect.max().y as f64 },
    )
}

fn push_reverse(map: &mut IntMap<u64, Vec<u64>>, key: u64, value: u64) {
    match map.get_mut(key) {
        // closed ways repeat their first node, don't record them twice
        Some(list) => {
            if list.last() != Some(&value) {
                list.push(value);
            }
        }
        None => {
            map.insert(key, vec![value]);
        }
    }
}

fn join_worker<T>(handle: thread::ScopedJoinHandle<'_, Result<T>>) -> Result<T> {
    match handle.join() {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

fn read_cell_records(
    path: &std::path::Path,
    kind: FeatureKind,
    cell: CellIndex,
) -> Result<Vec<Feature>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = std::fs::read(path).map_err(Error::io(path))?;
    codec::CellDecoder::new(&bytes, kind, cell).collect()
}

fn write_cell_records(
    path: &std::path::Path,
    features: impl ExactSizeIterator<Item = Feature>,
) -> Result<()> {
    if features.len() == 0 {
        return Ok(());
    }
    let mut buffer = Vec::new();
    for feature in features {
        codec::check_counts(&feature)?;
        codec::write_feature(&mut buffer, &feature).map_err(Error::io(path))?;
    }
    std::fs::write(path, buffer).map_err(Error::io(path))
}

/// Lazily opened, mutex-guarded buffered writers, one per (kind, cell).
struct CellWriters {
    grid_dir: PathBuf,
    writers: Mutex<HashMap<(FeatureKind, CellIndex), std::sync::Arc<Mutex<CellFileWriter>>>>,
}

struct CellFileWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl CellWriters {
    fn new(grid_dir: PathBuf) -> Self {
        Self { grid_dir, writers: Mutex::new(HashMap::new()) }
    }

    fn write(&self, kind: FeatureKind, cell: CellIndex, feature: &Feature) -> Result<()> {
        let handle = self.handle(kind, cell)?;
        let mut guard = handle.lock().unwrap();
        codec::write_feature(&mut guard.writer, feature).map_err(Error::io(guard.path.clone()))
    }

    fn handle(
        &self,
        kind: FeatureKind,
        cell: CellIndex,
    ) -> Result<std::sync::Arc<Mutex<CellFileWriter>>> {
        let mut writers = self.writers.lock().unwrap();
        if let Some(writer) = writers.get(&(kind, cell)) {
            return Ok(std::sync::Arc::clone(writer));
        }
        let dir = self.grid_dir.join(kind.dir_name()).join(cell.x.to_string());
        std::fs::create_dir_all(&dir).map_err(Error::io(&dir))?;
        let path = dir.join(format!("{}.cell", cell.y));
        let file = File::create(&path).map_err(Error::io(&path))?;
        let writer = std::sync::Arc::new(Mutex::new(CellFileWriter {
            path,
            writer: BufWriter::new(file),
        }));
        writers.insert((kind, cell), std::sync::Arc::clone(&writer));
        Ok(writer)
    }

    /// Flush and close every file, returning which (kind, cell) pairs got
    /// records.
    fn finish(self) -> Result<Vec<(FeatureKind, CellIndex)>> {
        let writers = self.writers.into_inner().unwrap();
        let mut cells = Vec::with_capacity(writers.len());
        for (key, writer) in writers {
            let mut guard = writer.lock().unwrap();
            guard.writer.flush().map_err(Error::io(guard.path.clone()))?;
            cells.push(key);
        }
        Ok(cells)
    }
}

#[cfg(test)]
mod test {
    use steppe::NoProgress;

    use super::*;
    use crate::ingest::{RawElement, RawFeatureRepository, RawNode};
    use crate::IndexConfig;

    fn spool(elements: Vec<RawElement>) -> (TagDictionary, RawStreams) {
        let mut dictionary = TagDictionary::default();
        let mut repository = RawFeatureRepository::create().unwrap();
        for element in elements {
            dictionary
                .add(element.tags().iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .unwrap();
            repository.append(&element).unwrap();
        }
        dictionary.finalize();
        (dictionary, repository.finish().unwrap())
    }

    fn raw_node(id: u64, lon: f64, lat: f64) -> RawElement {
        RawElement::Node(RawNode {
            id,
            lon,
            lat,
            tags: vec![("fixme".to_string(), "yes".to_string())],
        })
    }

    #[test]
    fn cell_files_land_in_the_documented_layout() {
        let dir = tempfile::tempdir().unwrap();
        let config = IndexConfig::new(dir.path());
        let (dictionary, streams) =
            spool(vec![raw_node(1, 0.01, 0.01), raw_node(2, -0.01, 0.01), raw_node(3, 1.55, -2.31)]);
        let writer = GridWriter::new(&config, &dictionary, None);
        let stats = writer.write(&streams, &|| false, &NoProgress).unwrap();

        assert_eq!(stats.nodes, 3);
        assert_eq!(stats.cells, 3);
        for relative in ["node/0/0.cell", "node/-1/0.cell", "node/15/-24.cell"] {
            let path = config.grid_dir().join(relative);
            assert!(path.exists(), "missing {relative}");
        }
    }

    #[test]
    fn written_records_decode_with_the_codec() {
        let dir = tempfile::tempdir().unwrap();
        let config = IndexConfig::new(dir.path());
        let (dictionary, streams) = spool(vec![raw_node(7, 0.05, 0.05)]);
        let writer = GridWriter::new(&config, &dictionary, None);
        writer.write(&streams, &|| false, &NoProgress).unwrap();

        let cell = CellIndex::new(0, 0);
        let path = cell_file_path(&config.grid_dir(), FeatureKind::Node, cell);
        let features = read_cell_records(&path, FeatureKind::Node, cell).unwrap();
        assert_eq!(features.len(), 1);
        let Feature::Node(node) = &features[0] else { panic!("expected a node") };
        assert_eq!(node.id, 7);
        assert_eq!(dictionary.decode(&node.tags).next(), Some(Some(("fixme", "yes"))));
    }

    #[test]
    fn rect_unions_and_conversions() {
        let a = Rect::new(Coord { x: 0.0f32, y: 0.0 }, Coord { x: 1.0, y: 1.0 });
        let b = Rect::new(Coord { x: -2.0f32, y: 0.5 }, Coord { x: 0.5, y: 3.0 });
        let joined = union(&a, &b);
        assert_eq!(joined.min(), Coord { x: -2.0, y: 0.0 });
        assert_eq!(joined.max(), Coord { x: 1.0, y: 3.0 });

        let roundtrip = rect_to_f32(&rect_to_f64(&joined));
        assert_eq!(roundtrip, joined);
    }

    #[test]
    fn reverse_lists_skip_adjacent_duplicates() {
        let mut map = IntMap::new();
        // a closed way visits its first node twice
        push_reverse(&mut map, 1, 10);
        push_reverse(&mut map, 1, 10);
        push_reverse(&mut map, 1, 11);
        assert_eq!(map.get(1), Some(&vec![10, 11]));
    }
}
