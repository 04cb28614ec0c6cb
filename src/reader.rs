use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{unbounded, Receiver, Sender};
use geo::Intersects;
use geo_types::{Coord, Rect};
use memmap2::Mmap;
use roaring::RoaringTreemap;

use crate::cache::CellCache;
use crate::cell::{CellExtent, CellIndex};
use crate::codec::CellDecoder;
use crate::dictionary::TagDictionary;
use crate::feature::{Element, Feature, FeatureKind, WayNode};
use crate::{cell_file_path, Error, IndexConfig, Result};

/// One per-cell batch of decoded, filtered features.
pub type FeatureBatch = (CellIndex, Vec<Feature>);

/// Query results stream cell by cell; workers promote their first error
/// into the stream and stop.
pub type FeatureStream = Receiver<Result<FeatureBatch>>;

/// Read side of the grid index.
///
/// Opens cell files read-only, decodes them through a shared LRU cache
/// and streams per-cell batches over a channel. Cheap to clone.
#[derive(Clone)]
pub struct GridReader {
    inner: Arc<ReaderInner>,
}

struct ReaderInner {
    grid_dir: PathBuf,
    cell_width: f64,
    cell_height: f64,
    stripes: usize,
    check_feature_validity: bool,
    cache: CellCache,
    dictionary: TagDictionary,
}

impl GridReader {
    /// Load the dictionary and wire up the cache. No cell file is touched
    /// until the first query.
    pub fn open(config: &IndexConfig) -> Result<Self> {
        let dictionary = TagDictionary::load(&config.tag_index_path())?;
        Ok(Self {
            inner: Arc::new(ReaderInner {
                grid_dir: config.grid_dir(),
                cell_width: config.cell_width,
                cell_height: config.cell_height,
                stripes: config.stripes.max(1),
                check_feature_validity: config.check_feature_validity,
                cache: CellCache::new(config.cache_capacity),
                dictionary,
            }),
        })
    }

    pub fn dictionary(&self) -> &TagDictionary {
        &self.inner.dictionary
    }

    pub fn cell_width(&self) -> f64 {
        self.inner.cell_width
    }

    pub fn cell_height(&self) -> f64 {
        self.inner.cell_height
    }

    /// Stream every feature of `kind` intersecting `bbox`.
    ///
    /// The bbox's cell rectangle is split into column stripes read in
    /// parallel; decoded features are additionally filtered against the
    /// bbox itself.
    pub fn query_bbox(&self, bbox: Rect<f64>, kind: FeatureKind) -> FeatureStream {
        let inner = &self.inner;
        let extent = CellExtent::of_rect(&bbox, inner.cell_width, inner.cell_height);
        let stripes = extent.subdivide(inner.stripes as u32, 1);

        let (sender, receiver) = unbounded();
        for stripe in stripes {
            let inner = Arc::clone(inner);
            let sender: Sender<Result<FeatureBatch>> = sender.clone();
            thread::spawn(move || {
                for cell in stripe.cells() {
                    match inner.load_cell(kind, cell) {
                        Ok(features) => {
                            let matching: Vec<Feature> = features
                                .iter()
                                .filter(|feature| bbox.intersects(&feature.bound()))
                                .cloned()
                                .collect();
                            if matching.is_empty() {
                                continue;
                            }
                            if sender.send(Ok((cell, matching))).is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            let _ = sender.send(Err(err));
                            return;
                        }
                    }
                }
            });
        }
        receiver
    }

    /// Stream the full contents of the given cells, no bbox filter.
    pub fn query_cells(&self, cells: Vec<CellIndex>, kind: FeatureKind) -> FeatureStream {
        let (sender, receiver) = unbounded();
        if cells.is_empty() {
            return receiver;
        }
        let chunk_size = cells.len().div_ceil(self.inner.stripes);
        for chunk in cells.chunks(chunk_size) {
            let inner = Arc::clone(&self.inner);
            let sender: Sender<Result<FeatureBatch>> = sender.clone();
            let chunk = chunk.to_vec();
            thread::spawn(move || {
                for cell in chunk {
                    match inner.load_cell(kind, cell) {
                        Ok(features) => {
                            if features.is_empty() {
                                continue;
                            }
                            if sender.send(Ok((cell, features.as_slice().to_vec()))).is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            let _ = sender.send(Err(err));
                            return;
                        }
                    }
                }
            });
        }
        receiver
    }

    /// Stream the node records backing `way_nodes`, grouped by cell.
    /// Within a cell, candidates are pre-rejected against the union bbox
    /// of the requested nodes before the id lookup.
    pub fn query_nodes(&self, way_nodes: &[WayNode]) -> FeatureStream {
        let inner = Arc::clone(&self.inner);
        let mut groups: HashMap<CellIndex, (RoaringTreemap, Rect<f64>)> = HashMap::new();
        for way_node in way_nodes {
            let (lon, lat) = (way_node.lon as f64, way_node.lat as f64);
            let cell = CellIndex::of_point(lon, lat, inner.cell_width, inner.cell_height);
            let point = Coord { x: lon, y: lat };
            match groups.get_mut(&cell) {
                Some((ids, bound)) => {
                    ids.insert(way_node.id);
                    *bound = Rect::new(
                        Coord { x: bound.min().x.min(point.x), y: bound.min().y.min(point.y) },
                        Coord { x: bound.max().x.max(point.x), y: bound.max().y.max(point.y) },
                    );
                }
                None => {
                    let mut ids = RoaringTreemap::new();
                    ids.insert(way_node.id);
                    groups.insert(cell, (ids, Rect::new(point, point)));
                }
            }
        }

        let (sender, receiver) = unbounded();
        thread::spawn(move || {
            for (cell, (ids, bound)) in groups {
                match inner.load_cell(FeatureKind::Node, cell) {
                    Ok(features) => {
                        let matching: Vec<Feature> = features
                            .iter()
                            .filter(|feature| {
                                bound.intersects(&feature.bound()) && ids.contains(feature.id())
                            })
                            .cloned()
                            .collect();
                        if matching.is_empty() {
                            continue;
                        }
                        if sender.send(Ok((cell, matching))).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        let _ = sender.send(Err(err));
                        return;
                    }
                }
            }
        });
        receiver
    }
}

impl ReaderInner {
    fn load_cell(&self, kind: FeatureKind, cell: CellIndex) -> Result<Arc<Vec<Feature>>> {
        let path = cell_file_path(&self.grid_dir, kind, cell);
        if let Some(entry) = self.cache.get(&path) {
            if entry.is_empty() {
                // raced the creator before it finished decoding
                entry.fill_if_empty(self.read_and_decode(&path, kind, cell)?);
            }
            return Ok(entry.snapshot());
        }
        if !path.exists() {
            // absent file, absent features; not worth a cache slot
            return Ok(Arc::new(Vec::new()));
        }
        let (entry, is_new) = self.cache.get_or_insert(&path);
        if is_new {
            entry.append_all(self.read_and_decode(&path, kind, cell)?);
        } else if entry.is_empty() {
            entry.fill_if_empty(self.read_and_decode(&path, kind, cell)?);
        }
        Ok(entry.snapshot())
    }

    fn read_and_decode(
        &self,
        path: &std::path::Path,
        kind: FeatureKind,
        cell: CellIndex,
    ) -> Result<Vec<Feature>> {
        let file = File::open(path).map_err(Error::io(path))?;
        // Safety: cell files are created once at import time and never
        // mutated afterwards.
        let mmap = unsafe { Mmap::map(&file) }.map_err(Error::io(path))?;

        let mut features = Vec::new();
        for record in CellDecoder::new(&mmap, kind, cell) {
            match record.and_then(|feature| self.validate(feature, kind, cell)) {
                Ok(feature) => features.push(feature),
                Err(err) if self.check_feature_validity => return Err(err),
                Err(err) => log::warn!("{err}, record skipped"),
            }
        }
        Ok(features)
    }

    /// Tag ids must resolve against the dictionary.
    fn validate(&self, feature: Feature, kind: FeatureKind, cell: CellIndex) -> Result<Feature> {
        for (key_id, value_id) in feature.tags().iter() {
            if self.dictionary.key(key_id).is_none() {
                return Err(Error::Corrupt {
                    kind,
                    cell,
                    message: format!("record {}: key-id {key_id} out of range", feature.id()),
                });
            }
            if self.dictionary.value(key_id, value_id).is_none() {
                return Err(Error::Corrupt {
                    kind,
                    cell,
                    message: format!(
                        "record {}: value-id {value_id} out of bounds for key {key_id}",
                        feature.id()
                    ),
                });
            }
        }
        Ok(feature)
    }
}

#[cfg(test)]
mod test {
    use steppe::NoProgress;
    use tempfile::TempDir;

    use super::*;
    use crate::ingest::{RawElement, RawNode};
    use crate::Graticule;

    fn indexed_nodes(points: &[(u64, f64, f64)]) -> (GridReader, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let engine = Graticule::new(IndexConfig::new(dir.path()));
        let mut source: Vec<RawElement> = points
            .iter()
            .map(|&(id, lon, lat)| {
                RawElement::Node(RawNode {
                    id,
                    lon,
                    lat,
                    tags: vec![("tourism".to_string(), "viewpoint".to_string())],
                })
            })
            .collect();
        engine.import(&mut source, &|| false, &NoProgress).unwrap();
        (engine.open().unwrap(), dir)
    }

    fn drain(stream: FeatureStream) -> Vec<u64> {
        let mut ids: Vec<u64> = Vec::new();
        for batch in stream {
            let (_, features) = batch.unwrap();
            ids.extend(features.iter().map(|feature| feature.id()));
        }
        ids.sort_unstable();
        ids
    }

    #[test]
    fn bbox_streams_every_stripe() {
        // ten columns, read in three stripes
        let points: Vec<(u64, f64, f64)> =
            (0..10).map(|i| (i as u64, 0.05 + 0.1 * i as f64, 0.05)).collect();
        let (reader, _dir) = indexed_nodes(&points);

        let bbox = Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 1.0, y: 0.1 });
        assert_eq!(drain(reader.query_bbox(bbox, FeatureKind::Node)), (0..10).collect::<Vec<_>>());

        // a narrow bbox rejects by geometry inside the cells it touches:
        // the node at 0.65 shares cell 6 with the bbox edge but sits
        // outside the bbox itself
        let bbox = Rect::new(Coord { x: 0.4, y: 0.0 }, Coord { x: 0.61, y: 0.1 });
        assert_eq!(drain(reader.query_bbox(bbox, FeatureKind::Node)), vec![4, 5]);
    }

    #[test]
    fn query_cells_skips_missing_files() {
        let (reader, _dir) = indexed_nodes(&[(1, 0.05, 0.05)]);
        let cells = vec![CellIndex::new(0, 0), CellIndex::new(40, 40), CellIndex::new(-3, 7)];
        assert_eq!(drain(reader.query_cells(cells, FeatureKind::Node)), vec![1]);
        assert!(drain(reader.query_cells(vec![], FeatureKind::Node)).is_empty());
    }

    #[test]
    fn cached_cells_survive_the_file() {
        let (reader, dir) = indexed_nodes(&[(1, 0.05, 0.05), (2, 0.06, 0.06)]);
        let cell = vec![CellIndex::new(0, 0)];
        assert_eq!(drain(reader.query_cells(cell.clone(), FeatureKind::Node)), vec![1, 2]);

        // the second query never reopens the file
        std::fs::remove_file(dir.path().join("grid-index/node/0/0.cell")).unwrap();
        assert_eq!(drain(reader.query_cells(cell, FeatureKind::Node)), vec![1, 2]);
    }
}
