//! Offline grid-indexed queries over OSM-style geodata.
//!
//! A one-shot [`import`](Graticule::import) ingests a stream of tagged
//! nodes, ways and relations into an on-disk index: a reversible tag
//! dictionary plus one binary file per grid cell and object kind,
//! enriched with reverse membership references. [`open`](Graticule::open)
//! then hands out a [`GridReader`] answering bbox, tag and relationship
//! queries through the [`Query`] engine.

use std::path::{Path, PathBuf};

use steppe::Progress;

pub mod cache;
pub mod cell;
mod codec;
pub mod dictionary;
pub mod error;
pub mod feature;
pub mod ingest;
pub mod output;
pub mod query;
pub mod reader;
mod tags;
pub mod writer;

pub use cache::CellCache;
pub use cell::{CellExtent, CellIndex};
pub use dictionary::TagDictionary;
pub use error::Error;
pub use feature::{Element, Feature, FeatureId, FeatureKind, Node, Relation, Way, WayNode};
pub use ingest::{DensityAggregator, ElementSource, RawElement, RawNode, RawRelation, RawWay};
pub use output::{to_feature_collection, write_geojson};
pub use query::{FilterExpr, Query, QueryType, Statement};
pub use reader::{FeatureBatch, FeatureStream, GridReader};
pub use tags::EncodedTags;
pub use writer::{GridWriter, ImportStats};

pub type Result<O, E = Error> = std::result::Result<O, E>;

/// Dictionary file name under the base folder.
pub const TAG_INDEX_FILE: &str = "tag-index";
/// Grid directory name under the base folder.
pub const GRID_INDEX_DIR: &str = "grid-index";

pub const DEFAULT_CELL_SIZE: f64 = 0.1;
pub const DEFAULT_STRIPES: usize = 3;
pub const DEFAULT_WORKERS: usize = 10;

steppe::make_enum_progress! {
    pub enum ImportSteps {
        SpoolRawElements,
        FinalizeDictionary,
        WriteNodes,
        WriteWays,
        WriteRelations,
        EnrichCells,
    }
}

steppe::make_atomic_progress!(Item alias AtomicItemStep => "item");
steppe::make_atomic_progress!(Cell alias AtomicCellStep => "cell");

/// Everything the index needs to know about itself.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Folder holding `tag-index` and `grid-index/`.
    pub base_dir: PathBuf,
    /// Cell width in degrees of longitude.
    pub cell_width: f64,
    /// Cell height in degrees of latitude.
    pub cell_height: f64,
    /// Column stripes read in parallel per bbox query.
    pub stripes: usize,
    /// Decoded cells kept in memory.
    pub cache_capacity: usize,
    /// Worker pool size for way splitting and cell enrichment.
    pub workers: usize,
    /// Fail queries on corrupt records instead of skipping them.
    pub check_feature_validity: bool,
    /// Drop relations whose bounding box misses the ingest extent.
    pub skip_out_of_extent_relations: bool,
}

impl IndexConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            cell_width: DEFAULT_CELL_SIZE,
            cell_height: DEFAULT_CELL_SIZE,
            stripes: DEFAULT_STRIPES,
            cache_capacity: cache::DEFAULT_CACHE_CAPACITY,
            workers: DEFAULT_WORKERS,
            check_feature_validity: false,
            skip_out_of_extent_relations: true,
        }
    }

    pub fn tag_index_path(&self) -> PathBuf {
        self.base_dir.join(TAG_INDEX_FILE)
    }

    pub fn grid_dir(&self) -> PathBuf {
        self.base_dir.join(GRID_INDEX_DIR)
    }
}

pub(crate) fn cell_file_path(grid_dir: &Path, kind: FeatureKind, cell: CellIndex) -> PathBuf {
    grid_dir
        .join(kind.dir_name())
        .join(cell.x.to_string())
        .join(format!("{}.cell", cell.y))
}

/// The engine's front door: owns the configuration, drives imports and
/// opens readers.
pub struct Graticule {
    config: IndexConfig,
}

impl Graticule {
    pub fn new(config: IndexConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Ingest `source` into a fresh index under the base folder.
    ///
    /// The stream is spooled once while the dictionary and the density
    /// grid are built, then the grid writer splits everything into cell
    /// files and enriches them with reverse references.
    pub fn import(
        &self,
        source: &mut dyn ElementSource,
        cancel: &(impl Fn() -> bool + Send + Sync),
        progress: &impl Progress,
    ) -> Result<ImportStats> {
        progress.update(ImportSteps::SpoolRawElements);
        let mut dictionary = TagDictionary::default();
        let mut density =
            DensityAggregator::new(self.config.cell_width, self.config.cell_height);
        let mut repository = ingest::RawFeatureRepository::create()?;
        source.read_elements(&mut |element| {
            if cancel() {
                return Err(Error::BuildCanceled);
            }
            dictionary.add(
                element.tags().iter().map(|(key, value)| (key.as_str(), value.as_str())),
            )?;
            if let RawElement::Node(node) = &element {
                density.record(node.lon, node.lat);
            }
            repository.append(&element)
        })?;

        progress.update(ImportSteps::FinalizeDictionary);
        dictionary.finalize();
        std::fs::create_dir_all(&self.config.base_dir).map_err(Error::io(&self.config.base_dir))?;
        dictionary.save(&self.config.tag_index_path())?;

        // the writer owns the grid directory; a previous index would
        // leave stale cell files behind
        let grid_dir = self.config.grid_dir();
        if grid_dir.exists() {
            std::fs::remove_dir_all(&grid_dir).map_err(Error::io(&grid_dir))?;
        }

        let streams = repository.finish()?;
        let writer = GridWriter::new(&self.config, &dictionary, density.world_extent());
        writer.write(&streams, cancel, progress)
    }

    /// Open the existing index for querying.
    pub fn open(&self) -> Result<GridReader> {
        GridReader::open(&self.config)
    }
}
