use geo_types::{Coord, Rect};

/// One tile of the fixed `(width, height)` degree grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellIndex {
    pub x: i32,
    pub y: i32,
}

impl std::fmt::Display for CellIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

impl CellIndex {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// The cell containing `(lon, lat)`.
    pub fn of_point(lon: f64, lat: f64, width: f64, height: f64) -> Self {
        Self {
            x: (lon / width).floor() as i32,
            y: (lat / height).floor() as i32,
        }
    }

    /// The rectangle this cell spans in degree space.
    pub fn bound(&self, width: f64, height: f64) -> Rect<f64> {
        Rect::new(
            Coord { x: self.x as f64 * width, y: self.y as f64 * height },
            Coord { x: (self.x + 1) as f64 * width, y: (self.y + 1) as f64 * height },
        )
    }

    /// Packs both coordinates into one u64, usable as an `IntMap` key.
    pub(crate) fn pack(&self) -> u64 {
        ((self.x as u32 as u64) << 32) | self.y as u32 as u64
    }
}

/// An inclusive axis-aligned rectangle of cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellExtent {
    pub lower_left: CellIndex,
    pub upper_right: CellIndex,
}

impl CellExtent {
    pub fn new(lower_left: CellIndex, upper_right: CellIndex) -> Self {
        Self { lower_left, upper_right }
    }

    pub fn of_cell(cell: CellIndex) -> Self {
        Self { lower_left: cell, upper_right: cell }
    }

    /// The minimal extent covering `rect`.
    pub fn of_rect(rect: &Rect<f64>, width: f64, height: f64) -> Self {
        Self {
            lower_left: CellIndex::of_point(rect.min().x, rect.min().y, width, height),
            upper_right: CellIndex::of_point(rect.max().x, rect.max().y, width, height),
        }
    }

    /// Cell count along x.
    pub fn columns(&self) -> i64 {
        self.upper_right.x as i64 - self.lower_left.x as i64 + 1
    }

    /// Cell count along y.
    pub fn rows(&self) -> i64 {
        self.upper_right.y as i64 - self.lower_left.y as i64 + 1
    }

    pub fn contains(&self, cell: CellIndex) -> bool {
        self.lower_left.x <= cell.x
            && cell.x <= self.upper_right.x
            && self.lower_left.y <= cell.y
            && cell.y <= self.upper_right.y
    }

    /// Whether the point's cell lies within the extent.
    pub fn contains_point(&self, lon: f64, lat: f64, width: f64, height: f64) -> bool {
        self.contains(CellIndex::of_point(lon, lat, width, height))
    }

    /// The minimal extent enclosing both `self` and `cell`.
    pub fn expand(&self, cell: CellIndex) -> Self {
        Self {
            lower_left: CellIndex::new(
                self.lower_left.x.min(cell.x),
                self.lower_left.y.min(cell.y),
            ),
            upper_right: CellIndex::new(
                self.upper_right.x.max(cell.x),
                self.upper_right.y.max(cell.y),
            ),
        }
    }

    /// Partition into at most `nx * ny` tiles. Tiles cover the extent
    /// without overlap; trailing tiles absorb the remainder.
    pub fn subdivide(&self, nx: u32, ny: u32) -> Vec<CellExtent> {
        let nx = (nx as i64).clamp(1, self.columns());
        let ny = (ny as i64).clamp(1, self.rows());
        let tile_w = self.columns() / nx;
        let tile_h = self.rows() / ny;
        let mut tiles = Vec::with_capacity((nx * ny) as usize);
        for tx in 0..nx {
            let min_x = self.lower_left.x as i64 + tx * tile_w;
            let max_x = if tx == nx - 1 {
                self.upper_right.x as i64
            } else {
                min_x + tile_w - 1
            };
            for ty in 0..ny {
                let min_y = self.lower_left.y as i64 + ty * tile_h;
                let max_y = if ty == ny - 1 {
                    self.upper_right.y as i64
                } else {
                    min_y + tile_h - 1
                };
                tiles.push(CellExtent::new(
                    CellIndex::new(min_x as i32, min_y as i32),
                    CellIndex::new(max_x as i32, max_y as i32),
                ));
            }
        }
        tiles
    }

    /// Every cell of the extent, column-major.
    pub fn cells(&self) -> impl Iterator<Item = CellIndex> + '_ {
        (self.lower_left.x..=self.upper_right.x).flat_map(move |x| {
            (self.lower_left.y..=self.upper_right.y).map(move |y| CellIndex::new(x, y))
        })
    }

    /// The rectangle spanned in degree space, up to the far edge of the
    /// upper-right cell.
    pub fn bound(&self, width: f64, height: f64) -> Rect<f64> {
        Rect::new(
            Coord {
                x: self.lower_left.x as f64 * width,
                y: self.lower_left.y as f64 * height,
            },
            Coord {
                x: (self.upper_right.x + 1) as f64 * width,
                y: (self.upper_right.y + 1) as f64 * height,
            },
        )
    }
}
