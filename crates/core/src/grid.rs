//! Cell grid geometry.
//!
//! The world is a row-major grid of cells addressed by a flat `i32` index
//! (`cell = y * width + x`). Viewports are half-open rectangles in cell
//! coordinates.

use serde::{Deserialize, Serialize};

/// Flat row-major cell index, as carried on the wire.
pub type CellIndex = i32;

/// Dimensions of the simulated grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridSize {
    /// Width in cells.
    pub width: i32,
    /// Height in cells.
    pub height: i32,
}

impl GridSize {
    /// Create a grid of `width` x `height` cells.
    pub const fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }

    /// Total number of cells.
    pub fn cell_count(&self) -> usize {
        (self.width.max(0) as usize) * (self.height.max(0) as usize)
    }

    /// Whether `cell` addresses a cell inside the grid.
    pub fn is_valid_cell(&self, cell: CellIndex) -> bool {
        cell >= 0 && (cell as usize) < self.cell_count()
    }

    /// Flat index for `(x, y)`, or `None` outside the grid.
    pub fn cell_at(&self, x: i32, y: i32) -> Option<CellIndex> {
        if x < 0 || y < 0 || x >= self.width || y >= self.height {
            return None;
        }
        Some(y * self.width + x)
    }

    /// Coordinates of a valid cell.
    pub fn xy(&self, cell: CellIndex) -> Option<(i32, i32)> {
        if !self.is_valid_cell(cell) || self.width == 0 {
            return None;
        }
        Some((cell % self.width, cell / self.width))
    }

    /// The rectangle covering the whole grid.
    pub fn bounds(&self) -> CellRect {
        CellRect::new(0, 0, self.width, self.height)
    }
}

/// Half-open rectangle `[min_x, max_x) x [min_y, max_y)` in cell coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CellRect {
    /// Inclusive left edge.
    pub min_x: i32,
    /// Inclusive bottom edge.
    pub min_y: i32,
    /// Exclusive right edge.
    pub max_x: i32,
    /// Exclusive top edge.
    pub max_y: i32,
}

impl CellRect {
    /// Create a rectangle from its edges.
    pub const fn new(min_x: i32, min_y: i32, max_x: i32, max_y: i32) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// True when the rectangle covers no cells.
    pub fn is_empty(&self) -> bool {
        self.max_x <= self.min_x || self.max_y <= self.min_y
    }

    /// Number of cells covered.
    pub fn area(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        (self.max_x - self.min_x) as usize * (self.max_y - self.min_y) as usize
    }

    /// Grow every edge by `margin` cells.
    pub fn padded(&self, margin: i32) -> Self {
        Self {
            min_x: self.min_x.saturating_sub(margin),
            min_y: self.min_y.saturating_sub(margin),
            max_x: self.max_x.saturating_add(margin),
            max_y: self.max_y.saturating_add(margin),
        }
    }

    /// Clip to the grid bounds.
    pub fn clamped(&self, grid: GridSize) -> Self {
        Self {
            min_x: self.min_x.max(0),
            min_y: self.min_y.max(0),
            max_x: self.max_x.min(grid.width),
            max_y: self.max_y.min(grid.height),
        }
    }

    /// Whether the point lies inside the rectangle.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.min_x && x < self.max_x && y >= self.min_y && y < self.max_y
    }

    /// Iterate the flat indices of every covered cell, row by row.
    ///
    /// Cells outside `grid` are skipped.
    pub fn cells(self, grid: GridSize) -> impl Iterator<Item = CellIndex> {
        let rect = self.clamped(grid);
        let width = grid.width;
        (rect.min_y..rect.max_y)
            .flat_map(move |y| (rect.min_x..rect.max_x).map(move |x| y * width + x))
    }
}
