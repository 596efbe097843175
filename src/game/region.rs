//! Regions and Cells
//!
//! Two-level spatial partition. A region is an axis-aligned area split
//! into a grid of square cells on the XY plane:
//!
//! ```text
//!   max ┌─────┬─────┬─────┐
//!       │  4  │  5  │  6  │
//!       ├─────┼─────┼─────┤
//!       │  1  │  2  │  3  │
//!   min └─────┴─────┴─────┘
//! ```
//!
//! Cell ids are 1-based row-major indices. Each cell keeps the set of
//! entities placed in it; the entity manager maintains that set.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Serialize, Deserialize};
use tracing::{debug, warn};

use crate::core::ids::{CellId, EntityId, RegionId};
use crate::core::vec3::Vector3;

/// Axis-aligned bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    /// Minimum corner.
    pub min: Vector3,
    /// Maximum corner.
    pub max: Vector3,
}

impl Bounds {
    /// Bounds from two corners.
    pub fn new(min: Vector3, max: Vector3) -> Self {
        Self { min, max }
    }

    /// True if `position` lies inside (inclusive).
    pub fn contains(&self, position: Vector3) -> bool {
        position.x >= self.min.x && position.x <= self.max.x
            && position.y >= self.min.y && position.y <= self.max.y
            && position.z >= self.min.z && position.z <= self.max.z
    }

    /// Nearest point inside the bounds.
    pub fn clamp(&self, position: Vector3) -> Vector3 {
        position.clamp(self.min, self.max)
    }

    /// Width along X.
    pub fn width(&self) -> f32 {
        self.max.x - self.min.x
    }

    /// Height along Y.
    pub fn height(&self) -> f32 {
        self.max.y - self.min.y
    }
}

/// Grid cell.
#[derive(Debug, Clone)]
pub struct Cell {
    id: CellId,
    bounds: Bounds,
    entities: BTreeSet<EntityId>,
}

impl Cell {
    /// Cell id.
    pub fn id(&self) -> CellId {
        self.id
    }

    /// Cell bounds.
    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// Entities placed in this cell.
    pub fn entities(&self) -> &BTreeSet<EntityId> {
        &self.entities
    }

    pub(crate) fn insert_entity(&mut self, id: EntityId) {
        self.entities.insert(id);
    }

    pub(crate) fn remove_entity(&mut self, id: EntityId) {
        self.entities.remove(&id);
    }
}

/// A simulated area.
#[derive(Debug, Clone)]
pub struct Region {
    id: RegionId,
    bounds: Bounds,
    cell_size: f32,
    columns: u32,
    rows: u32,
    cells: Vec<Cell>,
}

impl Region {
    fn new(id: RegionId, bounds: Bounds, cell_size: f32) -> Self {
        let cell_size = if cell_size > 0.0 { cell_size } else { 1.0 };
        let columns = ((bounds.width() / cell_size).ceil() as u32).max(1);
        let rows = ((bounds.height() / cell_size).ceil() as u32).max(1);

        let mut cells = Vec::with_capacity((columns * rows) as usize);
        for row in 0..rows {
            for col in 0..columns {
                let min = Vector3::new(
                    bounds.min.x + col as f32 * cell_size,
                    bounds.min.y + row as f32 * cell_size,
                    bounds.min.z,
                );
                let max = Vector3::new(
                    (min.x + cell_size).min(bounds.max.x),
                    (min.y + cell_size).min(bounds.max.y),
                    bounds.max.z,
                );
                cells.push(Cell {
                    id: CellId(row * columns + col + 1),
                    bounds: Bounds::new(min, max),
                    entities: BTreeSet::new(),
                });
            }
        }

        Self { id, bounds, cell_size, columns, rows, cells }
    }

    /// Region id.
    pub fn id(&self) -> RegionId {
        self.id
    }

    /// Region bounds.
    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// Cell edge length.
    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Number of cells.
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Cell by id.
    pub fn cell(&self, id: CellId) -> Option<&Cell> {
        let index = (id.0 as usize).checked_sub(1)?;
        self.cells.get(index)
    }

    pub(crate) fn cell_mut(&mut self, id: CellId) -> Option<&mut Cell> {
        let index = (id.0 as usize).checked_sub(1)?;
        self.cells.get_mut(index)
    }

    /// Cells in id order.
    pub fn cells(&self) -> impl Iterator<Item = &Cell> {
        self.cells.iter()
    }

    /// Cell containing `position`, if it lies in the region.
    pub fn cell_at(&self, position: Vector3) -> Option<CellId> {
        if !self.bounds.contains(position) {
            return None;
        }
        let col = self.column_of(position.x);
        let row = self.row_of(position.y);
        Some(CellId(row * self.columns + col + 1))
    }

    /// Cells whose area overlaps the circle of `radius` around `center`.
    pub fn cells_in_radius(&self, center: Vector3, radius: f32) -> Vec<CellId> {
        let radius = radius.max(0.0);
        let min = self.bounds.clamp(Vector3::new(center.x - radius, center.y - radius, center.z));
        let max = self.bounds.clamp(Vector3::new(center.x + radius, center.y + radius, center.z));
        let radius_sq = radius * radius;

        let mut result = Vec::new();
        for row in self.row_of(min.y)..=self.row_of(max.y) {
            for col in self.column_of(min.x)..=self.column_of(max.x) {
                let id = CellId(row * self.columns + col + 1);
                let Some(cell) = self.cell(id) else { continue };
                let nearest = cell.bounds.clamp(center);
                if nearest.distance_squared_2d(center) <= radius_sq {
                    result.push(id);
                }
            }
        }
        result
    }

    /// All entities placed anywhere in the region.
    pub fn entities(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.cells.iter().flat_map(|cell| cell.entities.iter().copied())
    }

    fn column_of(&self, x: f32) -> u32 {
        (((x - self.bounds.min.x) / self.cell_size).floor().max(0.0) as u32).min(self.columns - 1)
    }

    fn row_of(&self, y: f32) -> u32 {
        (((y - self.bounds.min.y) / self.cell_size).floor().max(0.0) as u32).min(self.rows - 1)
    }
}

/// Owns the regions of one game instance.
#[derive(Debug)]
pub struct RegionManager {
    regions: BTreeMap<RegionId, Region>,
    next_id: u64,
}

impl RegionManager {
    /// Empty manager.
    pub fn new() -> Self {
        Self { regions: BTreeMap::new(), next_id: 1 }
    }

    /// Create a region and its cell grid.
    pub fn create_region(&mut self, bounds: Bounds, cell_size: f32) -> RegionId {
        let id = RegionId(self.next_id);
        self.next_id += 1;
        let region = Region::new(id, bounds, cell_size);
        debug!("Created region {} with {} cells", id, region.cell_count());
        self.regions.insert(id, region);
        id
    }

    /// Region by id.
    pub fn get(&self, id: RegionId) -> Option<&Region> {
        self.regions.get(&id)
    }

    /// Mutable region by id.
    pub fn get_mut(&mut self, id: RegionId) -> Option<&mut Region> {
        self.regions.get_mut(&id)
    }

    /// Remove a region.
    ///
    /// Callers must take placed entities out of the world first; a region
    /// that still holds entities is refused.
    pub fn destroy_region(&mut self, id: RegionId) -> bool {
        match self.regions.get(&id) {
            None => false,
            Some(region) if region.entities().next().is_some() => {
                warn!("destroy_region(): region {} still has placed entities", id);
                false
            }
            Some(_) => {
                self.regions.remove(&id);
                debug!("Destroyed region {}", id);
                true
            }
        }
    }

    /// Remove every region.
    pub fn destroy_all(&mut self) {
        self.regions.clear();
    }

    /// Regions in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    /// Number of regions.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// True if there are no regions.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

impl Default for RegionManager {
    fn default() -> Self {
        Self::new()
    }
}
