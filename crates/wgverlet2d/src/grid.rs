//! Uniform grid geometry for the spatial hash broad phase.

use bytemuck::Pod;

use crate::config::GridConfig;

/// Grid parameter block uploaded to the broad-phase kernels. `count` carries
/// the element count of whichever dispatch the block accompanies.
#[derive(Copy, Clone, Debug, Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct GridParams {
    pub origin: [f32; 2],
    pub cell_size: [f32; 2],
    pub subdivisions: [i32; 2],
    pub directory_length: u32,
    pub count: u32,
}

/// Host-side view of the broad-phase grid.
#[derive(Copy, Clone, Debug)]
pub struct UniformGrid {
    config: GridConfig,
}

impl UniformGrid {
    pub fn new(config: GridConfig) -> Self {
        debug_assert!(config.x_subdivisions > 0 && config.y_subdivisions > 0);
        Self { config }
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    /// Number of cells in the key directory.
    pub fn directory_length(&self) -> u32 {
        self.config.x_subdivisions * self.config.y_subdivisions
    }

    /// World-space extent of one cell.
    pub fn cell_size(&self) -> [f32; 2] {
        [
            self.config.width / self.config.x_subdivisions as f32,
            self.config.height / self.config.y_subdivisions as f32,
        ]
    }

    /// The (possibly out-of-range) cell containing a world point.
    pub fn cell_of(&self, x: f32, y: f32) -> (i32, i32) {
        let size = self.cell_size();
        (
            ((x - self.config.origin[0]) / size[0]).floor() as i32,
            ((y - self.config.origin[1]) / size[1]).floor() as i32,
        )
    }

    /// Directory index of an in-range cell.
    pub fn cell_key(&self, ix: i32, iy: i32) -> Option<u32> {
        if ix < 0
            || iy < 0
            || ix >= self.config.x_subdivisions as i32
            || iy >= self.config.y_subdivisions as i32
        {
            return None;
        }
        Some(iy as u32 * self.config.x_subdivisions + ix as u32)
    }

    pub fn params(&self, count: u32) -> GridParams {
        GridParams {
            origin: self.config.origin,
            cell_size: self.cell_size(),
            subdivisions: [
                self.config.x_subdivisions as i32,
                self.config.y_subdivisions as i32,
            ],
            directory_length: self.directory_length(),
            count,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn grid() -> UniformGrid {
        UniformGrid::new(GridConfig {
            origin: [-60.0, -60.0],
            width: 120.0,
            height: 120.0,
            x_subdivisions: 12,
            y_subdivisions: 12,
        })
    }

    #[test]
    fn directory_and_cells() {
        let grid = grid();
        assert_eq!(grid.directory_length(), 144);
        assert_eq!(grid.cell_size(), [10.0, 10.0]);
        assert_eq!(grid.cell_of(-60.0, -60.0), (0, 0));
        assert_eq!(grid.cell_of(-51.0, -51.0), (0, 0));
        assert_eq!(grid.cell_of(0.0, 0.0), (6, 6));
        assert_eq!(grid.cell_of(59.9, 59.9), (11, 11));
        assert_eq!(grid.cell_of(-61.0, 0.0), (-1, 6));
    }

    #[test]
    fn keys_are_row_major() {
        let grid = grid();
        assert_eq!(grid.cell_key(0, 0), Some(0));
        assert_eq!(grid.cell_key(11, 0), Some(11));
        assert_eq!(grid.cell_key(0, 1), Some(12));
        assert_eq!(grid.cell_key(3, 2), Some(27));
        assert_eq!(grid.cell_key(-1, 0), None);
        assert_eq!(grid.cell_key(0, 12), None);
    }
}
