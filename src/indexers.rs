use crate::core::Indexer;
use crate::geo::KM_PER_DEGREE;
use anyhow::Error;

/// Past this span the neighbor set is the whole band anyway.
const FULL_BAND_KM: f64 = 1000.0;

/// Equal-angle grid over the globe. Cell ids are `row * cols + col`, rows
/// counted from the south pole and columns from the antimeridian.
#[derive(Clone, Debug)]
pub(crate) struct GridIndexer {
    cell: f64,
    rows: i64,
    cols: i64,
}

impl GridIndexer {
    pub fn new(cell_degrees: f64) -> Result<Self, Error> {
        if !(cell_degrees > 0.0 && cell_degrees <= 90.0) {
            return Err(Error::msg(format!("invalid cell size for grid indexer: {}", cell_degrees)));
        }
        Ok(Self {
            cell: cell_degrees,
            rows: (180.0 / cell_degrees).ceil() as i64,
            cols: (360.0 / cell_degrees).ceil() as i64,
        })
    }

    fn row(&self, latitude: f64) -> i64 {
        (((latitude + 90.0) / self.cell).floor() as i64).clamp(0, self.rows - 1)
    }

    fn col(&self, longitude: f64) -> i64 {
        (((longitude + 180.0) / self.cell).floor() as i64).rem_euclid(self.cols)
    }

    fn split(&self, index: i64) -> (i64, i64) {
        (index.div_euclid(self.cols), index.rem_euclid(self.cols))
    }
}

impl Indexer<i64> for GridIndexer {
    fn index(&self, latitude: f64, longitude: f64) -> i64 {
        self.row(latitude) * self.cols + self.col(longitude)
    }

    fn neighbors(&self, index: i64, distance: f64) -> Vec<i64> {
        let (row, col) = self.split(index);
        // NaN becomes 0, anything past the antipode covers the globe
        let distance = distance.max(0.0).min(180.0 * KM_PER_DEGREE);
        let k_lat = (distance / KM_PER_DEGREE / self.cell).ceil() as i64 + 1;
        let row_min = (row - k_lat).max(0);
        let row_max = (row + k_lat).min(self.rows - 1);

        // widest longitude span is at the poleward edge of the band
        let south = (row_min as f64) * self.cell - 90.0;
        let north = ((row_max + 1) as f64) * self.cell - 90.0;
        let edge_lat = south.abs().max(north.abs()).min(90.0);
        let cos = edge_lat.to_radians().cos();
        let all_cols = distance >= FULL_BAND_KM || cos <= 1e-9 || distance / (KM_PER_DEGREE * cos) >= 180.0;

        let cols: Vec<i64> = if all_cols {
            (0..self.cols).collect()
        } else {
            let k_lon = (distance / (KM_PER_DEGREE * cos) / self.cell).ceil() as i64 + 1;
            if 2 * k_lon + 1 >= self.cols {
                (0..self.cols).collect()
            } else {
                (col - k_lon..=col + k_lon).map(|c| c.rem_euclid(self.cols)).collect()
            }
        };

        let mut res = Vec::with_capacity(((row_max - row_min + 1) as usize) * cols.len());
        for r in row_min..=row_max {
            for c in &cols {
                res.push(r * self.cols + c);
            }
        }
        res
    }
}
