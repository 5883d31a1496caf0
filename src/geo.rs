//! Geographic bounding boxes.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Decimal places kept when snapping coordinates to a grid.
const SNAP_PRECISION: f64 = 1e9;

/// Area of interest given by its northern, southern, eastern and western edges.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoBoundingBox {
    lat_max: f64,
    lat_min: f64,
    lon_max: f64,
    lon_min: f64,
}

impl GeoBoundingBox {
    /// Build a bounding box from its four edges.
    ///
    /// Latitudes must lie in `[-90, 90]`, longitudes in `[-180, 180]`, and
    /// each minimum must not exceed its maximum.
    pub fn new(lat_max: f64, lat_min: f64, lon_max: f64, lon_min: f64) -> Result<Self> {
        for lat in [lat_max, lat_min] {
            if !(-90.0..=90.0).contains(&lat) {
                return Err(Error::InvalidBoundingBox(format!(
                    "latitude {lat} must range from -90 to 90 degrees"
                )));
            }
        }
        for lon in [lon_max, lon_min] {
            if !(-180.0..=180.0).contains(&lon) {
                return Err(Error::InvalidBoundingBox(format!(
                    "longitude {lon} must range from -180 to 180 degrees"
                )));
            }
        }
        if lat_min > lat_max {
            return Err(Error::InvalidBoundingBox(format!(
                "lat_min {lat_min} must be less than or equal to lat_max {lat_max}"
            )));
        }
        if lon_min > lon_max {
            return Err(Error::InvalidBoundingBox(format!(
                "lon_min {lon_min} must be less than or equal to lon_max {lon_max}"
            )));
        }
        Ok(Self {
            lat_max,
            lat_min,
            lon_max,
            lon_min,
        })
    }

    /// Smallest box containing every `(lat, lon)` pair.
    pub fn enclosing(coords: impl IntoIterator<Item = (f64, f64)>) -> Result<Self> {
        let mut coords = coords.into_iter();
        let (lat, lon) = coords
            .next()
            .ok_or_else(|| Error::InvalidBoundingBox("no coordinates to enclose".to_string()))?;
        let (mut lat_max, mut lat_min, mut lon_max, mut lon_min) = (lat, lat, lon, lon);
        for (lat, lon) in coords {
            lat_max = lat_max.max(lat);
            lat_min = lat_min.min(lat);
            lon_max = lon_max.max(lon);
            lon_min = lon_min.min(lon);
        }
        Self::new(lat_max, lat_min, lon_max, lon_min)
    }

    pub fn lat_max(&self) -> f64 {
        self.lat_max
    }

    pub fn lat_min(&self) -> f64 {
        self.lat_min
    }

    pub fn lon_max(&self) -> f64 {
        self.lon_max
    }

    pub fn lon_min(&self) -> f64 {
        self.lon_min
    }

    /// Grow the box outwards onto a grid of spacing `round_val`, then pad it by `offset_val`.
    ///
    /// Maxima are rounded up and minima down, so the result always contains
    /// the original box.
    pub fn round_coords(&self, offset_val: f64, round_val: f64) -> Result<Self> {
        let up = |coord: f64| snap(snap(coord / round_val).ceil() * round_val + offset_val);
        let down = |coord: f64| snap(snap(coord / round_val).floor() * round_val - offset_val);
        Self::new(
            up(self.lat_max),
            down(self.lat_min),
            up(self.lon_max),
            down(self.lon_min),
        )
    }

    /// Compact `N..S..E..W..` form for use in file names.
    ///
    /// Negative values are prefixed with `m`, others with `p`, and the
    /// decimal point becomes `d`: `Np1d00Sm2d50Ep3d00Wm4d00`.
    pub fn filename_repr(&self, precision: usize) -> String {
        let fmt = |coord: f64| {
            if coord < 0.0 {
                format!("m{:.*}", precision, coord.abs())
            } else {
                format!("p{:.*}", precision, coord)
            }
        };
        format!(
            "N{}S{}E{}W{}",
            fmt(self.lat_max),
            fmt(self.lat_min),
            fmt(self.lon_max),
            fmt(self.lon_min)
        )
        .replace('.', "d")
    }

    /// Area as requested by the CDS API: `[north, west, south, east]`.
    pub fn cds_area(&self) -> [f64; 4] {
        [self.lat_max, self.lon_min, self.lat_min, self.lon_max]
    }
}

fn snap(value: f64) -> f64 {
    (value * SNAP_PRECISION).round() / SNAP_PRECISION
}
