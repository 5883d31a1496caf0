//! Gridded rasters and their reduction to reporting points.
//!
//! GloFAS delivers river discharge as a latitude/longitude grid with extra
//! axes for time, ensemble member and forecast step. Analysts only care
//! about a handful of gauging stations ("reporting points"), so each raw
//! raster is reduced to one series per station by picking the nearest grid
//! cell. Every station is validated against the grid before any extraction
//! happens: a single station outside the grid fails the whole reduction.

use std::collections::BTreeMap;

use ndarray::{ArrayD, Axis, IxDyn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Name of the latitude dimension.
pub const LATITUDE: &str = "latitude";

/// Name of the longitude dimension.
pub const LONGITUDE: &str = "longitude";

/// River discharge over the previous 24 hours.
pub const DISCHARGE_VARIABLE: &str = "dis24";

/// A named station at which discharge is reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportingPoint {
    /// Station name, used as the series key.
    pub name: String,

    /// Longitude in degrees east.
    pub lon: f64,

    /// Latitude in degrees north.
    pub lat: f64,
}

/// An n-dimensional gridded dataset with named dimensions.
#[derive(Debug, Clone)]
pub struct Raster {
    dims: Vec<String>,
    coords: BTreeMap<String, Vec<f64>>,
    variables: BTreeMap<String, ArrayD<f64>>,
}

impl Raster {
    /// Build a raster, checking every dimension has coordinates and every
    /// variable's shape matches them.
    pub fn new(
        dims: Vec<String>,
        coords: BTreeMap<String, Vec<f64>>,
        variables: BTreeMap<String, ArrayD<f64>>,
    ) -> Result<Self> {
        let mut shape = Vec::with_capacity(dims.len());
        for dim in &dims {
            let values = coords
                .get(dim)
                .ok_or_else(|| Error::Raster(format!("dimension {dim} has no coordinates")))?;
            shape.push(values.len());
        }
        for (name, array) in &variables {
            if array.shape() != shape.as_slice() {
                return Err(Error::Raster(format!(
                    "variable {name} has shape {:?}, expected {:?}",
                    array.shape(),
                    shape
                )));
            }
        }
        Ok(Self {
            dims,
            coords,
            variables,
        })
    }

    pub fn dims(&self) -> &[String] {
        &self.dims
    }

    pub fn coords(&self, dim: &str) -> Option<&[f64]> {
        self.coords.get(dim).map(Vec::as_slice)
    }

    pub fn variable(&self, name: &str) -> Option<&ArrayD<f64>> {
        self.variables.get(name)
    }

    fn axis_of(&self, dim: &str) -> Result<usize> {
        self.dims
            .iter()
            .position(|d| d == dim)
            .ok_or_else(|| Error::Raster(format!("missing {dim} dimension")))
    }
}

/// Coordinate range covered by one axis.
#[derive(Debug, Clone, Copy)]
struct AxisBounds {
    min: f64,
    max: f64,
}

impl AxisBounds {
    fn of(values: &[f64]) -> Result<Self> {
        if values.is_empty() {
            return Err(Error::Raster("empty spatial coordinate".to_string()));
        }
        let (min, max) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
        Ok(Self { min, max })
    }

    fn strictly_contains(&self, value: f64) -> bool {
        self.min < value && value < self.max
    }
}

/// Station series extracted from a raster.
///
/// Each series is the variable at the station's nearest grid cell,
/// flattened row-major over `dims`. Missing values are `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointDataset {
    /// Remaining non-spatial dimensions, in storage order.
    pub dims: Vec<String>,

    /// Coordinates of the remaining dimensions.
    pub coords: BTreeMap<String, Vec<f64>>,

    /// Length of each remaining dimension.
    pub shape: Vec<usize>,

    /// One series per reporting point, keyed by station name.
    pub points: BTreeMap<String, Vec<Option<f64>>>,
}

impl PointDataset {
    /// Series of one station.
    pub fn series(&self, name: &str) -> Option<&[Option<f64>]> {
        self.points.get(name).map(Vec::as_slice)
    }

    /// A station's series as an array shaped by the remaining dimensions.
    pub fn series_array(&self, name: &str) -> Option<ArrayD<f64>> {
        let values = self.points.get(name)?;
        let data = values.iter().map(|v| v.unwrap_or(f64::NAN)).collect();
        ArrayD::from_shape_vec(IxDyn(&self.shape), data).ok()
    }
}

/// Reduce a raster to one series per reporting point.
///
/// # Errors
///
/// Fails without extracting anything when `points` is empty, when the
/// raster lacks the spatial dimensions or `variable`, or when any point is
/// not strictly inside the grid.
pub fn reporting_point_dataset(
    raster: &Raster,
    points: &[ReportingPoint],
    variable: &str,
) -> Result<PointDataset> {
    if points.is_empty() {
        return Err(Error::Config("no reporting points supplied".to_string()));
    }

    let lat_axis = raster.axis_of(LATITUDE)?;
    let lon_axis = raster.axis_of(LONGITUDE)?;
    let lats = raster.coords(LATITUDE).unwrap_or_default();
    let lons = raster.coords(LONGITUDE).unwrap_or_default();
    let lat_bounds = AxisBounds::of(lats)?;
    let lon_bounds = AxisBounds::of(lons)?;

    for point in points {
        check_in_bounds(point, "lon", point.lon, lon_bounds)?;
        check_in_bounds(point, "lat", point.lat, lat_bounds)?;
    }

    let data = raster
        .variable(variable)
        .ok_or_else(|| Error::Raster(format!("missing variable {variable}")))?;

    // Remove the higher axis first so the lower axis index stays valid.
    let (first_axis, second_axis) = if lat_axis > lon_axis {
        (lat_axis, lon_axis)
    } else {
        (lon_axis, lat_axis)
    };

    let mut series = BTreeMap::new();
    for point in points {
        let lat_idx = nearest_index(lats, point.lat);
        let lon_idx = nearest_index(lons, point.lon);
        let index_for = |axis: usize| if axis == lat_axis { lat_idx } else { lon_idx };

        let cell = data
            .index_axis(Axis(first_axis), index_for(first_axis))
            .index_axis_move(Axis(second_axis), index_for(second_axis));
        let values = cell
            .iter()
            .map(|v| if v.is_nan() { None } else { Some(*v) })
            .collect();
        series.insert(point.name.clone(), values);
    }

    let dims: Vec<String> = raster
        .dims()
        .iter()
        .filter(|d| d.as_str() != LATITUDE && d.as_str() != LONGITUDE)
        .cloned()
        .collect();
    let coords = dims
        .iter()
        .filter_map(|d| raster.coords(d).map(|c| (d.clone(), c.to_vec())))
        .collect::<BTreeMap<_, _>>();
    let shape = dims.iter().map(|d| coords.get(d).map_or(0, Vec::len)).collect();

    Ok(PointDataset {
        dims,
        coords,
        shape,
        points: series,
    })
}

fn check_in_bounds(
    point: &ReportingPoint,
    axis: &'static str,
    value: f64,
    bounds: AxisBounds,
) -> Result<()> {
    if bounds.strictly_contains(value) {
        Ok(())
    } else {
        Err(Error::PointOutOfBounds {
            name: point.name.clone(),
            axis,
            value,
            min: bounds.min,
            max: bounds.max,
        })
    }
}

/// Index of the coordinate closest to `target`; ties go to the first one.
fn nearest_index(values: &[f64], target: f64) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::INFINITY), |(best, best_dist), (i, v)| {
            let dist = (v - target).abs();
            if dist < best_dist { (i, dist) } else { (best, best_dist) }
        })
        .0
}

#[cfg(test)]
mod tests {
    use super::*;

    /// time × latitude × longitude raster with value = 100*t + 10*lat_idx + lon_idx.
    fn sample_raster() -> Raster {
        let lats = vec![30.0, 29.5, 29.0, 28.5];
        let lons = vec![80.0, 80.5, 81.0];
        let times = vec![0.0, 1.0];
        let data = ArrayD::from_shape_fn(IxDyn(&[2, 4, 3]), |idx| {
            (100 * idx[0] + 10 * idx[1] + idx[2]) as f64
        });

        Raster::new(
            vec!["time".to_string(), LATITUDE.to_string(), LONGITUDE.to_string()],
            [
                ("time".to_string(), times),
                (LATITUDE.to_string(), lats),
                (LONGITUDE.to_string(), lons),
            ]
            .into_iter()
            .collect(),
            [(DISCHARGE_VARIABLE.to_string(), data)].into_iter().collect(),
        )
        .unwrap()
    }

    fn point(name: &str, lon: f64, lat: f64) -> ReportingPoint {
        ReportingPoint {
            name: name.to_string(),
            lon,
            lat,
        }
    }

    #[test]
    fn test_extracts_nearest_cell_per_point() {
        let raster = sample_raster();
        let points = vec![point("upstream", 80.6, 29.4), point("downstream", 80.1, 28.9)];

        let ds = reporting_point_dataset(&raster, &points, DISCHARGE_VARIABLE).unwrap();

        assert_eq!(ds.dims, vec!["time".to_string()]);
        assert_eq!(ds.shape, vec![2]);
        // lat 29.4 -> index 1, lon 80.6 -> index 1
        assert_eq!(ds.series("upstream").unwrap(), &[Some(11.0), Some(111.0)]);
        // lat 28.9 -> index 2, lon 80.1 -> index 0
        assert_eq!(ds.series("downstream").unwrap(), &[Some(20.0), Some(120.0)]);
    }

    #[test]
    fn test_edge_point_fails_whole_call() {
        let raster = sample_raster();
        let points = vec![point("inside", 80.6, 29.4), point("edge", 81.0, 29.0)];

        let err = reporting_point_dataset(&raster, &points, DISCHARGE_VARIABLE).unwrap_err();
        match err {
            Error::PointOutOfBounds { name, axis, min, max, .. } => {
                assert_eq!(name, "edge");
                assert_eq!(axis, "lon");
                assert_eq!(min, 80.0);
                assert_eq!(max, 81.0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_latitude_out_of_bounds() {
        let raster = sample_raster();
        let err = reporting_point_dataset(&raster, &[point("north", 80.5, 31.0)], DISCHARGE_VARIABLE)
            .unwrap_err();
        assert!(matches!(err, Error::PointOutOfBounds { axis: "lat", .. }));
    }

    #[test]
    fn test_empty_points_and_missing_variable() {
        let raster = sample_raster();
        assert!(reporting_point_dataset(&raster, &[], DISCHARGE_VARIABLE).is_err());
        assert!(matches!(
            reporting_point_dataset(&raster, &[point("a", 80.5, 29.5)], "dis06"),
            Err(Error::Raster(_))
        ));
    }

    #[test]
    fn test_raster_shape_mismatch() {
        let result = Raster::new(
            vec![LATITUDE.to_string()],
            [(LATITUDE.to_string(), vec![1.0, 2.0])].into_iter().collect(),
            [("x".to_string(), ArrayD::zeros(IxDyn(&[3])))].into_iter().collect(),
        );
        assert!(matches!(result, Err(Error::Raster(_))));
    }

    #[test]
    fn test_nan_becomes_none() {
        let mut raster = sample_raster();
        if let Some(data) = raster.variables.get_mut(DISCHARGE_VARIABLE) {
            data[[0, 1, 1]] = f64::NAN;
        }
        let ds = reporting_point_dataset(&raster, &[point("a", 80.5, 29.5)], DISCHARGE_VARIABLE)
            .unwrap();

        assert_eq!(ds.series("a").unwrap(), &[None, Some(111.0)]);
        assert!(ds.series_array("a").unwrap()[[0]].is_nan());
    }
}
