//! GloFAS river discharge from the Copernicus Climate Data Store.
//!
//! Three products are supported:
//!
//! - [`GlofasProduct::Reanalysis`]: historical discharge since 1979, one file per year
//! - [`GlofasProduct::Forecast`]: operational ensemble forecasts since 26 May 2021, one file per day
//! - [`GlofasProduct::Reforecast`]: ensemble hindcasts for 1999 to 2018, one file per month
//!
//! Raw GRIB rasters are downloaded through the [`engine::RetrievalEngine`]
//! and reduced to the country's reporting points during processing.
//! Decoding GRIB is left to a [`RasterReader`] implementation.

pub mod cds;
pub mod engine;
pub mod planner;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{CountryConfig, PathConfig, SourceDirs, SourceLayout};
use crate::datasource::{DataSource, LoadedData, check_file_existence};
use crate::error::Result;
use crate::geo::GeoBoundingBox;
use crate::raster::{DISCHARGE_VARIABLE, PointDataset, Raster, reporting_point_dataset};

pub use cds::CdsClient;
pub use engine::{RequestStatus, RetrievalEngine, RetrievalService};
pub use planner::{Frequency, ModelVersionWindow, PartitionKey, ProductSpec, QueryDescriptor, QueryPlanner};

/// Directory name of all GloFAS products.
const MODULE_BASENAME: &str = "glofas";

/// Grid spacing of GloFAS rasters in degrees.
const GRID_SPACING: f64 = 0.1;

/// Half a grid cell, so that cell centres on the box edge are included.
const GRID_OFFSET: f64 = 0.05;

/// Decimal places of the bounding box in file names.
const FILENAME_PRECISION: usize = 2;

/// The GloFAS datasets available on CDS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GlofasProduct {
    Reanalysis,
    Forecast,
    Reforecast,
}

impl GlofasProduct {
    /// Registry name of the product.
    pub fn label(&self) -> &'static str {
        match self {
            GlofasProduct::Reanalysis => "glofas_reanalysis",
            GlofasProduct::Forecast => "glofas_forecast",
            GlofasProduct::Reforecast => "glofas_reforecast",
        }
    }

    /// Parse `reanalysis`, `forecast` or `reforecast`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "reanalysis" | "glofas_reanalysis" => Some(GlofasProduct::Reanalysis),
            "forecast" | "glofas_forecast" => Some(GlofasProduct::Forecast),
            "reforecast" | "glofas_reforecast" => Some(GlofasProduct::Reforecast),
            _ => None,
        }
    }

    pub fn spec(&self) -> ProductSpec {
        match self {
            GlofasProduct::Reanalysis => ProductSpec {
                cds_name: "cems-glofas-historical",
                system_version: "version_3_1",
                product_types: &["consolidated"],
                date_variable_prefix: "h",
                frequency: Frequency::Yearly,
                coord_names: &["time"],
                start_date_min: literal_date(1979, 1, 1),
                end_date_max: None,
                leadtime_ceiling: None,
            },
            GlofasProduct::Forecast => ProductSpec {
                cds_name: "cems-glofas-forecast",
                system_version: "operational",
                product_types: &["control_forecast", "ensemble_perturbed_forecasts"],
                date_variable_prefix: "",
                frequency: Frequency::Daily,
                coord_names: &["number", "step"],
                start_date_min: literal_date(2021, 5, 26),
                end_date_max: None,
                leadtime_ceiling: Some(30),
            },
            GlofasProduct::Reforecast => ProductSpec {
                cds_name: "cems-glofas-reforecast",
                system_version: "version_3_1",
                product_types: &["control_reforecast", "ensemble_perturbed_reforecasts"],
                date_variable_prefix: "h",
                frequency: Frequency::Monthly,
                coord_names: &["number", "time", "step"],
                start_date_min: literal_date(1999, 1, 1),
                end_date_max: Some(literal_date(2018, 12, 31)),
                leadtime_ceiling: Some(46),
            },
        }
    }
}

fn literal_date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or(NaiveDate::MIN)
}

/// Decodes a raw GloFAS file into a raster.
///
/// Forecast products hold a control member and perturbed members; readers
/// are expected to merge them along the `number` dimension.
pub trait RasterReader: Send + Sync {
    fn read(&self, path: &Path, product: &ProductSpec) -> Result<Raster>;
}

/// One GloFAS product for one country and area.
pub struct Glofas {
    product: GlofasProduct,
    country: CountryConfig,
    area: GeoBoundingBox,
    dirs: SourceDirs,
    planner: QueryPlanner,
    engine: RetrievalEngine,
    reader: Arc<dyn RasterReader>,
    today: Option<NaiveDate>,
}

impl Glofas {
    /// Set up a product for `country` covering `area`.
    ///
    /// The area is grown outwards onto the 0.1° GloFAS grid, plus half a cell.
    pub fn new(
        product: GlofasProduct,
        country: &CountryConfig,
        area: GeoBoundingBox,
        paths: &PathConfig,
        engine: RetrievalEngine,
        reader: Arc<dyn RasterReader>,
    ) -> Result<Self> {
        let area = area.round_coords(GRID_OFFSET, GRID_SPACING)?;
        let dirs = paths.source_dirs(
            country.iso3(),
            MODULE_BASENAME,
            SourceLayout {
                is_public: true,
                ..SourceLayout::default()
            },
        );
        Ok(Self {
            product,
            country: country.clone(),
            area,
            dirs,
            planner: QueryPlanner::new(product.spec(), area),
            engine,
            reader,
            today: None,
        })
    }

    pub fn with_dates(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        self.planner = self.planner.with_dates(start, end);
        self
    }

    /// Maximum lead time in days (forecast products).
    pub fn with_leadtime_max(mut self, days: u32) -> Self {
        self.planner = self.planner.with_leadtime_max(days);
        self
    }

    pub fn with_months(mut self, months: impl IntoIterator<Item = u32>) -> Self {
        self.planner = self.planner.with_months(months);
        self
    }

    pub fn with_model_versions(mut self, windows: Vec<ModelVersionWindow>) -> Self {
        self.planner = self.planner.with_model_versions(windows);
        self
    }

    /// Pin "today" instead of reading the clock.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    pub fn product(&self) -> GlofasProduct {
        self.product
    }

    pub fn area(&self) -> GeoBoundingBox {
        self.area
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.dirs.raw.join(self.planner.spec().cds_name)
    }

    pub fn processed_dir(&self) -> &Path {
        &self.dirs.processed
    }

    /// Queries covering the configured range.
    pub fn plan(&self) -> Result<Vec<QueryDescriptor>> {
        let today = self.today.unwrap_or_else(|| Utc::now().date_naive());
        self.planner
            .plan(today, |key, leadtime| self.raw_path(key, leadtime))
    }

    fn file_stem(&self, key: &PartitionKey, leadtime: Option<u32>) -> String {
        let mut stem = format!(
            "{}_{}_{}",
            self.country.iso3(),
            self.planner.spec().cds_name,
            key.label()
        );
        if let Some(days) = leadtime {
            stem.push_str(&format!("_ltmax{days:02}d"));
        }
        stem.push('_');
        stem.push_str(&self.area.filename_repr(FILENAME_PRECISION));
        stem
    }

    fn raw_path(&self, key: &PartitionKey, leadtime: Option<u32>) -> PathBuf {
        self.raw_dir()
            .join(format!("{}.grib", self.file_stem(key, leadtime)))
    }

    fn processed_path(&self, raw_path: &Path) -> PathBuf {
        let stem = raw_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.dirs.processed.join(format!("{stem}_processed.json"))
    }

    /// Download every raw partition in the range.
    pub async fn download(&self, clobber: bool, cancel: &CancellationToken) -> Result<Vec<PathBuf>> {
        let descriptors = self.plan()?;
        info!(
            product = self.product.label(),
            queries = descriptors.len(),
            "Downloading GloFAS data"
        );
        self.engine.run(descriptors, clobber, cancel).await
    }

    /// Reduce every raw partition to the country's reporting points.
    pub async fn process(&self, clobber: bool) -> Result<Vec<PathBuf>> {
        let points = self.country.reporting_points()?;
        let spec = self.planner.spec();

        let mut outputs = Vec::new();
        for descriptor in self.plan()? {
            let processed = self.processed_path(&descriptor.output_path);
            if check_file_existence(&processed, clobber) {
                outputs.push(processed);
                continue;
            }

            let raster = self.reader.read(&descriptor.output_path, spec)?;
            let dataset = reporting_point_dataset(&raster, points, DISCHARGE_VARIABLE)?;

            tokio::fs::create_dir_all(&self.dirs.processed).await?;
            tokio::fs::write(&processed, serde_json::to_vec_pretty(&dataset)?).await?;
            info!(path = %processed.display(), points = points.len(), "Processed GloFAS partition");
            outputs.push(processed);
        }
        Ok(outputs)
    }

    /// Read every processed partition in the range, in partition order.
    pub async fn load(&self) -> Result<Vec<PointDataset>> {
        let mut datasets = Vec::new();
        for descriptor in self.plan()? {
            let processed = self.processed_path(&descriptor.output_path);
            let bytes = tokio::fs::read(&processed).await?;
            datasets.push(serde_json::from_slice(&bytes)?);
        }
        Ok(datasets)
    }
}

#[async_trait]
impl DataSource for Glofas {
    fn name(&self) -> &str {
        self.product.label()
    }

    async fn download(&self, clobber: bool, cancel: &CancellationToken) -> Result<Vec<PathBuf>> {
        Glofas::download(self, clobber, cancel).await
    }

    async fn process(&self, clobber: bool) -> Result<Vec<PathBuf>> {
        Glofas::process(self, clobber).await
    }

    async fn load(&self) -> Result<LoadedData> {
        Glofas::load(self).await.map(LoadedData::Points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    struct NoReader;

    impl RasterReader for NoReader {
        fn read(&self, path: &Path, _product: &ProductSpec) -> Result<Raster> {
            Err(Error::Raster(format!("cannot decode {}", path.display())))
        }
    }

    struct NoService;

    #[async_trait]
    impl RetrievalService for NoService {
        async fn submit(
            &self,
            _product: &str,
            _query: &std::collections::BTreeMap<String, serde_json::Value>,
        ) -> Result<String> {
            Err(Error::Service("offline".to_string()))
        }

        async fn poll(&self, _request_id: &str) -> Result<RequestStatus> {
            Err(Error::Service("offline".to_string()))
        }

        async fn fetch(&self, _request_id: &str, _destination: &Path) -> Result<()> {
            Err(Error::Service("offline".to_string()))
        }
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn glofas(product: GlofasProduct) -> Glofas {
        let country = CountryConfig::new("npl").unwrap();
        let area = GeoBoundingBox::new(30.42, 26.35, 88.2, 80.06).unwrap();
        Glofas::new(
            product,
            &country,
            area,
            &PathConfig::new("/data"),
            RetrievalEngine::new(Arc::new(NoService)),
            Arc::new(NoReader),
        )
        .unwrap()
        .with_today(ymd(2022, 10, 22))
    }

    #[test]
    fn test_product_specs() {
        assert_eq!(GlofasProduct::Reanalysis.spec().frequency, Frequency::Yearly);
        assert_eq!(GlofasProduct::Forecast.spec().start_date_min, ymd(2021, 5, 26));
        assert_eq!(
            GlofasProduct::Reforecast.spec().end_date_max,
            Some(ymd(2018, 12, 31))
        );
        assert_eq!(GlofasProduct::from_name("Forecast"), Some(GlofasProduct::Forecast));
        assert_eq!(GlofasProduct::from_name("nowcast"), None);
    }

    #[test]
    fn test_reanalysis_paths() {
        let g = glofas(GlofasProduct::Reanalysis)
            .with_dates(Some(ymd(2021, 6, 1)), Some(ymd(2022, 1, 31)));

        let plan = g.plan().unwrap();

        assert_eq!(plan.len(), 2);
        assert_eq!(
            plan[0].output_path,
            PathBuf::from(
                "/data/public/raw/npl/glofas/cems-glofas-historical/\
                 npl_cems-glofas-historical_2021_Np30d55Sp26d25Ep88d25Wp79d95.grib"
            )
        );
        assert_eq!(
            g.processed_path(&plan[0].output_path),
            PathBuf::from(
                "/data/public/processed/npl/glofas/\
                 npl_cems-glofas-historical_2021_Np30d55Sp26d25Ep88d25Wp79d95_processed.json"
            )
        );
    }

    #[test]
    fn test_forecast_paths_carry_leadtime() {
        let g = glofas(GlofasProduct::Forecast)
            .with_dates(Some(ymd(2022, 10, 1)), Some(ymd(2022, 10, 2)))
            .with_leadtime_max(7);

        let plan = g.plan().unwrap();

        assert_eq!(plan.len(), 2);
        let name = plan[1].output_path.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(
            name,
            "npl_cems-glofas-forecast_2022-10-02_ltmax07d_Np30d55Sp26d25Ep88d25Wp79d95.grib"
        );
        assert_eq!(plan[1].query_params["day"], serde_json::json!("02"));
    }

    #[tokio::test]
    async fn test_process_requires_reporting_points() {
        let g = glofas(GlofasProduct::Reanalysis);
        assert!(matches!(
            g.process(false).await,
            Err(Error::MissingReportingPoints { .. })
        ));
    }
}
