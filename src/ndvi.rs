//! USGS eMODIS NDVI published on the FEWS NET data portal.
//!
//! Rasters are published per region, variable and dekad as zipped GeoTIFFs.
//! Downloading is delegated to a [`DekadFetcher`] and zonal statistics to a
//! [`ZonalStatistics`] implementation; this module decides which dekads to
//! fetch and which to (re)process, and keeps the processed ledger.
//!
//! USGS reported degraded MODIS data from dekad 13 of 2022 onwards. A
//! warning is logged whenever the requested range extends past it.
//!
//! # API Reference
//!
//! See: <https://earlywarning.usgs.gov/fews>

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{CountryConfig, NdviArea, PathConfig, SourceDirs, SourceLayout};
use crate::dates::{Dekad, DekadInput, expand_range, get_dekadal_date};
use crate::datasource::{DataSource, LoadedData, check_file_existence};
use crate::error::{Error, Result};
use crate::ledger::{Ledger, ProcessingRecord, plan_reprocessing};

const SOURCE_DIR: &str = "usgs_ndvi";

const USGS_BASE: &str = "https://edcintl.cr.usgs.gov/downloads/sciweb1/shared/fews/web";

/// First dekad with data.
pub const EARLIEST_DEKAD: (i32, u32) = (2002, 19);

/// First dekad affected by MODIS sensor degradation.
pub const DEGRADATION_DEKAD: (i32, u32) = (2022, 13);

/// eMODIS NDVI products.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NdviVariable {
    /// Temporally smoothed NDVI.
    Smoothed,
    /// Percent of the median NDVI.
    PercentMedian,
    /// Difference from the median NDVI.
    MedianAnomaly,
    /// Difference from the same dekad of the previous year.
    Difference,
}

impl NdviVariable {
    pub fn name(&self) -> &'static str {
        match self {
            NdviVariable::Smoothed => "smoothed",
            NdviVariable::PercentMedian => "percent_median",
            NdviVariable::MedianAnomaly => "median_anomaly",
            NdviVariable::Difference => "difference",
        }
    }

    /// Suffix of raster file names.
    fn file_suffix(&self) -> &'static str {
        match self {
            NdviVariable::Smoothed => "",
            NdviVariable::PercentMedian => "pct",
            NdviVariable::MedianAnomaly => "stmdn",
            NdviVariable::Difference => "dif",
        }
    }

    fn url_segment(&self) -> &'static str {
        match self {
            NdviVariable::Smoothed => "temporallysmoothedndvi",
            NdviVariable::PercentMedian => "percentofmedian",
            NdviVariable::MedianAnomaly => "mediananomaly",
            NdviVariable::Difference => "differencepreviousyear",
        }
    }
}

/// One raster to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DekadRequest {
    pub dekad: Dekad,
    /// Zip archive holding the raster.
    pub url: String,
}

/// Downloads and unpacks one dekad's raster.
#[async_trait]
pub trait DekadFetcher: Send + Sync {
    /// Store the raster at `destination`.
    ///
    /// Returns `None` when the server has no data for the dekad.
    async fn fetch(
        &self,
        request: &DekadRequest,
        destination: &Path,
        clobber: bool,
    ) -> Result<Option<PathBuf>>;
}

/// Computes per-zone statistics of one raster.
pub trait ZonalStatistics: Send + Sync {
    /// Identifies the analysis in the processed file name.
    fn label(&self) -> &str;

    /// Column names produced by [`ZonalStatistics::compute`].
    fn columns(&self) -> Vec<String>;

    fn compute(&self, raster: &Path) -> Result<BTreeMap<String, f64>>;
}

/// One NDVI variable for one country.
pub struct UsgsNdvi {
    variable: NdviVariable,
    iso3: String,
    area: NdviArea,
    dirs: SourceDirs,
    start: Dekad,
    end: Dekad,
    fetcher: Arc<dyn DekadFetcher>,
    statistics: Arc<dyn ZonalStatistics>,
    name: String,
}

impl UsgsNdvi {
    /// Set up a variable over the whole available range (earliest dekad to today).
    pub fn new(
        variable: NdviVariable,
        country: &CountryConfig,
        paths: &PathConfig,
        fetcher: Arc<dyn DekadFetcher>,
        statistics: Arc<dyn ZonalStatistics>,
    ) -> Result<Self> {
        let area = country.ndvi_area()?;
        let dirs = paths.source_dirs(
            country.iso3(),
            SOURCE_DIR,
            SourceLayout {
                is_public: true,
                is_global_raw: true,
                is_global_processed: false,
            },
        );
        let (year, period) = EARLIEST_DEKAD;
        let ndvi = Self {
            variable,
            iso3: country.iso3().to_string(),
            area,
            dirs,
            start: Dekad::new(year, period)?,
            end: Dekad::from_date(Utc::now().date_naive())?,
            fetcher,
            statistics,
            name: format!("usgs_ndvi_{}", variable.name()),
        };
        ndvi.warn_degradation()?;
        Ok(ndvi)
    }

    /// Restrict the dekad range; `None` keeps the default bound.
    ///
    /// # Errors
    ///
    /// Invalid inputs and a start after the end are rejected. A start before
    /// the earliest available dekad is clamped with a warning.
    pub fn with_range(mut self, start: Option<DekadInput>, end: Option<DekadInput>) -> Result<Self> {
        let earliest = Dekad::new(EARLIEST_DEKAD.0, EARLIEST_DEKAD.1)?;
        let mut start = get_dekadal_date(start, self.start)?;
        let end = get_dekadal_date(end, self.end)?;

        if start > end {
            return Err(Error::InvalidDateRange {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        if start < earliest {
            warn!(
                %start,
                %earliest,
                "Start date is before earliest date data is available, clamping"
            );
            start = earliest;
        }
        self.start = start;
        self.end = end;
        self.warn_degradation()?;
        Ok(self)
    }

    fn warn_degradation(&self) -> Result<()> {
        let degradation = Dekad::new(DEGRADATION_DEKAD.0, DEGRADATION_DEKAD.1)?;
        if self.end > degradation {
            warn!(
                end = %self.end,
                "USGS has reported degradation of eMODIS NDVI data from {degradation}; \
                 treat results after this dekad with care"
            );
        }
        Ok(())
    }

    pub fn range(&self) -> (Dekad, Dekad) {
        (self.start, self.end)
    }

    pub fn raw_dir(&self) -> &Path {
        &self.dirs.raw
    }

    /// Local raster path, e.g. `wa2020_01pct.tif`.
    pub fn raw_path(&self, dekad: Dekad) -> PathBuf {
        self.dirs.raw.join(format!(
            "{}{:04}_{:02}{}.tif",
            self.area.prefix(),
            dekad.year(),
            dekad.period(),
            self.variable.file_suffix()
        ))
    }

    /// Archive URL on the USGS server, which uses two-digit years.
    pub fn url(&self, dekad: Dekad) -> String {
        format!(
            "{USGS_BASE}/{}/dekadal/emodis/ndvi_c6/{}/downloads/dekadal/{}{:02}{:02}{}.zip",
            self.area.url_path(),
            self.variable.url_segment(),
            self.area.prefix(),
            dekad.year().rem_euclid(100),
            dekad.period(),
            self.variable.file_suffix()
        )
    }

    pub fn processed_path(&self) -> PathBuf {
        self.dirs.processed.join(format!(
            "{}_usgs_ndvi_{}_{}.csv",
            self.iso3,
            self.variable.name(),
            self.statistics.label()
        ))
    }

    /// Fetch every dekad in range.
    pub async fn download(&self, clobber: bool, cancel: &CancellationToken) -> Result<Vec<PathBuf>> {
        let dekads = expand_range(self.start, self.end)?;
        let total = dekads.len();
        let mut paths = Vec::new();

        for (done, dekad) in dekads.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled {
                    pending: total - done,
                });
            }
            let raw = self.raw_path(dekad);
            if check_file_existence(&raw, clobber) {
                paths.push(raw);
                continue;
            }
            let request = DekadRequest {
                dekad,
                url: self.url(dekad),
            };
            match self.fetcher.fetch(&request, &raw, clobber).await? {
                Some(path) => paths.push(path),
                None => warn!(%dekad, "No NDVI data available, skipping"),
            }
        }
        Ok(paths)
    }

    /// Compute statistics for dekads missing from (or stale in) the ledger.
    pub async fn process(&self, clobber: bool) -> Result<Vec<PathBuf>> {
        let processed = self.processed_path();
        let requested = expand_range(self.start, self.end)?;
        let existing = Ledger::read_if_exists(&processed)?;
        let had_ledger = existing.is_some();
        let columns = self.statistics.columns();

        let plan = plan_reprocessing(&requested, existing, &columns, clobber, |dekad| {
            modified_time(&self.raw_path(dekad)).ok()
        })?;

        if had_ledger && plan.to_process.is_empty() {
            info!(
                start = %self.start,
                end = %self.end,
                path = %processed.display(),
                "No new data to process, set clobber to reprocess"
            );
            return Ok(vec![processed]);
        }

        info!(
            dekads = plan.to_process.len(),
            path = %processed.display(),
            "Processing NDVI statistics"
        );
        let mut records = plan.retained;
        for dekad in plan.to_process {
            let raw = self.raw_path(dekad);
            let modified = modified_time(&raw)?;
            let values = self.statistics.compute(&raw)?;
            records.push(ProcessingRecord {
                dekad,
                modified,
                values,
            });
        }

        Ledger::new(columns, records).write(&processed)?;
        Ok(vec![processed])
    }

    /// Processed rows within the configured range.
    pub async fn load(&self) -> Result<Vec<ProcessingRecord>> {
        let ledger = Ledger::read(&self.processed_path())?;
        Ok(ledger.in_range(self.start, self.end))
    }
}

fn modified_time(path: &Path) -> Result<DateTime<Utc>> {
    Ok(DateTime::<Utc>::from(std::fs::metadata(path)?.modified()?))
}

#[async_trait]
impl DataSource for UsgsNdvi {
    fn name(&self) -> &str {
        &self.name
    }

    async fn download(&self, clobber: bool, cancel: &CancellationToken) -> Result<Vec<PathBuf>> {
        UsgsNdvi::download(self, clobber, cancel).await
    }

    async fn process(&self, clobber: bool) -> Result<Vec<PathBuf>> {
        UsgsNdvi::process(self, clobber).await
    }

    async fn load(&self) -> Result<LoadedData> {
        UsgsNdvi::load(self).await.map(LoadedData::Dekadal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FileFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DekadFetcher for FileFetcher {
        async fn fetch(
            &self,
            request: &DekadRequest,
            destination: &Path,
            _clobber: bool,
        ) -> Result<Option<PathBuf>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if request.dekad.period() == 2 {
                return Ok(None);
            }
            std::fs::create_dir_all(destination.parent().unwrap())?;
            std::fs::write(destination, request.dekad.period().to_string())?;
            Ok(Some(destination.to_path_buf()))
        }
    }

    /// Mean equals the period stored in the fake raster.
    struct Mean {
        computed: AtomicUsize,
    }

    impl ZonalStatistics for Mean {
        fn label(&self) -> &str {
            "adm1_mean"
        }

        fn columns(&self) -> Vec<String> {
            vec!["mean".to_string()]
        }

        fn compute(&self, raster: &Path) -> Result<BTreeMap<String, f64>> {
            self.computed.fetch_add(1, Ordering::SeqCst);
            let value: f64 = std::fs::read_to_string(raster)?.trim().parse().unwrap();
            Ok([("mean".to_string(), value)].into_iter().collect())
        }
    }

    fn country() -> CountryConfig {
        CountryConfig::from_json_str(r#"{"iso3": "bfa", "usgs_ndvi": {"area_name": "west-africa"}}"#)
            .unwrap()
    }

    fn ndvi(dir: &Path, stats: Arc<Mean>) -> UsgsNdvi {
        UsgsNdvi::new(
            NdviVariable::PercentMedian,
            &country(),
            &PathConfig::new(dir),
            Arc::new(FileFetcher {
                calls: AtomicUsize::new(0),
            }),
            stats,
        )
        .unwrap()
    }

    #[test]
    fn test_paths_and_urls() {
        let n = ndvi(Path::new("/data"), Arc::new(Mean { computed: AtomicUsize::new(0) }));
        let dekad = Dekad::new(2020, 1).unwrap();

        assert_eq!(
            n.raw_path(dekad),
            PathBuf::from("/data/public/raw/glb/usgs_ndvi/wa2020_01pct.tif")
        );
        assert_eq!(
            n.url(dekad),
            "https://edcintl.cr.usgs.gov/downloads/sciweb1/shared/fews/web/africa/west/dekadal/emodis/ndvi_c6/percentofmedian/downloads/dekadal/wa2001pct.zip"
        );
        assert_eq!(
            n.processed_path(),
            PathBuf::from("/data/public/processed/bfa/usgs_ndvi/bfa_usgs_ndvi_percent_median_adm1_mean.csv")
        );
    }

    #[test]
    fn test_range_validation() {
        let n = ndvi(Path::new("/data"), Arc::new(Mean { computed: AtomicUsize::new(0) }));

        let clamped = n
            .with_range(Some(DekadInput::Pair(2001, 1)), Some(DekadInput::Pair(2003, 1)))
            .unwrap();
        assert_eq!(clamped.range().0, Dekad::new(2002, 19).unwrap());

        let n = ndvi(Path::new("/data"), Arc::new(Mean { computed: AtomicUsize::new(0) }));
        assert!(matches!(
            n.with_range(Some(DekadInput::Pair(2010, 5)), Some(DekadInput::Pair(2010, 4))),
            Err(Error::InvalidDateRange { .. })
        ));
    }

    #[test]
    fn test_requires_area() {
        let result = UsgsNdvi::new(
            NdviVariable::Smoothed,
            &CountryConfig::new("bfa").unwrap(),
            &PathConfig::new("/data"),
            Arc::new(FileFetcher {
                calls: AtomicUsize::new(0),
            }),
            Arc::new(Mean { computed: AtomicUsize::new(0) }),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_download_process_load() {
        let dir = tempfile::tempdir().unwrap();
        let stats = Arc::new(Mean { computed: AtomicUsize::new(0) });
        let n = ndvi(dir.path(), stats.clone())
            .with_range(Some(DekadInput::Pair(2020, 1)), Some(DekadInput::Pair(2020, 3)))
            .unwrap();
        let cancel = CancellationToken::new();

        // dekad 2 has no data on the server
        let downloaded = n.download(false, &cancel).await.unwrap();
        assert_eq!(downloaded.len(), 2);
        std::fs::write(n.raw_path(Dekad::new(2020, 2).unwrap()), "2").unwrap();

        n.process(false).await.unwrap();
        assert_eq!(stats.computed.load(Ordering::SeqCst), 3);

        // nothing changed, nothing recomputed
        n.process(false).await.unwrap();
        assert_eq!(stats.computed.load(Ordering::SeqCst), 3);

        // clobber recomputes every requested dekad
        n.process(true).await.unwrap();
        assert_eq!(stats.computed.load(Ordering::SeqCst), 6);

        let rows = n.load().await.unwrap();
        let means: Vec<f64> = rows.iter().map(|r| r.values["mean"]).collect();
        assert_eq!(means, vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_download_reuses_existing_rasters() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FileFetcher {
            calls: AtomicUsize::new(0),
        });
        let n = UsgsNdvi::new(
            NdviVariable::Smoothed,
            &country(),
            &PathConfig::new(dir.path()),
            fetcher.clone(),
            Arc::new(Mean { computed: AtomicUsize::new(0) }),
        )
        .unwrap()
        .with_range(Some(DekadInput::Pair(2020, 1)), Some(DekadInput::Pair(2020, 3)))
        .unwrap();
        let cancel = CancellationToken::new();

        n.download(false, &cancel).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);

        // only dekad 2, which the server lacks, is asked for again
        let reused = n.download(false, &cancel).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 4);
        assert_eq!(
            reused,
            vec![
                n.raw_path(Dekad::new(2020, 1).unwrap()),
                n.raw_path(Dekad::new(2020, 3).unwrap()),
            ]
        );

        n.download(true, &cancel).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn test_download_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let n = ndvi(dir.path(), Arc::new(Mean { computed: AtomicUsize::new(0) }))
            .with_range(Some(DekadInput::Pair(2020, 1)), Some(DekadInput::Pair(2020, 3)))
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            n.download(false, &cancel).await,
            Err(Error::Cancelled { pending: 3 })
        ));
    }
}
