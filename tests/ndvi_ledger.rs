//! Integration tests for incremental NDVI processing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use anticipy::Error;
use anticipy::config::{CountryConfig, PathConfig};
use anticipy::dates::{Dekad, DekadInput};
use anticipy::datasource::{DataSource, LoadedData};
use anticipy::ledger::{Ledger, ProcessingRecord};
use anticipy::ndvi::{DekadFetcher, DekadRequest, NdviVariable, UsgsNdvi, ZonalStatistics};

/// Writes the dekad number into the raster file.
struct FakeFetcher;

#[async_trait]
impl DekadFetcher for FakeFetcher {
    async fn fetch(
        &self,
        request: &DekadRequest,
        destination: &Path,
        clobber: bool,
    ) -> anticipy::Result<Option<PathBuf>> {
        if destination.exists() && !clobber {
            return Ok(Some(destination.to_path_buf()));
        }
        std::fs::create_dir_all(destination.parent().unwrap())?;
        std::fs::write(destination, request.dekad.period().to_string())?;
        Ok(Some(destination.to_path_buf()))
    }
}

/// Reads the value back and reports it per admin area.
struct AdminMean {
    computed: AtomicUsize,
}

impl ZonalStatistics for AdminMean {
    fn label(&self) -> &str {
        "adm1"
    }

    fn columns(&self) -> Vec<String> {
        vec!["mean_ouest".to_string(), "mean_est".to_string()]
    }

    fn compute(&self, raster: &Path) -> anticipy::Result<BTreeMap<String, f64>> {
        self.computed.fetch_add(1, Ordering::SeqCst);
        let value: f64 = std::fs::read_to_string(raster)?.parse().unwrap();
        Ok(BTreeMap::from([
            ("mean_ouest".to_string(), value),
            ("mean_est".to_string(), value * 2.0),
        ]))
    }
}

fn ndvi(base: &Path, stats: Arc<AdminMean>) -> UsgsNdvi {
    let country =
        CountryConfig::from_json_str(r#"{"iso3": "bfa", "usgs_ndvi": {"area_name": "west-africa"}}"#)
            .unwrap();
    UsgsNdvi::new(
        NdviVariable::Smoothed,
        &country,
        &PathConfig::new(base),
        Arc::new(FakeFetcher),
        stats,
    )
    .unwrap()
    .with_range(Some(DekadInput::Pair(2019, 35)), Some("2020-01-15".into()))
    .unwrap()
}

#[tokio::test]
async fn test_only_newer_rasters_are_reprocessed() {
    let dir = tempfile::tempdir().unwrap();
    let stats = Arc::new(AdminMean {
        computed: AtomicUsize::new(0),
    });
    let source = ndvi(dir.path(), stats.clone());

    let raw = assert_ok!(source.download(false, &CancellationToken::new()).await);
    assert_eq!(raw.len(), 4);

    assert_ok!(source.process(false).await);
    assert_eq!(stats.computed.load(Ordering::SeqCst), 4);

    // a raster updated after processing is picked up again
    let updated = source.raw_path(Dekad::new(2020, 1).unwrap());
    std::fs::write(&updated, "7").unwrap();
    std::fs::File::options()
        .write(true)
        .open(&updated)
        .unwrap()
        .set_modified(SystemTime::now() + Duration::from_secs(3600))
        .unwrap();

    assert_ok!(source.process(false).await);
    assert_eq!(stats.computed.load(Ordering::SeqCst), 5);

    let LoadedData::Dekadal(rows) = assert_ok!(DataSource::load(&source).await) else {
        panic!("expected dekadal rows");
    };
    let dekads: Vec<(i32, u32)> = rows.iter().map(|r| (r.dekad.year(), r.dekad.period())).collect();
    assert_eq!(dekads, vec![(2019, 35), (2019, 36), (2020, 1), (2020, 2)]);
    assert_eq!(rows[2].values["mean_ouest"], 7.0);
    assert_eq!(rows[2].values["mean_est"], 14.0);
}

#[tokio::test]
async fn test_changed_columns_need_clobber() {
    let dir = tempfile::tempdir().unwrap();
    let stats = Arc::new(AdminMean {
        computed: AtomicUsize::new(0),
    });
    let source = ndvi(dir.path(), stats.clone());
    assert_ok!(source.download(false, &CancellationToken::new()).await);

    let stale = ProcessingRecord {
        dekad: Dekad::new(2019, 35).unwrap(),
        modified: chrono::Utc::now(),
        values: BTreeMap::from([("mean_nord".to_string(), 1.0)]),
    };
    Ledger::new(vec!["mean_nord".to_string()], vec![stale])
        .write(&source.processed_path())
        .unwrap();

    let err = assert_err!(source.process(false).await);
    assert!(matches!(err, Error::SchemaDrift { .. }));
    assert_eq!(stats.computed.load(Ordering::SeqCst), 0);

    assert_ok!(source.process(true).await);
    let ledger = Ledger::read(&source.processed_path()).unwrap();
    assert_eq!(ledger.columns, vec!["mean_ouest".to_string(), "mean_est".to_string()]);
    assert_eq!(ledger.records.len(), 4);
}

#[tokio::test]
async fn test_load_filters_to_range() {
    let dir = tempfile::tempdir().unwrap();
    let stats = Arc::new(AdminMean {
        computed: AtomicUsize::new(0),
    });
    let source = ndvi(dir.path(), stats.clone());
    assert_ok!(source.download(false, &CancellationToken::new()).await);
    assert_ok!(source.process(false).await);

    let narrow = ndvi(dir.path(), stats)
        .with_range(Some(DekadInput::Pair(2020, 1)), Some(DekadInput::Pair(2020, 1)))
        .unwrap();
    let rows = assert_ok!(narrow.load().await);

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].dekad, Dekad::new(2020, 1).unwrap());
}
