//! The download/process/load capability shared by all data sources, and a
//! registry composing them by name.
//!
//! # Usage
//!
//! ```ignore
//! let mut registry = SourceRegistry::new();
//! registry.register(Glofas::new(GlofasProduct::Reanalysis, &country, area, &paths, engine, reader));
//! let report = registry.download_all(false, &cancel).await;
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::ledger::ProcessingRecord;
use crate::raster::PointDataset;

/// What a source hands back from [`DataSource::load`].
#[derive(Debug, Clone, PartialEq)]
pub enum LoadedData {
    /// Reporting-point series, one dataset per raw partition.
    Points(Vec<PointDataset>),
    /// Dekadal statistics rows.
    Dekadal(Vec<ProcessingRecord>),
}

/// A data provider with a download, process and load lifecycle.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Registry key, also used as the directory name.
    fn name(&self) -> &str;

    /// Fetch raw files, reusing existing ones unless `clobber` is set.
    async fn download(&self, clobber: bool, cancel: &CancellationToken) -> Result<Vec<PathBuf>>;

    /// Turn raw files into processed outputs.
    async fn process(&self, clobber: bool) -> Result<Vec<PathBuf>>;

    /// Read processed outputs.
    async fn load(&self) -> Result<LoadedData>;
}

/// Decide whether an existing output can be reused.
///
/// Returns `true` when `path` exists and `clobber` is not set, in which case
/// the caller skips recomputation and uses the file as is.
pub fn check_file_existence(path: &Path, clobber: bool) -> bool {
    let exists = path.exists();
    match (exists, clobber) {
        (true, false) => {
            info!(path = %path.display(), "File exists and clobber not set, using existing file");
            true
        }
        (true, true) => {
            info!(path = %path.display(), "File exists and clobber set, overwriting");
            false
        }
        (false, _) => {
            info!(path = %path.display(), "File does not exist, creating new");
            false
        }
    }
}

/// Failure of one source during a registry-wide run.
#[derive(Debug, Clone, Serialize)]
pub struct SourceError {
    pub source: String,
    pub message: String,
}

/// Result of running a lifecycle step over every registered source.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryReport {
    /// Files produced per source.
    pub paths: BTreeMap<String, Vec<PathBuf>>,

    /// Sources that failed, with their error message.
    pub errors: Vec<SourceError>,
}

/// Data sources keyed by name.
#[derive(Default)]
pub struct SourceRegistry {
    sources: BTreeMap<String, Box<dyn DataSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source, replacing any previous source of the same name.
    pub fn register(&mut self, source: impl DataSource + 'static) {
        let name = source.name().to_string();
        if self.sources.insert(name.clone(), Box::new(source)).is_some() {
            warn!(source = %name, "Replaced previously registered source");
        }
    }

    pub fn get(&self, name: &str) -> Option<&dyn DataSource> {
        self.sources.get(name).map(|s| s.as_ref())
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.sources.keys().map(String::as_str).collect()
    }

    fn require(&self, name: &str) -> Result<&dyn DataSource> {
        self.get(name)
            .ok_or_else(|| Error::Config(format!("no data source registered as {name}")))
    }

    pub async fn download(
        &self,
        name: &str,
        clobber: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>> {
        self.require(name)?.download(clobber, cancel).await
    }

    pub async fn process(&self, name: &str, clobber: bool) -> Result<Vec<PathBuf>> {
        self.require(name)?.process(clobber).await
    }

    pub async fn load(&self, name: &str) -> Result<LoadedData> {
        self.require(name)?.load().await
    }

    /// Download every source in turn, collecting failures instead of stopping.
    ///
    /// Cancellation stops the run before the next source starts.
    pub async fn download_all(&self, clobber: bool, cancel: &CancellationToken) -> RegistryReport {
        let mut report = RegistryReport::default();
        for (name, source) in &self.sources {
            if cancel.is_cancelled() {
                break;
            }
            match source.download(clobber, cancel).await {
                Ok(paths) => {
                    report.paths.insert(name.clone(), paths);
                }
                Err(e) => {
                    warn!(source = %name, error = %e, "Download failed");
                    report.errors.push(SourceError {
                        source: name.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Process every source in turn, collecting failures instead of stopping.
    pub async fn process_all(&self, clobber: bool) -> RegistryReport {
        let mut report = RegistryReport::default();
        for (name, source) in &self.sources {
            match source.process(clobber).await {
                Ok(paths) => {
                    report.paths.insert(name.clone(), paths);
                }
                Err(e) => {
                    warn!(source = %name, error = %e, "Processing failed");
                    report.errors.push(SourceError {
                        source: name.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
        report
    }
}
