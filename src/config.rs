//! Runtime, path and country configuration.
//!
//! # Environment
//!
//! - `ANTICIPY_DATA_DIR` (required): root of the data directory tree
//! - `CDSAPI_URL`: Copernicus CDS endpoint
//! - `CDSAPI_KEY`: CDS credentials as `uid:key`
//! - `ANTICIPY_POLL_SECONDS`: seconds between CDS status sweeps
//! - `ANTICIPY_COUNTRY_CONFIG`: path to a JSON country configuration
//!
//! # Directory layout
//!
//! Every source writes under
//! `{data_dir}/{public|private}/{raw|processed}/{iso3|glb}/{source}`.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::raster::ReportingPoint;

/// Environment variable holding the data directory root.
pub const DATA_DIR_ENV: &str = "ANTICIPY_DATA_DIR";

/// Default CDS API endpoint.
pub const DEFAULT_CDS_URL: &str = "https://cds.climate.copernicus.eu/api/v2";

/// Default wait between two polling rounds.
pub const DEFAULT_POLL_SECONDS: u64 = 60;

/// Directory name for data shared by all countries.
const GLOBAL_DIR: &str = "glb";

/// Process-wide configuration read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Layout of the data directory.
    pub paths: PathConfig,

    /// CDS API endpoint.
    pub cds_url: String,

    /// CDS credentials (`uid:key`), if any.
    pub cds_key: Option<String>,

    /// Wait between two polling rounds of the retrieval engine.
    pub poll_interval: Duration,

    /// Location of the country configuration file, if set.
    pub country_config: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let data_dir = lookup(DATA_DIR_ENV)
            .ok_or_else(|| Error::Config(format!("{DATA_DIR_ENV} must be set")))?;

        let poll_seconds = match lookup("ANTICIPY_POLL_SECONDS") {
            Some(raw) => raw.parse::<u64>().map_err(|_| {
                Error::Config(format!("ANTICIPY_POLL_SECONDS must be an integer, got {raw:?}"))
            })?,
            None => DEFAULT_POLL_SECONDS,
        };

        Ok(Self {
            paths: PathConfig::new(data_dir),
            cds_url: lookup("CDSAPI_URL").unwrap_or_else(|| DEFAULT_CDS_URL.to_string()),
            cds_key: lookup("CDSAPI_KEY"),
            poll_interval: Duration::from_secs(poll_seconds),
            country_config: lookup("ANTICIPY_COUNTRY_CONFIG").map(PathBuf::from),
        })
    }
}

/// Root of the data directory tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathConfig {
    base_path: PathBuf,
}

/// Where a source keeps its files in the directory tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceLayout {
    /// Public data lives under `public/`, everything else under `private/`.
    pub is_public: bool,
    /// Raw files are shared by all countries (`glb/`).
    pub is_global_raw: bool,
    /// Processed files are shared by all countries (`glb/`).
    pub is_global_processed: bool,
}

/// Raw and processed directories of one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDirs {
    pub raw: PathBuf,
    pub processed: PathBuf,
}

impl PathConfig {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve the raw and processed directories of `source` for a country.
    pub fn source_dirs(&self, iso3: &str, source: &str, layout: SourceLayout) -> SourceDirs {
        let permission = if layout.is_public { "public" } else { "private" };
        let region = |is_global: bool| if is_global { GLOBAL_DIR } else { iso3 };

        SourceDirs {
            raw: self
                .base_path
                .join(permission)
                .join("raw")
                .join(region(layout.is_global_raw))
                .join(source),
            processed: self
                .base_path
                .join(permission)
                .join("processed")
                .join(region(layout.is_global_processed))
                .join(source),
        }
    }
}

/// Per-country settings consumed by the data sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryConfig {
    iso3: String,

    /// GloFAS settings.
    #[serde(default)]
    pub glofas: Option<GlofasConfig>,

    /// USGS NDVI settings.
    #[serde(default)]
    pub usgs_ndvi: Option<UsgsNdviConfig>,
}

/// GloFAS section of a country configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlofasConfig {
    /// Stations at which discharge is extracted.
    #[serde(default)]
    pub reporting_points: Vec<ReportingPoint>,
}

/// USGS NDVI section of a country configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsgsNdviConfig {
    /// eMODIS region covering the country.
    pub area_name: NdviArea,
}

/// eMODIS regions published by USGS FEWS NET.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NdviArea {
    NorthAfrica,
    EastAfrica,
    SouthernAfrica,
    WestAfrica,
    CentralAsia,
    Yemen,
    CentralAmerica,
    Hispaniola,
}

impl NdviArea {
    /// Path segment of the area on the USGS server.
    pub fn url_path(&self) -> &'static str {
        match self {
            NdviArea::NorthAfrica => "africa/north",
            NdviArea::EastAfrica => "africa/east",
            NdviArea::SouthernAfrica => "africa/southern",
            NdviArea::WestAfrica => "africa/west",
            NdviArea::CentralAsia => "asia/centralasia",
            NdviArea::Yemen => "asia/middleeast/yemen",
            NdviArea::CentralAmerica => "lac/camcar/centralamerica",
            NdviArea::Hispaniola => "lac/camcar/caribbean/hispaniola",
        }
    }

    /// File name prefix of the area's rasters.
    pub fn prefix(&self) -> &'static str {
        match self {
            NdviArea::NorthAfrica => "na",
            NdviArea::EastAfrica => "ea",
            NdviArea::SouthernAfrica => "sa",
            NdviArea::WestAfrica => "wa",
            NdviArea::CentralAsia => "cta",
            NdviArea::Yemen => "yem",
            NdviArea::CentralAmerica => "ca",
            NdviArea::Hispaniola => "hi",
        }
    }
}

impl CountryConfig {
    /// Create a configuration with no source sections.
    pub fn new(iso3: &str) -> Result<Self> {
        Ok(Self {
            iso3: validate_iso3(iso3)?,
            glofas: None,
            usgs_ndvi: None,
        })
    }

    /// Parse a JSON configuration, normalising the iso3 code.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let mut config: CountryConfig = serde_json::from_str(json)?;
        config.iso3 = validate_iso3(&config.iso3)?;
        Ok(config)
    }

    /// Read a JSON configuration file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Lower-case ISO 3166-1 alpha-3 code.
    pub fn iso3(&self) -> &str {
        &self.iso3
    }

    /// Reporting points for GloFAS extraction, which must not be empty.
    pub fn reporting_points(&self) -> Result<&[ReportingPoint]> {
        match &self.glofas {
            Some(glofas) if !glofas.reporting_points.is_empty() => Ok(&glofas.reporting_points),
            _ => Err(Error::MissingReportingPoints {
                iso3: self.iso3.clone(),
            }),
        }
    }

    /// eMODIS area for NDVI downloads.
    pub fn ndvi_area(&self) -> Result<NdviArea> {
        self.usgs_ndvi.map(|c| c.area_name).ok_or_else(|| {
            Error::Config(format!(
                "usgs_ndvi needs to be added to the configuration for {}",
                self.iso3
            ))
        })
    }
}

fn validate_iso3(iso3: &str) -> Result<String> {
    if iso3.len() != 3 || !iso3.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(Error::Config(format!(
            "iso3 must be a three letter string, got {iso3:?}"
        )));
    }
    Ok(iso3.to_ascii_lowercase())
}
