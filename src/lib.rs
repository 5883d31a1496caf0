//! Anticipy - Download, process and load datasets for anticipatory action.
//!
//! # Overview
//!
//! Anticipy retrieves hazard indicators for a country and reduces them to
//! small, analysis-ready series:
//!
//! - GloFAS river discharge (reanalysis, forecast, reforecast) from the
//!   Copernicus Climate Data Store, extracted at reporting points
//! - USGS eMODIS NDVI rasters, summarised per dekad into an incremental ledger
//!
//! Every source follows the same download, process and load lifecycle and
//! reuses existing files unless asked to clobber them.
//!
//! # Modules
//!
//! - [`config`]: Environment, directory layout and country configuration
//! - [`dates`]: Dekad arithmetic and date parsing
//! - [`datasource`]: The source lifecycle trait and registry
//! - [`geo`]: Bounding boxes and grid snapping
//! - [`glofas`]: GloFAS query planning, CDS retrieval and point extraction
//! - [`ledger`]: Incremental processing ledger
//! - [`ndvi`]: USGS NDVI source
//! - [`raster`]: Gridded data and reporting point extraction

pub mod config;
pub mod datasource;
pub mod dates;
pub mod error;
pub mod geo;
pub mod glofas;
pub mod ledger;
pub mod ndvi;
pub mod raster;

pub use error::{Error, Result};
