//! Anticipy - Download GloFAS river discharge for a country.
//!
//! # Overview
//!
//! Reads the runtime configuration and a country configuration from the
//! environment, registers the GloFAS products for the area around the
//! country's reporting points, and downloads the selected product from the
//! Copernicus Climate Data Store.
//!
//! # Environment
//!
//! - `ANTICIPY_DATA_DIR` - Root of the data directory tree (required)
//! - `ANTICIPY_COUNTRY_CONFIG` - Country configuration JSON (required)
//! - `ANTICIPY_GLOFAS_PRODUCT` - `reanalysis`, `forecast` or `reforecast`
//! - `CDSAPI_URL`, `CDSAPI_KEY` - CDS endpoint and credentials
//! - `ANTICIPY_POLL_SECONDS` - Seconds between CDS status checks
//!
//! Press Ctrl-C to stop waiting on pending requests. Files already
//! downloaded are kept, so a rerun only submits what is missing.

use std::env;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use anticipy::config::{Config, CountryConfig};
use anticipy::datasource::SourceRegistry;
use anticipy::geo::GeoBoundingBox;
use anticipy::glofas::{CdsClient, Glofas, GlofasProduct, ProductSpec, RasterReader, RetrievalEngine};
use anticipy::raster::Raster;

/// Default product if not specified via environment variable.
const DEFAULT_PRODUCT: &str = "reanalysis";

/// GRIB decoding is not bundled with the binary.
struct NoGribReader;

impl RasterReader for NoGribReader {
    fn read(&self, path: &Path, _product: &ProductSpec) -> anticipy::Result<Raster> {
        Err(anticipy::Error::Raster(format!(
            "no GRIB reader available for {}",
            path.display()
        )))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("anticipy=info".parse()?))
        .init();

    let config = Config::from_env()?;
    let country_path = config
        .country_config
        .clone()
        .context("ANTICIPY_COUNTRY_CONFIG must be set")?;
    let country = CountryConfig::from_path(&country_path)
        .with_context(|| format!("reading {}", country_path.display()))?;

    let product_name =
        env::var("ANTICIPY_GLOFAS_PRODUCT").unwrap_or_else(|_| DEFAULT_PRODUCT.to_string());
    let product = GlofasProduct::from_name(&product_name)
        .with_context(|| format!("unknown GloFAS product {product_name:?}"))?;

    let area = GeoBoundingBox::enclosing(
        country
            .reporting_points()?
            .iter()
            .map(|point| (point.lat, point.lon)),
    )?;

    info!(
        iso3 = country.iso3(),
        product = product.label(),
        data_dir = %config.paths.base_path().display(),
        cds_url = %config.cds_url,
        "Starting Anticipy"
    );

    let client = CdsClient::from_config(&config);
    let engine = RetrievalEngine::new(Arc::new(client)).with_poll_interval(config.poll_interval);
    let reader: Arc<dyn RasterReader> = Arc::new(NoGribReader);

    let mut registry = SourceRegistry::new();
    for p in [
        GlofasProduct::Reanalysis,
        GlofasProduct::Forecast,
        GlofasProduct::Reforecast,
    ] {
        registry.register(Glofas::new(
            p,
            &country,
            area,
            &config.paths,
            engine.clone(),
            reader.clone(),
        )?);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, abandoning pending requests");
            on_signal.cancel();
        }
    });

    let paths = registry.download(product.label(), false, &cancel).await?;
    info!(count = paths.len(), "Download finished");

    Ok(())
}
