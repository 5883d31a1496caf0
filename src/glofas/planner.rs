//! Partitioning of a GloFAS date range into CDS queries.
//!
//! CDS limits the size of a single request, so a date range is split into
//! one query per calendar unit of the product's frequency (year, month or
//! day). Each query maps to exactly one raw output file.
//!
//! Dates before the product's first available date or after its last one
//! are clamped with a warning; a start date after the end date is rejected.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::geo::GeoBoundingBox;

/// Variable requested from every GloFAS dataset.
const DISCHARGE_VARIABLE: &str = "river_discharge_in_the_last_24_hours";

/// Hydrological model behind every GloFAS dataset.
const HYDROLOGICAL_MODEL: &str = "lisflood";

/// Temporal granularity of one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Yearly,
    Monthly,
    Daily,
}

/// Static description of a GloFAS dataset on CDS.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductSpec {
    /// CDS dataset name.
    pub cds_name: &'static str,

    /// Default `system_version` query value.
    pub system_version: &'static str,

    /// `product_type` query values.
    pub product_types: &'static [&'static str],

    /// Prefix of the year/month/day query keys (`h` for hindcasts).
    pub date_variable_prefix: &'static str,

    /// One query per unit of this frequency.
    pub frequency: Frequency,

    /// Non-spatial coordinates of the downloaded rasters.
    pub coord_names: &'static [&'static str],

    /// First available date.
    pub start_date_min: NaiveDate,

    /// Last available date, `None` meaning today.
    pub end_date_max: Option<NaiveDate>,

    /// Largest lead time in days, `None` for products without lead times.
    pub leadtime_ceiling: Option<u32>,
}

/// Calendar unit a query covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PartitionKey {
    pub year: i32,
    pub month: Option<u32>,
    pub day: Option<u32>,
}

impl PartitionKey {
    /// `YYYY`, `YYYY-MM` or `YYYY-MM-DD`.
    pub fn label(&self) -> String {
        let mut label = format!("{:04}", self.year);
        if let Some(month) = self.month {
            label.push_str(&format!("-{month:02}"));
        }
        if let Some(day) = self.day {
            label.push_str(&format!("-{day:02}"));
        }
        label
    }
}

/// A model version and the dates it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelVersionWindow {
    pub version: String,
    pub valid_from: NaiveDate,
    /// Inclusive; `None` means still current.
    pub valid_until: Option<NaiveDate>,
}

impl ModelVersionWindow {
    fn contains(&self, date: NaiveDate) -> bool {
        self.valid_from <= date && self.valid_until.is_none_or(|until| date <= until)
    }
}

/// One CDS query and the file it produces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryDescriptor {
    pub partition_key: PartitionKey,

    /// CDS dataset the query is submitted to.
    pub product_type: String,

    /// Request body.
    pub query_params: BTreeMap<String, Value>,

    /// Raw file the completed query is downloaded to.
    pub output_path: PathBuf,
}

/// Builds the list of queries for a product, area and date range.
#[derive(Debug, Clone)]
pub struct QueryPlanner {
    spec: ProductSpec,
    area: GeoBoundingBox,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
    leadtime_max: Option<u32>,
    months: Option<BTreeSet<u32>>,
    model_versions: Vec<ModelVersionWindow>,
}

impl QueryPlanner {
    pub fn new(spec: ProductSpec, area: GeoBoundingBox) -> Self {
        Self {
            spec,
            area,
            start_date: None,
            end_date: None,
            leadtime_max: None,
            months: None,
            model_versions: Vec::new(),
        }
    }

    /// Restrict the range; `None` falls back to the product bounds.
    pub fn with_dates(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        self.start_date = start;
        self.end_date = end;
        self
    }

    /// Request lead times of 1 to `days` days.
    pub fn with_leadtime_max(mut self, days: u32) -> Self {
        self.leadtime_max = Some(days);
        self
    }

    /// Only request the given months.
    ///
    /// Months outside 1 to 12 make [`QueryPlanner::plan`] fail.
    pub fn with_months(mut self, months: impl IntoIterator<Item = u32>) -> Self {
        self.months = Some(months.into_iter().collect());
        self
    }

    /// Pick `system_version` per unit from these windows.
    pub fn with_model_versions(mut self, windows: Vec<ModelVersionWindow>) -> Self {
        self.model_versions = windows;
        self
    }

    pub fn spec(&self) -> &ProductSpec {
        &self.spec
    }

    /// Effective `[start, end]` range.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidDateRange`] when the start falls after the end. This
    /// is checked before clamping to the product bounds.
    pub fn resolve_dates(&self, today: NaiveDate) -> Result<(NaiveDate, NaiveDate)> {
        let min = self.spec.start_date_min;
        let max = self.spec.end_date_max.unwrap_or(today);
        let mut start = self.start_date.unwrap_or(min);
        let mut end = self.end_date.unwrap_or(max);

        if start > end {
            return Err(Error::InvalidDateRange {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        if start < min {
            warn!(
                %start,
                %min,
                product = self.spec.cds_name,
                "Start date is before the earliest available date, clamping"
            );
            start = min;
        }
        if end > max {
            warn!(
                %end,
                %max,
                product = self.spec.cds_name,
                "End date is after the latest available date, clamping"
            );
            end = max;
        }
        Ok((start, end))
    }

    /// Lead time in days after validation against the product ceiling.
    pub fn effective_leadtime(&self) -> Result<Option<u32>> {
        match (self.spec.leadtime_ceiling, self.leadtime_max) {
            (_, Some(0)) => Err(Error::InvalidLeadtime(0)),
            (None, Some(days)) => {
                warn!(days, product = self.spec.cds_name, "Product has no lead times, ignoring");
                Ok(None)
            }
            (None, None) => Ok(None),
            (Some(ceiling), None) => Ok(Some(ceiling)),
            (Some(ceiling), Some(days)) if days > ceiling => {
                warn!(days, ceiling, product = self.spec.cds_name, "Lead time exceeds product maximum, clamping");
                Ok(Some(ceiling))
            }
            (Some(_), Some(days)) => Ok(Some(days)),
        }
    }

    /// Emit one descriptor per calendar unit intersecting the range.
    ///
    /// `output_path` maps a partition and the effective lead time to the
    /// raw file the query is downloaded to.
    pub fn plan(
        &self,
        today: NaiveDate,
        output_path: impl Fn(&PartitionKey, Option<u32>) -> PathBuf,
    ) -> Result<Vec<QueryDescriptor>> {
        let (start, end) = self.resolve_dates(today)?;
        let leadtime = self.effective_leadtime()?;
        if let Some(month) = self
            .months
            .iter()
            .flatten()
            .find(|m| !(1..=12).contains(*m))
        {
            return Err(Error::InvalidMonth(*month));
        }

        let mut descriptors = Vec::new();
        for (key, first_day) in calendar_units(self.spec.frequency, start, end) {
            let Some(months) = self.months_for(&key) else {
                debug!(unit = %key.label(), "Month excluded by filter");
                continue;
            };
            let Some(version) = self.version_for(first_day) else {
                warn!(unit = %key.label(), "No model version covers this date, skipping");
                continue;
            };

            descriptors.push(QueryDescriptor {
                partition_key: key,
                product_type: self.spec.cds_name.to_string(),
                query_params: self.query_params(&key, &months, version, leadtime),
                output_path: output_path(&key, leadtime),
            });
        }

        debug!(
            product = self.spec.cds_name,
            count = descriptors.len(),
            %start,
            %end,
            "Planned queries"
        );
        Ok(descriptors)
    }

    /// Months to request for a unit, or `None` if the unit is filtered out.
    fn months_for(&self, key: &PartitionKey) -> Option<Vec<u32>> {
        match (key.month, &self.months) {
            (Some(month), Some(allowed)) if !allowed.contains(&month) => None,
            (Some(month), _) => Some(vec![month]),
            (None, Some(allowed)) => {
                let months: Vec<u32> = allowed.iter().copied().collect();
                (!months.is_empty()).then_some(months)
            }
            (None, None) => Some((1..=12).collect()),
        }
    }

    fn version_for(&self, date: NaiveDate) -> Option<&str> {
        if self.model_versions.is_empty() {
            return Some(self.spec.system_version);
        }
        self.model_versions
            .iter()
            .find(|w| w.contains(date))
            .map(|w| w.version.as_str())
    }

    fn query_params(
        &self,
        key: &PartitionKey,
        months: &[u32],
        version: &str,
        leadtime: Option<u32>,
    ) -> BTreeMap<String, Value> {
        let prefix = self.spec.date_variable_prefix;
        let padded = |values: &mut dyn Iterator<Item = u32>| -> Value {
            Value::Array(values.map(|v| Value::String(format!("{v:02}"))).collect())
        };

        let product_type = match self.spec.product_types {
            [single] => json!(single),
            many => json!(many),
        };
        let month = match key.month {
            Some(month) => json!(format!("{month:02}")),
            None => padded(&mut months.iter().copied()),
        };
        let day = match key.day {
            Some(day) => json!(format!("{day:02}")),
            None => padded(&mut (1..=31u32)),
        };

        let mut params = BTreeMap::from([
            ("variable".to_string(), json!(DISCHARGE_VARIABLE)),
            ("format".to_string(), json!("grib")),
            ("product_type".to_string(), product_type),
            ("system_version".to_string(), json!(version)),
            ("hydrological_model".to_string(), json!(HYDROLOGICAL_MODEL)),
            (format!("{prefix}year"), json!(key.year.to_string())),
            (format!("{prefix}month"), month),
            (format!("{prefix}day"), day),
            ("area".to_string(), json!(self.area.cds_area())),
        ]);
        if let Some(days) = leadtime {
            let hours: Vec<String> = (1..=days).map(|d| (24 * d).to_string()).collect();
            params.insert("leadtime_hour".to_string(), json!(hours));
        }
        params
    }
}

/// Calendar units of `frequency` intersecting `[start, end]`, each with its
/// first day inside the range.
fn calendar_units(
    frequency: Frequency,
    start: NaiveDate,
    end: NaiveDate,
) -> Vec<(PartitionKey, NaiveDate)> {
    let mut units = Vec::new();
    match frequency {
        Frequency::Daily => {
            for date in start.iter_days().take_while(|d| *d <= end) {
                units.push((
                    PartitionKey {
                        year: date.year(),
                        month: Some(date.month()),
                        day: Some(date.day()),
                    },
                    date,
                ));
            }
        }
        Frequency::Monthly => {
            let (mut year, mut month) = (start.year(), start.month());
            while (year, month) <= (end.year(), end.month()) {
                let first = NaiveDate::from_ymd_opt(year, month, 1).map_or(start, |d| d.max(start));
                units.push((
                    PartitionKey {
                        year,
                        month: Some(month),
                        day: None,
                    },
                    first,
                ));
                (year, month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
            }
        }
        Frequency::Yearly => {
            for year in start.year()..=end.year() {
                let first = NaiveDate::from_ymd_opt(year, 1, 1).map_or(start, |d| d.max(start));
                units.push((
                    PartitionKey {
                        year,
                        month: None,
                        day: None,
                    },
                    first,
                ));
            }
        }
    }
    units
}
