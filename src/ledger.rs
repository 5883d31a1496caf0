//! Processed-output ledger for dekadal statistics.
//!
//! A ledger is a CSV file with one row per processed dekad:
//!
//! ```text
//! date,year,dekad,modified,<computed columns...>
//! 2020-01-01,2020,1,2023-02-01T10:00:00+00:00,0.41,0.12
//! ```
//!
//! `modified` records the modification time of the raw file the row was
//! computed from. Reprocessing only touches dekads that are missing, that
//! the caller asked to overwrite, or whose raw file changed since.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, info};

use crate::dates::Dekad;
use crate::error::{Error, Result};

/// Columns every ledger starts with.
const KEY_COLUMNS: [&str; 4] = ["date", "year", "dekad", "modified"];

/// One processed dekad.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingRecord {
    pub dekad: Dekad,

    /// Modification time of the raw file when the row was computed.
    pub modified: DateTime<Utc>,

    /// Computed statistics, keyed by column name.
    pub values: BTreeMap<String, f64>,
}

impl ProcessingRecord {
    /// First day of the record's dekad.
    pub fn date(&self) -> Result<NaiveDate> {
        self.dekad.first_day()
    }
}

/// All processed rows of one output file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Ledger {
    /// Computed column names, in file order.
    pub columns: Vec<String>,
    pub records: Vec<ProcessingRecord>,
}

impl Ledger {
    pub fn new(columns: Vec<String>, records: Vec<ProcessingRecord>) -> Self {
        Self { columns, records }
    }

    /// Read a ledger, or `None` if the file does not exist.
    pub fn read_if_exists(path: &Path) -> Result<Option<Self>> {
        if !path.is_file() {
            return Ok(None);
        }
        Self::read(path).map(Some)
    }

    /// Read a ledger CSV.
    pub fn read(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();

        let position = |name: &str| {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| malformed(path, &format!("missing {name} column")))
        };
        let year_idx = position("year")?;
        let dekad_idx = position("dekad")?;
        let modified_idx = position("modified")?;

        let columns: Vec<(usize, String)> = headers
            .iter()
            .enumerate()
            .filter(|(_, h)| !KEY_COLUMNS.contains(h))
            .map(|(i, h)| (i, h.to_string()))
            .collect();

        let mut records = Vec::new();
        for row in reader.records() {
            let row = row?;
            let field = |idx: usize| row.get(idx).unwrap_or_default();

            let year: i32 = field(year_idx)
                .parse()
                .map_err(|_| malformed(path, &format!("bad year {:?}", field(year_idx))))?;
            let period: u32 = field(dekad_idx)
                .parse()
                .map_err(|_| malformed(path, &format!("bad dekad {:?}", field(dekad_idx))))?;
            let modified = DateTime::parse_from_rfc3339(field(modified_idx))
                .map_err(|_| malformed(path, &format!("bad timestamp {:?}", field(modified_idx))))?
                .with_timezone(&Utc);

            let mut values = BTreeMap::new();
            for (idx, name) in &columns {
                let raw = field(*idx);
                let value = if raw.is_empty() {
                    f64::NAN
                } else {
                    raw.parse::<f64>()
                        .map_err(|_| malformed(path, &format!("bad {name} value {raw:?}")))?
                };
                values.insert(name.clone(), value);
            }

            records.push(ProcessingRecord {
                dekad: Dekad::new(year, period)?,
                modified,
                values,
            });
        }

        Ok(Self {
            columns: columns.into_iter().map(|(_, name)| name).collect(),
            records,
        })
    }

    /// Write the ledger sorted by dekad, creating parent directories.
    pub fn write(&mut self, path: &Path) -> Result<()> {
        self.records.sort_by_key(|r| r.dekad);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)?;

        let mut header: Vec<&str> = KEY_COLUMNS.to_vec();
        header.extend(self.columns.iter().map(String::as_str));
        writer.write_record(&header)?;

        for record in &self.records {
            let mut row = vec![
                record.date()?.format("%Y-%m-%d").to_string(),
                record.dekad.year().to_string(),
                record.dekad.period().to_string(),
                record.modified.to_rfc3339(),
            ];
            for column in &self.columns {
                row.push(match record.values.get(column) {
                    Some(v) if !v.is_nan() => v.to_string(),
                    _ => String::new(),
                });
            }
            writer.write_record(&row)?;
        }
        writer.flush()?;

        debug!(path = %path.display(), rows = self.records.len(), "Wrote ledger");
        Ok(())
    }

    /// Rows whose dekad lies in `[start, end]`.
    pub fn in_range(&self, start: Dekad, end: Dekad) -> Vec<ProcessingRecord> {
        self.records
            .iter()
            .filter(|r| r.dekad >= start && r.dekad <= end)
            .cloned()
            .collect()
    }
}

fn malformed(path: &Path, detail: &str) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("{}: {detail}", path.display()),
    ))
}

/// Outcome of [`plan_reprocessing`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReprocessingPlan {
    /// Dekads to compute, in request order.
    pub to_process: Vec<Dekad>,

    /// Existing rows to keep as they are.
    pub retained: Vec<ProcessingRecord>,
}

/// Decide which requested dekads must be (re)computed.
///
/// - without a ledger, everything requested is processed;
/// - a ledger whose columns differ from `expected_columns` is discarded
///   when `overwrite` is set and is a [`Error::SchemaDrift`] otherwise;
/// - with `overwrite`, every requested dekad is reprocessed;
/// - otherwise a requested dekad is processed when it has no row yet or
///   when `raw_mtime` reports a raw file newer than the row's timestamp.
///
/// Rows for dekads being processed are dropped from `retained`. Rows
/// outside the requested range are always retained.
pub fn plan_reprocessing(
    requested: &[Dekad],
    ledger: Option<Ledger>,
    expected_columns: &[String],
    overwrite: bool,
    raw_mtime: impl Fn(Dekad) -> Option<DateTime<Utc>>,
) -> Result<ReprocessingPlan> {
    let Some(ledger) = ledger else {
        return Ok(ReprocessingPlan {
            to_process: requested.to_vec(),
            retained: Vec::new(),
        });
    };

    let expected: BTreeSet<&str> = expected_columns.iter().map(String::as_str).collect();
    let found: BTreeSet<&str> = ledger.columns.iter().map(String::as_str).collect();
    if expected != found {
        if overwrite {
            info!(
                expected = ?expected,
                found = ?found,
                "Ledger columns changed, discarding existing rows"
            );
            return Ok(ReprocessingPlan {
                to_process: requested.to_vec(),
                retained: Vec::new(),
            });
        }
        return Err(Error::SchemaDrift {
            expected: expected_columns.to_vec(),
            found: ledger.columns.clone(),
        });
    }

    let recorded: BTreeMap<Dekad, DateTime<Utc>> =
        ledger.records.iter().map(|r| (r.dekad, r.modified)).collect();

    let to_process: Vec<Dekad> = if overwrite {
        requested.to_vec()
    } else {
        requested
            .iter()
            .copied()
            .filter(|dekad| match recorded.get(dekad) {
                None => true,
                Some(processed_at) => raw_mtime(*dekad).is_some_and(|m| m > *processed_at),
            })
            .collect()
    };

    let dropping: HashSet<Dekad> = to_process.iter().copied().collect();
    let retained = ledger
        .records
        .into_iter()
        .filter(|r| !dropping.contains(&r.dekad))
        .collect();

    Ok(ReprocessingPlan {
        to_process,
        retained,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dekad(y: i32, p: u32) -> Dekad {
        Dekad::new(y, p).unwrap()
    }

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 2, day, 10, 0, 0).unwrap()
    }

    fn record(d: Dekad, modified: DateTime<Utc>, mean: f64) -> ProcessingRecord {
        ProcessingRecord {
            dekad: d,
            modified,
            values: [("mean".to_string(), mean)].into_iter().collect(),
        }
    }

    fn columns() -> Vec<String> {
        vec!["mean".to_string()]
    }

    #[test]
    fn test_no_ledger_processes_everything() {
        let requested = vec![dekad(2020, 1), dekad(2020, 2)];
        let plan = plan_reprocessing(&requested, None, &columns(), false, |_| None).unwrap();

        assert_eq!(plan.to_process, requested);
        assert!(plan.retained.is_empty());
    }

    #[test]
    fn test_unchanged_raw_file_is_skipped() {
        let ledger = Ledger::new(columns(), vec![record(dekad(2020, 1), ts(5), 0.4)]);

        let plan = plan_reprocessing(&[dekad(2020, 1)], Some(ledger.clone()), &columns(), false, |_| {
            Some(ts(5))
        })
        .unwrap();
        assert!(plan.to_process.is_empty());
        assert_eq!(plan.retained.len(), 1);

        let plan = plan_reprocessing(&[dekad(2020, 1)], Some(ledger), &columns(), false, |_| {
            Some(ts(6))
        })
        .unwrap();
        assert_eq!(plan.to_process, vec![dekad(2020, 1)]);
        assert!(plan.retained.is_empty());
    }

    #[test]
    fn test_missing_dekads_and_out_of_range_rows() {
        let ledger = Ledger::new(
            columns(),
            vec![
                record(dekad(2019, 30), ts(1), 0.1),
                record(dekad(2019, 36), ts(1), 0.2),
            ],
        );
        let requested = crate::dates::expand_range(dekad(2019, 36), dekad(2020, 2)).unwrap();

        let plan = plan_reprocessing(&requested, Some(ledger), &columns(), false, |_| Some(ts(1)))
            .unwrap();

        assert_eq!(plan.to_process, vec![dekad(2020, 1), dekad(2020, 2)]);
        let kept: Vec<Dekad> = plan.retained.iter().map(|r| r.dekad).collect();
        assert_eq!(kept, vec![dekad(2019, 30), dekad(2019, 36)]);
    }

    #[test]
    fn test_overwrite_reprocesses_requested_only() {
        let ledger = Ledger::new(
            columns(),
            vec![record(dekad(2019, 30), ts(1), 0.1), record(dekad(2020, 1), ts(1), 0.2)],
        );

        let plan =
            plan_reprocessing(&[dekad(2020, 1)], Some(ledger), &columns(), true, |_| None).unwrap();

        assert_eq!(plan.to_process, vec![dekad(2020, 1)]);
        assert_eq!(plan.retained.len(), 1);
        assert_eq!(plan.retained[0].dekad, dekad(2019, 30));
    }

    #[test]
    fn test_schema_drift() {
        let ledger = Ledger::new(vec!["median".to_string()], vec![record(dekad(2020, 1), ts(1), 0.2)]);

        let err = plan_reprocessing(&[dekad(2020, 1)], Some(ledger.clone()), &columns(), false, |_| None)
            .unwrap_err();
        assert!(matches!(err, Error::SchemaDrift { .. }));

        let plan =
            plan_reprocessing(&[dekad(2020, 1)], Some(ledger), &columns(), true, |_| None).unwrap();
        assert_eq!(plan.to_process, vec![dekad(2020, 1)]);
        assert!(plan.retained.is_empty());
    }

    #[test]
    fn test_schema_compared_as_set() {
        let both = vec!["mean".to_string(), "max".to_string()];
        let reordered = vec!["max".to_string(), "mean".to_string()];
        let ledger = Ledger::new(both, vec![]);

        assert!(plan_reprocessing(&[dekad(2020, 1)], Some(ledger), &reordered, false, |_| None).is_ok());
    }

    #[test]
    fn test_write_sorts_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.csv");
        let mut ledger = Ledger::new(
            columns(),
            vec![record(dekad(2020, 2), ts(2), 0.5), record(dekad(2019, 36), ts(1), f64::NAN)],
        );

        ledger.write(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("date,year,dekad,modified,mean\n2019-12-21,2019,36,"));

        let back = Ledger::read(&path).unwrap();
        assert_eq!(back.columns, columns());
        assert_eq!(back.records[0].dekad, dekad(2019, 36));
        assert!(back.records[0].values["mean"].is_nan());
        assert_eq!(back.records[1].values["mean"], 0.5);
        assert_eq!(back.records[1].modified, ts(2));

        assert_eq!(back.in_range(dekad(2020, 1), dekad(2020, 36)).len(), 1);
        assert!(Ledger::read_if_exists(&dir.path().join("absent.csv")).unwrap().is_none());
    }
}
