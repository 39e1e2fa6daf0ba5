//! Tabular result storage and aggregation.
//!
//! Completed jobs contribute one row of flattened parameters and metrics
//! each. The orchestrator keeps two views: the full table (one row per job)
//! and a reduced table where runs with identical parameters are averaged.

use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::constants::RESTART_PARAM_NAME;
use crate::constants::STD_ENDING;
use crate::params::ParamValue;

/// A row of a results table, keyed by column name.
pub type Row = IndexMap<String, ParamValue>;

/// An in-memory table with ordered columns and heterogeneous cells.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    /// Column names in first-seen order.
    columns: Vec<String>,
    /// The rows of the table.
    rows: Vec<Row>,
}

impl Table {
    /// Constructs an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Determines if the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Gets the column names in order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Iterates the rows of the table.
    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter()
    }

    /// Gets a row by index.
    pub fn row(&self, index: usize) -> Option<&Row> {
        self.rows.get(index)
    }

    /// Determines if the table has a column of the given name.
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    /// Appends a row, registering any columns not seen before.
    pub fn push_row(&mut self, row: Row) {
        for column in row.keys() {
            if !self.has_column(column) {
                self.columns.push(column.clone());
            }
        }
        self.rows.push(row);
    }

    /// Appends all rows of another table.
    pub fn extend(&mut self, other: Table) {
        for row in other.rows {
            self.push_row(row);
        }
    }

    /// Gets the values of a column, one entry per row.
    pub fn column_values<'a>(&'a self, name: &str) -> Vec<Option<&'a ParamValue>> {
        self.rows.iter().map(|row| row.get(name)).collect()
    }

    /// Sorts the rows by a numeric column.
    ///
    /// Rows whose cell is missing or not numeric sort last. The sort is
    /// stable, so ties keep their insertion order.
    pub fn sort_by_metric(&mut self, metric: &str, ascending: bool) {
        self.rows.sort_by(|a, b| {
            let left = a.get(metric).and_then(ParamValue::as_f64);
            let right = b.get(metric).and_then(ParamValue::as_f64);
            match (left, right) {
                (Some(l), Some(r)) => {
                    let ordering = l.partial_cmp(&r).unwrap_or(std::cmp::Ordering::Equal);
                    if ascending { ordering } else { ordering.reverse() }
                }
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            }
        });
    }

    /// Gets the `how_many` best rows by the given metric.
    pub fn best_rows(&self, metric: &str, how_many: usize, minimum: bool) -> Table {
        let mut sorted = self.clone();
        sorted.sort_by_metric(metric, minimum);
        let mut result = Table::new();
        for row in sorted.rows.into_iter().take(how_many) {
            result.push_row(row);
        }
        result
    }

    /// Computes mean metric values over rows that used the same parameters.
    ///
    /// Rows are grouped by their values on `params_to_keep`; for every group
    /// the mean of each metric is computed, a standard deviation column with
    /// the `__std` suffix is added, and the number of contributing rows is
    /// recorded under the restart-count column. The result is sorted by the
    /// first metric.
    pub fn average_out(
        &self,
        metrics: &[String],
        params_to_keep: &[String],
        sort_ascending: bool,
    ) -> Result<Table> {
        if metrics.is_empty() {
            anyhow::bail!("empty set of metrics not accepted");
        }

        // Group rows by the string form of their parameter values; insertion
        // order of groups is preserved.
        let mut groups: IndexMap<Vec<String>, Vec<&Row>> = IndexMap::new();
        for row in &self.rows {
            let key = params_to_keep
                .iter()
                .map(|p| row.get(p).map(ToString::to_string).unwrap_or_default())
                .collect();
            groups.entry(key).or_default().push(row);
        }

        let mut result = Table::new();
        for rows in groups.values() {
            let mut out = Row::new();
            for param in params_to_keep {
                if let Some(value) = rows.iter().find_map(|row| row.get(param)) {
                    out.insert(param.clone(), value.clone());
                }
            }

            out.insert(
                RESTART_PARAM_NAME.to_string(),
                ParamValue::Int(rows.len() as i64),
            );

            for metric in metrics {
                let values: Vec<f64> = rows
                    .iter()
                    .filter_map(|row| row.get(metric).and_then(ParamValue::as_f64))
                    .collect();
                if values.is_empty() {
                    continue;
                }
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                out.insert(metric.clone(), ParamValue::Float(mean));

                let std_name = format!("{metric}{STD_ENDING}");
                if params_to_keep.contains(&std_name) {
                    warn!("name {std_name} already used; skipping");
                } else if let Some(std) = sample_std(&values, mean) {
                    out.insert(std_name, ParamValue::Float(std));
                }
            }

            result.push_row(out);
        }

        result.sort_by_metric(&metrics[0], sort_ascending);
        Ok(result)
    }

    /// Writes the table to a CSV file.
    ///
    /// Missing cells are written as empty fields.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("failed to create `{path}`", path = path.display()))?;
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            let record: Vec<String> = self
                .columns
                .iter()
                .map(|c| row.get(c).map(ToString::to_string).unwrap_or_default())
                .collect();
            writer.write_record(&record)?;
        }
        writer
            .flush()
            .with_context(|| format!("failed to write `{path}`", path = path.display()))
    }

    /// Reads a table from a CSV file, guessing cell types.
    ///
    /// Cells are parsed as integers, floats, or booleans where possible and
    /// kept as strings otherwise; empty fields become missing cells.
    pub fn read_csv(path: &Path) -> Result<Table> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("failed to open `{path}`", path = path.display()))?;
        let headers: Vec<String> = reader.headers()?.iter().map(String::from).collect();

        let mut table = Table::new();
        for record in reader.records() {
            let record = record?;
            let mut row = Row::new();
            for (header, cell) in headers.iter().zip(record.iter()) {
                if cell.is_empty() {
                    continue;
                }
                row.insert(header.clone(), parse_cell(cell));
            }
            table.push_row(row);
        }
        Ok(table)
    }
}

/// Parses a CSV cell into the narrowest matching value type.
fn parse_cell(cell: &str) -> ParamValue {
    if let Ok(i) = cell.parse::<i64>() {
        return ParamValue::Int(i);
    }
    if let Ok(f) = cell.parse::<f64>() {
        return ParamValue::Float(f);
    }
    match cell {
        "true" | "True" => ParamValue::Bool(true),
        "false" | "False" => ParamValue::Bool(false),
        _ => ParamValue::String(cell.to_string()),
    }
}

/// Computes the sample standard deviation (one delta degree of freedom).
///
/// Returns `None` for fewer than two samples.
fn sample_std(values: &[f64], mean: f64) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let sum_sq: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    Some((sum_sq / (values.len() - 1) as f64).sqrt())
}

/// Writes a single mapping as a one-row CSV file.
pub fn write_one_row_csv(row: &Row, path: &Path) -> Result<()> {
    let mut table = Table::new();
    table.push_row(row.clone());
    table.write_csv(path)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    /// Builds a row of `(column, float)` pairs.
    fn row(pairs: &[(&str, f64)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), ParamValue::Float(*v)))
            .collect()
    }

    #[test]
    fn push_row_registers_new_columns() {
        let mut table = Table::new();
        table.push_row(row(&[("x", 1.0), ("loss", 3.0)]));
        table.push_row(row(&[("x", 2.0), ("accuracy", 0.5)]));
        assert_eq!(table.columns(), ["x", "loss", "accuracy"]);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn sort_puts_missing_cells_last() {
        let mut table = Table::new();
        table.push_row(row(&[("loss", 2.0)]));
        table.push_row(row(&[("other", 1.0)]));
        table.push_row(row(&[("loss", 1.0)]));
        table.sort_by_metric("loss", true);

        let values: Vec<Option<f64>> = table
            .rows()
            .map(|r| r.get("loss").and_then(ParamValue::as_f64))
            .collect();
        assert_eq!(values, [Some(1.0), Some(2.0), None]);
    }

    #[test]
    fn average_out_groups_and_counts_restarts() {
        let mut table = Table::new();
        table.push_row(row(&[("x", 1.0), ("loss", 2.0)]));
        table.push_row(row(&[("x", 1.0), ("loss", 4.0)]));
        table.push_row(row(&[("x", 2.0), ("loss", 1.0)]));

        let reduced = table
            .average_out(&["loss".into()], &["x".into()], true)
            .expect("should aggregate");
        assert_eq!(reduced.len(), 2);

        // The x=2 group has the lower mean loss and sorts first.
        let first = reduced.row(0).unwrap();
        assert_eq!(first["x"], ParamValue::Float(2.0));
        assert_eq!(first["loss"], ParamValue::Float(1.0));
        assert_eq!(first[RESTART_PARAM_NAME], ParamValue::Int(1));
        assert!(!first.contains_key("loss__std"));

        let second = reduced.row(1).unwrap();
        assert_eq!(second["loss"], ParamValue::Float(3.0));
        assert_eq!(second[RESTART_PARAM_NAME], ParamValue::Int(2));
        let std = second["loss__std"].as_f64().unwrap();
        assert!((std - std::f64::consts::SQRT_2).abs() < 1e-12);
    }

    #[test]
    fn best_rows_respect_the_direction() {
        let mut table = Table::new();
        table.push_row(row(&[("x", 1.0), ("score", 0.2)]));
        table.push_row(row(&[("x", 2.0), ("score", 0.9)]));
        table.push_row(row(&[("x", 3.0), ("score", 0.5)]));

        let best = table.best_rows("score", 2, false);
        assert_eq!(best.len(), 2);
        assert_eq!(best.row(0).unwrap()["x"], ParamValue::Float(2.0));
        assert_eq!(best.row(1).unwrap()["x"], ParamValue::Float(3.0));

        let best = table.best_rows("score", 1, true);
        assert_eq!(best.row(0).unwrap()["x"], ParamValue::Float(1.0));
    }

    #[test]
    fn csv_cells_are_parsed_by_type() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("mixed.csv");
        std::fs::write(&path, "count,rate,flag,name,note\n3,0.5,true,run-a,\n").unwrap();

        let table = Table::read_csv(&path).expect("should read");
        let row = table.row(0).unwrap();
        assert_eq!(row["count"], ParamValue::Int(3));
        assert_eq!(row["rate"], ParamValue::Float(0.5));
        assert_eq!(row["flag"], ParamValue::Bool(true));
        assert_eq!(row["name"], ParamValue::String("run-a".into()));
        // Empty fields stay missing.
        assert!(!row.contains_key("note"));
    }

    #[test]
    fn csv_round_trip() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("table.csv");

        let mut table = Table::new();
        let mut r = Row::new();
        r.insert("name".into(), ParamValue::String("first".into()));
        r.insert("count".into(), ParamValue::Int(3));
        r.insert("score".into(), ParamValue::Float(0.25));
        table.push_row(r);

        table.write_csv(&path).expect("should write");
        let restored = Table::read_csv(&path).expect("should read");
        assert_eq!(restored, table);
    }
}
