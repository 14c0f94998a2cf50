//! Collapse every Pareto front of a subject into one loss-weighted row
//!
//! For each point the relative error of every measured column against its target column is
//! summed into a loss, and the points are weighted by inverse loss (see [Weights]). Target and
//! static columns are copied from the subject's first point while measured columns and the
//! variable of interest are averaged with the weights.

use eyre::{Result, WrapErr};
use rusqlite::types::Value;

use crate::routines::optimization::FitError;
use crate::routines::partition::{Job, Progress};
use crate::routines::settings::ReductionSettings;
use crate::routines::store::{as_f64, quote, Query, Row, Store, WriteMode};
use crate::structs::weights::Weights;

/// The reduction as a partitionable [Job]
#[derive(Debug, Clone)]
pub struct ReductionJob {
    settings: ReductionSettings,
    checkpoint: usize,
}

impl ReductionJob {
    pub fn new(settings: ReductionSettings) -> Self {
        Self {
            settings,
            checkpoint: 10,
        }
    }

    pub fn with_checkpoint(mut self, checkpoint: usize) -> Self {
        self.checkpoint = checkpoint.max(1);
        self
    }

    /// Every column read from the source table, without duplicates
    fn used_columns(&self) -> Vec<String> {
        let s = &self.settings;
        let mut columns: Vec<String> = vec![s.id_column.clone()];
        let candidates = s
            .targets
            .keys()
            .chain(s.targets.values())
            .chain(s.static_columns.iter())
            .chain(std::iter::once(&s.var_column));
        for column in candidates {
            if !columns.contains(column) {
                columns.push(column.clone());
            }
        }
        columns
    }

    fn check_columns(&self, source: &Store) -> Result<()> {
        let present = source.columns(&self.settings.table)?;
        let missing: Vec<String> = self
            .used_columns()
            .into_iter()
            .filter(|c| !present.contains(c))
            .collect();
        if !missing.is_empty() {
            return Err(FitError::Config(format!(
                "table {} is missing the columns {:?}",
                self.settings.table, missing
            ))
            .into());
        }
        Ok(())
    }

    /// Loss of one point, `None` when the point cannot be used
    fn loss(&self, row: &Row) -> Option<f64> {
        let mut loss = 0.0;
        for (measured, target) in &self.settings.targets {
            let m = row.get_f64(measured)?;
            let t = row.get_f64(target)?;
            if t == 0.0 || !t.is_finite() || !m.is_finite() {
                return None;
            }
            loss += (m - t).abs() / t;
        }
        Some(loss)
    }

    /// Aggregate the points of subject `id`, `None` when no point is usable
    pub fn reduce(&self, id: &Value, points: &[Row]) -> Option<Row> {
        let s = &self.settings;
        let used = self.used_columns();
        let numeric: Vec<&String> = s
            .targets
            .keys()
            .chain(s.targets.values())
            .chain(std::iter::once(&s.var_column))
            .collect();

        let complete: Vec<&Row> = points
            .iter()
            .filter(|row| {
                used.iter()
                    .all(|c| !matches!(row.get(c), None | Some(Value::Null)))
            })
            .filter(|row| numeric.iter().all(|c| row.get_f64(c).is_some()))
            .collect();
        if complete.len() < points.len() {
            tracing::debug!(
                "Dropped {} incomplete points of {:?}",
                points.len() - complete.len(),
                id
            );
        }

        let mut usable = Vec::with_capacity(complete.len());
        let mut losses = Vec::with_capacity(complete.len());
        for row in complete {
            match self.loss(row) {
                Some(loss) => {
                    usable.push(row);
                    losses.push(loss);
                }
                None => tracing::warn!(
                    "Excluding a point of {:?} with a zero or non-finite target",
                    id
                ),
            }
        }

        let Some(weights) = Weights::from_losses(&losses) else {
            tracing::warn!("No usable point for {:?}, nothing written", id);
            return None;
        };
        let first = usable[0];
        let average = |column: &str| {
            let values: Vec<f64> = usable
                .iter()
                .map(|row| row.get_f64(column).unwrap_or(f64::NAN))
                .collect();
            weights.average(&values)
        };

        let mut single = Row::new().with(s.id_column.clone(), id.clone());
        for column in &s.static_columns {
            single.push(column.clone(), first.get(column).cloned().unwrap_or(Value::Null));
        }
        single.push(s.var_column.clone(), average(&s.var_column));
        for (measured, target) in &s.targets {
            single.push(target.clone(), first.get(target).cloned().unwrap_or(Value::Null));
            single.push(measured.clone(), average(measured));
        }
        Some(single)
    }
}

impl Job for ReductionJob {
    fn name(&self) -> &str {
        "reduce"
    }

    fn source_table(&self) -> &str {
        &self.settings.table
    }

    fn id_column(&self) -> &str {
        &self.settings.id_column
    }

    fn output_table(&self) -> &str {
        &self.settings.output_table
    }

    fn run(&self, source: &Store, sink: &Store, ids: &[Value]) -> Result<usize> {
        let (Some(first), Some(last)) = (ids.first(), ids.last()) else {
            return Ok(0);
        };
        self.check_columns(source)?;

        let id = quote(&self.settings.id_column);
        let columns = self
            .used_columns()
            .iter()
            .map(|c| quote(c))
            .collect::<Vec<_>>()
            .join(", ");
        let query = Query::new(format!(
            "SELECT {columns} FROM {table} WHERE {id} BETWEEN ?1 AND ?2 ORDER BY {id}, rowid",
            columns = columns,
            table = quote(&self.settings.table),
            id = id
        ))
        .bind(first.clone())
        .bind(last.clone());
        let rows = source
            .select(query)
            .wrap_err_with(|| format!("Unable to read points from {}", self.settings.table))?;

        let mut progress = Progress::new(ids.len(), self.checkpoint);
        let mut written = 0;
        let mut done = 0;
        let mut start = 0;
        while start < rows.len() {
            let subject = rows[start].get(&self.settings.id_column).cloned().unwrap_or(Value::Null);
            let end = rows[start..]
                .iter()
                .position(|row| row.get(&self.settings.id_column) != Some(&subject))
                .map_or(rows.len(), |n| start + n);

            progress.tick(done);
            if let Some(single) = self.reduce(&subject, &rows[start..end]) {
                sink.write(&self.settings.output_table, &[single], WriteMode::Append)
                    .wrap_err_with(|| {
                        format!("Unable to write to {}", self.settings.output_table)
                    })?;
                written += 1;
            }
            done += 1;
            start = end;
        }
        Ok(written)
    }
}
