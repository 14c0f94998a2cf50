use eyre::{Result, WrapErr};
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

use crate::routines::optimization::{
    FitError, FreeParameter, Objective, OptimizationSpec, Outcome, Target,
};
use crate::routines::partition::{Job, Progress};
use crate::routines::settings::{Bounds, FitSettings, Settings};
use crate::routines::store::{Row, Store, WriteMode};
use crate::simulator::{ForwardModel, ModelInputs};
use crate::structs::memory::{CarryOver, ParameterMemory};
use crate::structs::record::{Columns, Record, REQUIRED};

pub mod pareto;
pub mod staged;

use pareto::Pareto;
use staged::Staged;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// Blood pressure, then stroke volume, then a joint fit of every scale
    #[default]
    Staged,
    /// A single multi-objective fit producing a Pareto front per record
    Pareto,
}

/// Steps of the fit of one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    CarryOver,
    BloodPressure,
    StrokeVolume,
    Joint,
    Persist,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::CarryOver => write!(f, "carry-over"),
            Stage::BloodPressure => write!(f, "blood pressure"),
            Stage::StrokeVolume => write!(f, "stroke volume"),
            Stage::Joint => write!(f, "joint"),
            Stage::Persist => write!(f, "persist"),
        }
    }
}

/// Fits one record, reading and updating the parameter memory
pub trait Algorithms: Sync {
    fn algorithm(&self) -> Algorithm;
    fn fit(
        &self,
        record: &Record,
        memory: &mut ParameterMemory,
        carry: CarryOver,
    ) -> Result<Outcome, FitError>;
}

pub fn dispatch_algorithm<'a, M: ForwardModel>(
    settings: &Settings,
    model: &'a M,
) -> Result<Box<dyn Algorithms + 'a>, FitError> {
    let base = settings.fit.base_inputs()?;
    match settings.fit.algorithm {
        Algorithm::Staged => Ok(Box::new(Staged::new(settings, base, model))),
        Algorithm::Pareto => Ok(Box::new(Pareto::new(settings, base, model))),
    }
}

/// Problem settings shared by every stage
#[derive(Debug, Clone)]
pub(crate) struct StageBuilder {
    fit: FitSettings,
    bounds: Bounds,
}

impl StageBuilder {
    fn new(settings: &Settings) -> Self {
        Self {
            fit: settings.fit.clone(),
            bounds: settings.bounds.clone(),
        }
    }

    /// A free parameter over its configured range, seeded at `seed`
    fn free(&self, path: &str, seed: f64) -> Result<FreeParameter, FitError> {
        let (min, max) = self
            .bounds
            .range(path)
            .ok_or_else(|| FitError::Config(format!("no bounds are configured for '{}'", path)))?;
        Ok(FreeParameter::new(path, min, max, seed.clamp(min, max)))
    }

    fn spec(
        &self,
        inputs: ModelInputs,
        free: Vec<FreeParameter>,
        targets: Vec<Target>,
        objective: Objective,
    ) -> OptimizationSpec {
        OptimizationSpec {
            inputs,
            free,
            targets,
            budget: self.fit.budget,
            workers: self.fit.workers,
            objective,
            tol: self.fit.tol,
            optimizer: self.fit.optimizer,
            seed: self.fit.seed,
        }
    }
}

/// Rows persisted for the outcome of one record, one per recommendation
pub fn output_rows(record: &Record, outcome: &Outcome, columns: &Columns) -> Vec<Row> {
    outcome
        .recommendations()
        .iter()
        .map(|r| {
            let mut row = Row::new()
                .with(columns.id.clone(), record.id.clone())
                .with(columns.condition.clone(), record.condition.clone())
                .with(columns.time.clone(), record.t)
                .with("sys", r.metrics.sys)
                .with("sys_target", record.sys)
                .with("dia", r.metrics.dia)
                .with("dia_target", record.dia)
                .with("sv", r.metrics.sv)
                .with("sv_target", record.sv)
                .with("loss", r.loss)
                .with("pareto_index", r.pareto_index as i64);
            for (path, value) in r.inputs.flatten() {
                row.push(path, value);
            }
            row
        })
        .collect()
}

/// The sequential fit loop as a partitionable [Job]
pub struct FitJob<'a, M: ForwardModel> {
    settings: Settings,
    model: &'a M,
}

impl<'a, M: ForwardModel> FitJob<'a, M> {
    pub fn new(settings: Settings, model: &'a M) -> Self {
        Self { settings, model }
    }

    /// Columns of the input table, an error when a required one is missing
    fn check_columns(&self, source: &Store) -> Result<Vec<String>> {
        let table = &self.settings.store.input_table;
        let present = source.columns(table)?;
        let columns = &self.settings.fit.columns;
        let required = [&columns.id, &columns.condition, &columns.time]
            .into_iter()
            .map(|c| c.as_str())
            .chain(REQUIRED);
        let missing: Vec<&str> = required
            .filter(|c| !present.iter().any(|p| p == c))
            .collect();
        if !missing.is_empty() {
            return Err(FitError::Config(format!(
                "table {} is missing the columns {:?}",
                table, missing
            ))
            .into());
        }
        Ok(present)
    }
}

impl<'a, M: ForwardModel> Job for FitJob<'a, M> {
    fn name(&self) -> &str {
        "fit"
    }

    fn source_table(&self) -> &str {
        &self.settings.store.input_table
    }

    fn id_column(&self) -> &str {
        &self.settings.fit.columns.id
    }

    fn output_table(&self) -> &str {
        &self.settings.store.output_table
    }

    fn run(&self, source: &Store, sink: &Store, ids: &[Value]) -> Result<usize> {
        let (Some(first), Some(last)) = (ids.first(), ids.last()) else {
            return Ok(0);
        };
        let available = self.check_columns(source)?;
        let columns = &self.settings.fit.columns;
        let algorithm = dispatch_algorithm(&self.settings, self.model)?;

        let rows = source
            .select(Record::select(
                self.source_table(),
                columns,
                &available,
                first,
                last,
            ))
            .wrap_err_with(|| format!("Unable to read records from {}", self.source_table()))?;
        let records = rows
            .iter()
            .map(|row| Record::from_row(row, columns))
            .collect::<Result<Vec<_>, _>>()?;
        tracing::debug!(
            "Fitting {} records with the {:?} algorithm",
            records.len(),
            algorithm.algorithm()
        );

        let mut memory = ParameterMemory::new(self.settings.bounds.tracked());
        let mut progress = Progress::new(records.len(), self.settings.fit.checkpoint);
        let mut written = 0;
        for (i, record) in records.iter().enumerate() {
            progress.tick(i);
            let span = tracing::info_span!("", id = ?record.id, t = record.t);
            let _enter = span.enter();

            let carry = memory.carry_over(record, self.settings.fit.group_policy);
            tracing::trace!("{}: {:?}", Stage::CarryOver, carry);

            let outcome = match algorithm.fit(record, &mut memory, carry) {
                Ok(outcome) => outcome,
                Err(err @ FitError::Record { .. }) => {
                    tracing::warn!("Skipping record: {}", err);
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let rows = output_rows(record, &outcome, columns);
            sink.write(self.output_table(), &rows, WriteMode::Append)
                .wrap_err_with(|| {
                    format!(
                        "{} failed for table {}",
                        Stage::Persist,
                        self.output_table()
                    )
                })?;
            written += rows.len();
        }
        Ok(written)
    }
}
