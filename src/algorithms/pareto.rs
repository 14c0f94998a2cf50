use crate::routines::optimization::{Driver, FitError, Objective, Outcome, Target};
use crate::routines::settings::Settings;
use crate::simulator::{ForwardModel, Metric, ModelInputs};
use crate::structs::memory::{CarryOver, ParameterMemory, TRACKED};
use crate::structs::record::Record;

use super::{Algorithm, Algorithms, Stage, StageBuilder};

/// Multi-objective fit of systolic and diastolic pressure in a single stage
///
/// Every point of the Pareto front is persisted. The lowest-loss point seeds the next record.
pub struct Pareto<'a, M: ForwardModel> {
    driver: Driver<'a, M>,
    builder: StageBuilder,
    base: ModelInputs,
    free: Vec<String>,
}

impl<'a, M: ForwardModel> Pareto<'a, M> {
    pub fn new(settings: &Settings, base: ModelInputs, model: &'a M) -> Self {
        Self {
            driver: Driver::new(model),
            builder: StageBuilder::new(settings),
            base,
            free: settings.fit.free.clone(),
        }
    }
}

impl<'a, M: ForwardModel> Algorithms for Pareto<'a, M> {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Pareto
    }

    fn fit(
        &self,
        record: &Record,
        memory: &mut ParameterMemory,
        _carry: CarryOver,
    ) -> Result<Outcome, FitError> {
        let mut targets = Vec::with_capacity(2);
        for metric in [Metric::Systolic, Metric::Diastolic] {
            let value = record.target(metric).ok_or_else(|| FitError::Record {
                id: format!("{:?}", record.id),
                t: record.t,
                reason: format!("no usable measured {}", metric.column()),
            })?;
            targets.push(Target::new(metric, value));
        }

        let mut inputs = record.model_inputs(&self.base)?;
        memory.apply(&mut inputs)?;

        let thermal = self.builder.bounds.thermal();
        let free = self
            .free
            .iter()
            .map(|path| {
                let seed = memory
                    .get(path)
                    .or_else(|| thermal.iter().find(|p| p.path == *path).map(|p| p.seed))
                    .or_else(|| inputs.get(path))
                    .unwrap_or(1.0);
                self.builder.free(path, seed)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let spec = self.builder.spec(inputs, free, targets, Objective::Multi);
        let outcome = self.driver.run(&spec)?;
        tracing::trace!(
            "Stage {} produced {} Pareto points, best loss {:.5}",
            Stage::Joint,
            outcome.len(),
            outcome.best().loss
        );

        memory.commit(&outcome.best().values, Some(&TRACKED[..]));
        Ok(outcome)
    }
}
