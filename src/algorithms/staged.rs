use crate::routines::optimization::{Driver, FitError, Objective, Outcome, Target};
use crate::routines::settings::Settings;
use crate::simulator::{ForwardModel, Metric, ModelInputs};
use crate::structs::memory::{CarryOver, ParameterMemory, TRACKED};
use crate::structs::record::Record;

use super::{Algorithm, Algorithms, Stage, StageBuilder};

const R_SCALE: &str = "generic_params.r_scale";
const C_SCALE: &str = "generic_params.c_scale";
const E_SCALE: &str = "generic_params.e_scale";
const V_SCALE: &str = "generic_params.v_scale";

/// Three-stage fit of one record
///
/// Blood pressure is fitted with the vascular scales, then stroke volume with the contractility
/// (and, at the start of a group, the volume) scale, and finally every scale together with the
/// thermal gains. Each stage starts from the previous stage's fitted inputs.
pub struct Staged<'a, M: ForwardModel> {
    driver: Driver<'a, M>,
    builder: StageBuilder,
    base: ModelInputs,
}

impl<'a, M: ForwardModel> Staged<'a, M> {
    pub fn new(settings: &Settings, base: ModelInputs, model: &'a M) -> Self {
        Self {
            driver: Driver::new(model),
            builder: StageBuilder::new(settings),
            base,
        }
    }

    fn target(record: &Record, metric: Metric) -> Result<Target, FitError> {
        record
            .target(metric)
            .map(|value| Target::new(metric, value))
            .ok_or_else(|| FitError::Record {
                id: format!("{:?}", record.id),
                t: record.t,
                reason: format!("no usable measured {}", metric.column()),
            })
    }

    fn run_stage(
        &self,
        stage: Stage,
        inputs: ModelInputs,
        free: &[(&str, f64)],
        targets: Vec<Target>,
    ) -> Result<Outcome, FitError> {
        let free = free
            .iter()
            .map(|&(path, seed)| self.builder.free(path, seed))
            .collect::<Result<Vec<_>, _>>()?;
        let spec = self.builder.spec(inputs, free, targets, Objective::Single);
        let outcome = self.driver.run(&spec)?;
        tracing::trace!(
            "Stage {} reached loss {:.5} at {:?}",
            stage,
            outcome.best().loss,
            outcome.best().values
        );
        Ok(outcome)
    }
}

impl<'a, M: ForwardModel> Algorithms for Staged<'a, M> {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Staged
    }

    fn fit(
        &self,
        record: &Record,
        memory: &mut ParameterMemory,
        carry: CarryOver,
    ) -> Result<Outcome, FitError> {
        let sys = Self::target(record, Metric::Systolic)?;
        let dia = Self::target(record, Metric::Diastolic)?;
        let sv = record
            .target(Metric::StrokeVolume)
            .map(|value| Target::new(Metric::StrokeVolume, value));
        let new_group = carry == CarryOver::Reset;

        let mut inputs = record.model_inputs(&self.base)?;
        memory.apply(&mut inputs)?;
        let remembered = |path: &str| memory.get(path).unwrap_or(1.0);

        let bp = self.run_stage(
            Stage::BloodPressure,
            inputs,
            &[(R_SCALE, remembered(R_SCALE)), (C_SCALE, remembered(C_SCALE))],
            vec![sys, dia],
        )?;

        let mut inputs = bp.best().inputs.clone();
        let mut joint_targets = vec![sys, dia];
        if let Some(sv) = sv {
            let mut free = vec![(E_SCALE, remembered(E_SCALE))];
            if new_group {
                free.push((V_SCALE, remembered(V_SCALE)));
            }
            let stroke = self.run_stage(Stage::StrokeVolume, inputs, &free, vec![sv])?;
            inputs = stroke.best().inputs.clone();
            joint_targets.push(sv);
        } else {
            tracing::debug!("No stroke volume measured, holding the elastance scale");
        }

        let fitted = |path: &str| inputs.get(path).unwrap_or(1.0);
        let mut free: Vec<(&str, f64)> = vec![
            (R_SCALE, fitted(R_SCALE)),
            (C_SCALE, fitted(C_SCALE)),
        ];
        if sv.is_some() {
            free.push((E_SCALE, fitted(E_SCALE)));
            if new_group {
                free.push((V_SCALE, fitted(V_SCALE)));
            }
        }
        let thermal = self.builder.bounds.thermal();
        free.extend(thermal.iter().map(|p| (p.path.as_str(), p.seed)));

        let joint = self.run_stage(Stage::Joint, inputs.clone(), &free, joint_targets)?;
        memory.commit(&joint.best().values, Some(&TRACKED[..]));
        Ok(joint)
    }
}
