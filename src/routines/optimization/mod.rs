//! Bounded black-box fitting of model parameters against clinical targets
//!
//! An [OptimizationSpec] describes one problem: fixed model inputs, the free parameters with their
//! bounds and seed, the measured targets and the search budget. [Driver::run] solves it with the
//! chosen [Optimizer] and returns an [Outcome].

mod evolution;
mod neldermead;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routines::store::StoreError;
use crate::simulator::{ForwardModel, Metric, ModelInputs, SimulationError};

/// Loss assigned to a trial the forward model could not evaluate
pub const REJECTED_LOSS: f64 = 1e10;

#[derive(Debug, Error)]
pub enum FitError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("record {id} at t = {t}: {reason}")]
    Record { id: String, t: f64, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Simulation(#[from] SimulationError),
    #[error("optimizer failed: {0}")]
    Optimizer(String),
}

/// A parameter the optimizer may vary, addressed by its `<group>.<name>` path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreeParameter {
    pub path: String,
    pub min: f64,
    pub max: f64,
    pub seed: f64,
}

impl FreeParameter {
    pub fn new(path: impl Into<String>, min: f64, max: f64, seed: f64) -> Self {
        Self {
            path: path.into(),
            min,
            max,
            seed,
        }
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }
}

/// A measured value the model output is fitted against
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Target {
    pub metric: Metric,
    pub value: f64,
}

impl Target {
    pub fn new(metric: Metric, value: f64) -> Self {
        Self { metric, value }
    }

    /// Relative error of a simulated value
    pub fn error(&self, simulated: f64) -> f64 {
        (simulated - self.value).abs() / self.value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Objective {
    /// Minimize the sum of relative errors
    Single,
    /// Keep every relative error as its own objective
    Multi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Optimizer {
    /// Sequential Nelder-Mead simplex, single objective only
    #[default]
    NelderMead,
    /// Parallel differential evolution, single or multi objective
    DifferentialEvolution,
}

impl std::fmt::Display for Optimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Optimizer::NelderMead => write!(f, "Nelder-Mead"),
            Optimizer::DifferentialEvolution => write!(f, "differential evolution"),
        }
    }
}

/// One optimization problem
#[derive(Debug, Clone)]
pub struct OptimizationSpec {
    pub inputs: ModelInputs,
    pub free: Vec<FreeParameter>,
    pub targets: Vec<Target>,
    /// Iterations for Nelder-Mead, evaluations for differential evolution
    pub budget: usize,
    pub workers: usize,
    pub objective: Objective,
    pub tol: f64,
    pub optimizer: Optimizer,
    /// Seed of the random streams used by differential evolution
    pub seed: u32,
}

impl OptimizationSpec {
    /// Check the problem is well posed before anything is evaluated
    pub fn validate(&self) -> Result<(), FitError> {
        let config = |msg: String| Err(FitError::Config(msg));

        if self.free.is_empty() {
            return config("no free parameter to optimize".to_string());
        }
        for (i, p) in self.free.iter().enumerate() {
            if self.inputs.get(&p.path).is_none() {
                return config(format!("unknown parameter '{}'", p.path));
            }
            if self.free[..i].iter().any(|q| q.path == p.path) {
                return config(format!("parameter '{}' is declared twice", p.path));
            }
            if !(p.min.is_finite() && p.max.is_finite() && p.min < p.max) {
                return config(format!(
                    "bounds of '{}' must be finite with min < max, got [{}, {}]",
                    p.path, p.min, p.max
                ));
            }
            if !(p.seed >= p.min && p.seed <= p.max) {
                return config(format!(
                    "seed {} of '{}' lies outside [{}, {}]",
                    p.seed, p.path, p.min, p.max
                ));
            }
        }
        if self.targets.is_empty() {
            return config("no target to fit against".to_string());
        }
        for target in &self.targets {
            if !(target.value.is_finite() && target.value > 0.0) {
                return config(format!(
                    "target {} must be positive and finite, got {}",
                    target.metric.column(),
                    target.value
                ));
            }
        }
        if self.budget == 0 {
            return config("the search budget must be at least 1".to_string());
        }
        if self.workers == 0 {
            return config("at least one worker is required".to_string());
        }
        if !(self.tol.is_finite() && self.tol >= 0.0) {
            return config(format!("tolerance must be non-negative, got {}", self.tol));
        }
        if self.optimizer == Optimizer::NelderMead {
            if self.workers > 1 {
                return config(format!(
                    "Nelder-Mead is sequential, {} workers were requested",
                    self.workers
                ));
            }
            if self.objective == Objective::Multi {
                return config("Nelder-Mead cannot optimize multiple objectives".to_string());
            }
        }
        Ok(())
    }

    pub fn seeds(&self) -> Vec<f64> {
        self.free.iter().map(|p| p.seed).collect()
    }
}

/// Clinical metrics of a simulated circulation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metrics {
    pub sys: f64,
    pub dia: f64,
    pub sv: f64,
}

impl Metrics {
    pub fn get(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Systolic => self.sys,
            Metric::Diastolic => self.dia,
            Metric::StrokeVolume => self.sv,
        }
    }

    fn rejected() -> Self {
        Self {
            sys: f64::NAN,
            dia: f64::NAN,
            sv: f64::NAN,
        }
    }
}

/// A recommended parameter vector and the model response at it
#[derive(Debug, Clone)]
pub struct Recommendation {
    /// Free parameter values by path
    pub values: BTreeMap<String, f64>,
    /// Complete model inputs the metrics were computed from
    pub inputs: ModelInputs,
    pub metrics: Metrics,
    /// Sum of the relative errors against the targets
    pub loss: f64,
    /// Rank within the Pareto set, zero for single-objective fits
    pub pareto_index: usize,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Single(Recommendation),
    /// Pareto-optimal recommendations ordered by ascending loss
    ParetoSet(Vec<Recommendation>),
}

impl Outcome {
    /// The lowest-loss recommendation
    pub fn best(&self) -> &Recommendation {
        match self {
            Outcome::Single(r) => r,
            Outcome::ParetoSet(set) => &set[0],
        }
    }

    pub fn recommendations(&self) -> &[Recommendation] {
        match self {
            Outcome::Single(r) => std::slice::from_ref(r),
            Outcome::ParetoSet(set) => set,
        }
    }

    pub fn len(&self) -> usize {
        self.recommendations().len()
    }

    pub fn is_empty(&self) -> bool {
        self.recommendations().is_empty()
    }
}

/// Evaluates trial vectors of one [OptimizationSpec]
pub(crate) struct Problem<'a, M: ForwardModel> {
    model: &'a M,
    spec: &'a OptimizationSpec,
}

impl<'a, M: ForwardModel> Problem<'a, M> {
    fn new(model: &'a M, spec: &'a OptimizationSpec) -> Self {
        Self { model, spec }
    }

    fn dims(&self) -> usize {
        self.spec.free.len()
    }

    fn bounds(&self) -> Vec<(f64, f64)> {
        self.spec.free.iter().map(|p| (p.min, p.max)).collect()
    }

    /// Model inputs at `x`, clamped into bounds
    fn inputs_at(&self, x: &[f64]) -> Result<ModelInputs, SimulationError> {
        let mut inputs = self.spec.inputs.clone();
        for (p, &v) in self.spec.free.iter().zip(x) {
            inputs.set(&p.path, p.clamp(v))?;
        }
        Ok(inputs)
    }

    fn simulate(&self, x: &[f64]) -> Result<(ModelInputs, Metrics), SimulationError> {
        let inputs = self.inputs_at(x)?;
        let solution = self.model.solve(&inputs)?;
        let (sys, dia) = solution.systolic_diastolic();
        let metrics = Metrics {
            sys,
            dia,
            sv: solution.stroke_volume(),
        };
        Ok((inputs, metrics))
    }

    fn errors(&self, metrics: &Metrics) -> Vec<f64> {
        self.spec
            .targets
            .iter()
            .map(|t| t.error(metrics.get(t.metric)))
            .collect()
    }

    /// Relative error per target, [REJECTED_LOSS] everywhere when the model fails
    fn objectives(&self, x: &[f64]) -> Vec<f64> {
        match self.simulate(x) {
            Ok((_, metrics)) => {
                let errors = self.errors(&metrics);
                if errors.iter().all(|e| e.is_finite()) {
                    errors
                } else {
                    vec![REJECTED_LOSS; self.spec.targets.len()]
                }
            }
            Err(err) => {
                tracing::trace!("Rejected trial {:?}: {}", x, err);
                vec![REJECTED_LOSS; self.spec.targets.len()]
            }
        }
    }

    fn loss(&self, x: &[f64]) -> f64 {
        self.objectives(x).iter().sum()
    }

    fn recommend(&self, x: &[f64], pareto_index: usize) -> Result<Recommendation, FitError> {
        let values: BTreeMap<String, f64> = self
            .spec
            .free
            .iter()
            .zip(x)
            .map(|(p, &v)| (p.path.clone(), p.clamp(v)))
            .collect();
        let recommendation = match self.simulate(x) {
            Ok((inputs, metrics)) => Recommendation {
                values,
                loss: self.errors(&metrics).iter().sum(),
                inputs,
                metrics,
                pareto_index,
            },
            Err(err) => {
                tracing::warn!("The recommended point {:?} cannot be simulated: {}", x, err);
                Recommendation {
                    values,
                    inputs: self.inputs_at(x)?,
                    metrics: Metrics::rejected(),
                    loss: REJECTED_LOSS,
                    pareto_index,
                }
            }
        };
        Ok(recommendation)
    }
}

/// Runs an [OptimizationSpec] against a forward model
pub struct Driver<'a, M: ForwardModel> {
    model: &'a M,
}

impl<'a, M: ForwardModel> Driver<'a, M> {
    pub fn new(model: &'a M) -> Self {
        Self { model }
    }

    pub fn run(&self, spec: &OptimizationSpec) -> Result<Outcome, FitError> {
        spec.validate()?;
        let problem = Problem::new(self.model, spec);
        tracing::trace!(
            "Optimizing {:?} with {} (budget {}, {} workers)",
            spec.free.iter().map(|p| p.path.as_str()).collect::<Vec<_>>(),
            spec.optimizer,
            spec.budget,
            spec.workers
        );

        let outcome = match (spec.optimizer, spec.objective) {
            (Optimizer::NelderMead, _) => {
                let best = neldermead::minimize(&problem)?;
                Outcome::Single(problem.recommend(&best, 0)?)
            }
            (Optimizer::DifferentialEvolution, Objective::Single) => {
                let best = evolution::minimize(&problem)?;
                Outcome::Single(problem.recommend(&best, 0)?)
            }
            (Optimizer::DifferentialEvolution, Objective::Multi) => {
                let front = evolution::pareto_front(&problem)?;
                let mut set: Vec<Recommendation> = front
                    .iter()
                    .map(|x| problem.recommend(x, 0))
                    .collect::<Result<_, _>>()?;
                set.sort_by(|a, b| a.loss.total_cmp(&b.loss));
                for (i, r) in set.iter_mut().enumerate() {
                    r.pareto_index = i;
                }
                Outcome::ParetoSet(set)
            }
        };
        Ok(outcome)
    }
}
