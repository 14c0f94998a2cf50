//! Offline fitting of a lumped circulation model to patient records
//!
//! Records are read from a SQLite table, fitted one subject at a time with the parameters of the
//! previous record carried over, and the fitted model inputs are written back to the store.
//! Pareto fronts produced by the multi-objective fit can then be reduced to a single row per
//! subject. Both stages can be partitioned across processes or a pool of workers.

pub mod algorithms;
pub mod reduction;
pub mod routines;
pub mod simulator;
pub mod structs;

pub mod prelude {
    pub use crate::algorithms::{dispatch_algorithm, Algorithm, Algorithms, FitJob};
    pub use crate::reduction::ReductionJob;
    pub use crate::routines::logger::setup_log;
    pub use crate::routines::optimization::{
        Driver, FitError, FreeParameter, Objective, OptimizationSpec, Optimizer, Outcome,
        Recommendation, Target,
    };
    pub use crate::routines::partition::{Coordinator, Job, Partition};
    pub use crate::routines::settings::Settings;
    pub use crate::routines::store::{Query, RetryPolicy, Row, Store, StoreError, WriteMode};
    pub use crate::simulator::{ForwardModel, LumpedModel, Metric, ModelInputs, Solution};
    pub use crate::structs::memory::{CarryOver, GroupPolicy, ParameterMemory};
    pub use crate::structs::record::Record;
}

use eyre::Result;
use prelude::*;

/// Fit every record owned by `partition` with the bundled model
///
/// Returns the number of rows written to the output table.
pub fn fit(settings: Settings, partition: Partition) -> Result<usize> {
    settings.validate()?;
    let coordinator = Coordinator::new(settings.store.open(), partition);
    let mode = settings.store.write_mode;
    let job = FitJob::new(settings, &LumpedModel);
    coordinator.run(&job, mode)
}

/// Reduce the Pareto fronts owned by `partition` to one row per subject
pub fn reduce(settings: Settings, partition: Partition) -> Result<usize> {
    settings.validate()?;
    let coordinator = Coordinator::new(settings.store.open(), partition);
    let job = ReductionJob::new(settings.reduction).with_checkpoint(settings.fit.checkpoint);
    coordinator.run(&job, settings.store.write_mode)
}
