use argmin::{
    core::{CostFunction, Error, Executor},
    solver::neldermead::NelderMead,
};

use super::{FitError, FreeParameter, Problem};
use crate::simulator::ForwardModel;

struct SimplexCost<'a, 'b, M: ForwardModel> {
    problem: &'b Problem<'a, M>,
}

impl<'a, 'b, M: ForwardModel> CostFunction for SimplexCost<'a, 'b, M> {
    type Param = Vec<f64>;
    type Output = f64;
    fn cost(&self, x: &Self::Param) -> Result<Self::Output, Error> {
        Ok(self.problem.loss(x))
    }
}

/// Minimize the summed loss from the seed vector
///
/// The iteration budget maps to `max_iters` and the tolerance to the standard deviation of the
/// simplex costs. Vertices may leave the box, they are clamped before every evaluation.
pub(super) fn minimize<M: ForwardModel>(problem: &Problem<'_, M>) -> Result<Vec<f64>, FitError> {
    let spec = problem.spec;
    let simplex = create_initial_simplex(&spec.free);
    let solver = NelderMead::new(simplex)
        .with_sd_tolerance(spec.tol)
        .map_err(|e| FitError::Optimizer(e.to_string()))?;
    let res = Executor::new(SimplexCost { problem }, solver)
        .configure(|state| state.max_iters(spec.budget as u64))
        .run()
        .map_err(|e| FitError::Optimizer(e.to_string()))?;

    let best = res
        .state
        .best_param
        .ok_or_else(|| FitError::Optimizer("Nelder-Mead returned no point".to_string()))?;
    tracing::trace!(
        "Nelder-Mead stopped after {} iterations with loss {:.5}",
        res.state.iter,
        res.state.best_cost
    );
    Ok(spec
        .free
        .iter()
        .zip(best)
        .map(|(p, v)| p.clamp(v))
        .collect())
}

/// Seed vector plus one vertex per parameter, moved 10% toward the interior of its range
fn create_initial_simplex(free: &[FreeParameter]) -> Vec<Vec<f64>> {
    let perturbation_percentage = 0.1;
    let seed: Vec<f64> = free.iter().map(|p| p.seed).collect();

    let mut vertices = vec![seed.clone()];
    for (i, p) in free.iter().enumerate() {
        let width = p.max - p.min;
        let magnitude = if p.seed == 0.0 {
            perturbation_percentage * width
        } else {
            perturbation_percentage * p.seed.abs()
        };
        let direction = if p.seed <= 0.5 * (p.min + p.max) {
            1.0
        } else {
            -1.0
        };
        let mut value = p.clamp(p.seed + direction * magnitude);
        if value == p.seed {
            value = p.clamp(p.seed + direction * perturbation_percentage * width);
        }

        let mut vertex = seed.clone();
        vertex[i] = value;
        vertices.push(vertex);
    }
    vertices
}
