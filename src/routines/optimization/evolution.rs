use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use sobol_burley::sample;

use super::{FitError, Problem, REJECTED_LOSS};
use crate::simulator::ForwardModel;

const DIFFERENTIAL_WEIGHT: f64 = 0.8;
const CROSSOVER_RATE: f64 = 0.9;

/// An evaluated point
#[derive(Debug, Clone)]
struct Member {
    x: Vec<f64>,
    objectives: Vec<f64>,
}

impl Member {
    fn loss(&self) -> f64 {
        self.objectives.iter().sum()
    }

    fn rejected(&self) -> bool {
        self.objectives.iter().any(|&o| o >= REJECTED_LOSS)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ParetoCompare {
    ADominatesB,
    Equal,
    BDominatesA,
}

/// Dominance between two objective vectors, lower is better
fn pareto_compare(a: &[f64], b: &[f64]) -> ParetoCompare {
    let mut a_better = false;
    let mut b_better = false;
    for (a_val, b_val) in a.iter().zip(b) {
        if a_val < b_val {
            a_better = true;
        } else if a_val > b_val {
            b_better = true;
        }
    }
    if a_better == b_better {
        ParetoCompare::Equal
    } else if a_better {
        ParetoCompare::ADominatesB
    } else {
        ParetoCompare::BDominatesA
    }
}

/// Non-dominated points seen so far, at most `capacity` of them
struct Archive {
    members: Vec<Member>,
    capacity: usize,
}

impl Archive {
    fn new(capacity: usize) -> Self {
        Self {
            members: Vec::new(),
            capacity,
        }
    }

    fn offer(&mut self, candidate: &Member) {
        if candidate.rejected() {
            return;
        }
        for member in &self.members {
            if member.objectives == candidate.objectives {
                return;
            }
            if pareto_compare(&member.objectives, &candidate.objectives) == ParetoCompare::ADominatesB
            {
                return;
            }
        }
        self.members.retain(|member| {
            pareto_compare(&candidate.objectives, &member.objectives) != ParetoCompare::ADominatesB
        });
        self.members.push(candidate.clone());
        if self.members.len() > self.capacity {
            self.members.sort_by(|a, b| a.loss().total_cmp(&b.loss()));
            self.members.truncate(self.capacity);
        }
    }
}

struct Evolution<'p, 'a, M: ForwardModel> {
    problem: &'p Problem<'a, M>,
    bounds: Vec<(f64, f64)>,
    population: Vec<Member>,
    pool: rayon::ThreadPool,
    rng: StdRng,
    evaluations: usize,
}

impl<'p, 'a, M: ForwardModel> Evolution<'p, 'a, M> {
    fn new(problem: &'p Problem<'a, M>) -> Result<Self, FitError> {
        let spec = problem.spec;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(spec.workers)
            .build()
            .map_err(|e| FitError::Optimizer(e.to_string()))?;
        Ok(Self {
            problem,
            bounds: problem.bounds(),
            population: Vec::new(),
            pool,
            rng: StdRng::seed_from_u64(spec.seed as u64),
            evaluations: 0,
        })
    }

    /// Population size for the problem dimension, never larger than the budget
    fn population_size(&self) -> usize {
        let dims = self.problem.dims();
        (10 * dims)
            .clamp(8, 64)
            .max(self.problem.spec.workers)
            .min(self.problem.spec.budget)
    }

    fn evaluate(&mut self, points: Vec<Vec<f64>>) -> Vec<Member> {
        let problem = self.problem;
        self.evaluations += points.len();
        self.pool.install(|| {
            points
                .into_par_iter()
                .map(|x| {
                    let objectives = problem.objectives(&x);
                    Member { x, objectives }
                })
                .collect()
        })
    }

    /// The seed vector followed by a Sobol sample of the box
    fn initialize(&mut self) {
        let n = self.population_size();
        let seed = self.problem.spec.seed;
        let mut points = vec![self.problem.spec.seeds()];
        for i in 1..n {
            let point = self
                .bounds
                .iter()
                .enumerate()
                .map(|(j, (lo, hi))| lo + sample(i as u32, j as u32, seed) as f64 * (hi - lo))
                .collect();
            points.push(point);
        }
        self.population = self.evaluate(points);
    }

    /// DE/rand/1/bin trial vector for member `i`, reflected into the box
    fn trial(&mut self, i: usize) -> Vec<f64> {
        let n = self.population.len();
        let dims = self.bounds.len();
        if n < 4 {
            // Too few members to mutate, sample uniformly instead
            return self
                .bounds
                .iter()
                .map(|&(lo, hi)| self.rng.gen_range(lo..=hi))
                .collect();
        }

        let mut pick = |exclude: &[usize]| loop {
            let r = self.rng.gen_range(0..n);
            if !exclude.contains(&r) {
                return r;
            }
        };
        let r1 = pick(&[i]);
        let r2 = pick(&[i, r1]);
        let r3 = pick(&[i, r1, r2]);
        let forced = self.rng.gen_range(0..dims);

        let target = &self.population[i].x;
        let (a, b, c) = (
            &self.population[r1].x,
            &self.population[r2].x,
            &self.population[r3].x,
        );
        let mut trial = target.clone();
        for j in 0..dims {
            if j == forced || self.rng.gen::<f64>() < CROSSOVER_RATE {
                let (lo, hi) = self.bounds[j];
                trial[j] = reflect(a[j] + DIFFERENTIAL_WEIGHT * (b[j] - c[j]), lo, hi);
            }
        }
        trial
    }

    /// Trials for the next generation, limited by the remaining budget
    fn generation(&mut self) -> Vec<(usize, Vec<f64>)> {
        let remaining = self.problem.spec.budget.saturating_sub(self.evaluations);
        let count = remaining.min(self.population.len());
        (0..count).map(|i| (i, self.trial(i))).collect()
    }

    fn best(&self) -> &Member {
        self.population
            .iter()
            .min_by(|a, b| a.loss().total_cmp(&b.loss()))
            .unwrap_or(&self.population[0])
    }

    fn loss_spread(&self) -> f64 {
        let (lo, hi) = self
            .population
            .iter()
            .map(|m| m.loss())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), l| {
                (lo.min(l), hi.max(l))
            });
        hi - lo
    }
}

fn reflect(value: f64, lo: f64, hi: f64) -> f64 {
    let reflected = if value < lo {
        lo + (lo - value)
    } else if value > hi {
        hi - (value - hi)
    } else {
        value
    };
    reflected.clamp(lo, hi)
}

/// Minimize the summed loss with greedy selection
pub(super) fn minimize<M: ForwardModel>(problem: &Problem<'_, M>) -> Result<Vec<f64>, FitError> {
    let mut de = Evolution::new(problem)?;
    de.initialize();

    let mut generations = 0;
    while de.evaluations < problem.spec.budget {
        if de.loss_spread() < problem.spec.tol {
            break;
        }
        let (indices, points): (Vec<usize>, Vec<Vec<f64>>) = de.generation().into_iter().unzip();
        let trials = de.evaluate(points);
        for (i, trial) in indices.into_iter().zip(trials) {
            if trial.loss() <= de.population[i].loss() {
                de.population[i] = trial;
            }
        }
        generations += 1;
    }

    let best = de.best();
    tracing::trace!(
        "Differential evolution stopped after {} generations and {} evaluations with loss {:.5}",
        generations,
        de.evaluations,
        best.loss()
    );
    Ok(best.x.clone())
}

/// Non-dominated points found within the budget, at most one population worth
pub(super) fn pareto_front<M: ForwardModel>(
    problem: &Problem<'_, M>,
) -> Result<Vec<Vec<f64>>, FitError> {
    let mut de = Evolution::new(problem)?;
    de.initialize();
    let mut archive = Archive::new(de.population.len());
    for member in &de.population {
        archive.offer(member);
    }

    while de.evaluations < problem.spec.budget {
        let (indices, points): (Vec<usize>, Vec<Vec<f64>>) = de.generation().into_iter().unzip();
        let trials = de.evaluate(points);
        for (i, trial) in indices.into_iter().zip(trials) {
            archive.offer(&trial);
            if pareto_compare(&de.population[i].objectives, &trial.objectives)
                != ParetoCompare::ADominatesB
            {
                de.population[i] = trial;
            }
        }
    }

    if archive.members.is_empty() {
        tracing::warn!("Every trial was rejected, keeping the best population member");
        return Ok(vec![de.best().x.clone()]);
    }
    tracing::trace!(
        "Pareto front of {} points after {} evaluations",
        archive.members.len(),
        de.evaluations
    );
    Ok(archive.members.into_iter().map(|m| m.x).collect())
}
