use std::ops::Index;

/// Inverse-loss weights of the points of a Pareto front
///
/// A thin wrapper around `Vec<f64>`. Weights are non-negative and sum to one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Weights {
    weights: Vec<f64>,
}

impl Weights {
    /// Weights proportional to `1 / loss`
    ///
    /// Points with a zero loss share the whole weight equally, which is the limit of inverse-loss
    /// weighting as their loss goes to zero. Returns `None` when there is no point or a loss is
    /// negative or not finite.
    pub fn from_losses(losses: &[f64]) -> Option<Self> {
        if losses.is_empty() || losses.iter().any(|l| !l.is_finite() || *l < 0.0) {
            return None;
        }

        let zeros = losses.iter().filter(|&&l| l == 0.0).count();
        let weights = if zeros > 0 {
            losses
                .iter()
                .map(|&l| if l == 0.0 { 1.0 / zeros as f64 } else { 0.0 })
                .collect()
        } else {
            let total: f64 = losses.iter().map(|l| 1.0 / l).sum();
            losses.iter().map(|l| (1.0 / l) / total).collect()
        };
        Some(Self { weights })
    }

    /// Get the number of weights.
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.weights.iter().cloned()
    }

    /// Weighted average of `values`, one value per point
    pub fn average(&self, values: &[f64]) -> f64 {
        self.weights.iter().zip(values).map(|(w, v)| w * v).sum()
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.weights.clone()
    }
}

impl Index<usize> for Weights {
    type Output = f64;
    fn index(&self, index: usize) -> &Self::Output {
        &self.weights[index]
    }
}
