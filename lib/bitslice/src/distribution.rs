use anyhow::{anyhow, ensure, Result};
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::Rng;

use crate::IntMatrix;

/// A discrete probability distribution over integer values, used to draw
/// secret-coefficient matrices with the error distribution of a given
/// parameter set.
pub struct ProbabilityDistribution {
    values: Vec<i64>,
    probabilities: Vec<f64>,
    index: WeightedIndex<f64>,
}

impl ProbabilityDistribution {
    /// Build a distribution from `(value, weight)` pairs. Weights may be
    /// counts or percentages; they are normalized to probabilities.
    pub fn new(entries: &[(i64, f64)]) -> Result<Self> {
        ensure!(!entries.is_empty(), "distribution has no entries");
        ensure!(
            entries.iter().all(|(_, w)| *w >= 0.0 && w.is_finite()),
            "distribution weights must be non-negative and finite"
        );
        let total: f64 = entries.iter().map(|(_, w)| w).sum();
        ensure!(total > 0.0, "distribution weights sum to zero");

        let values: Vec<i64> = entries.iter().map(|(v, _)| *v).collect();
        let probabilities: Vec<f64> = entries.iter().map(|(_, w)| w / total).collect();
        let index = WeightedIndex::new(probabilities.iter().copied())
            .map_err(|e| anyhow!("invalid distribution weights: {e}"))?;
        Ok(Self {
            values,
            probabilities,
            index,
        })
    }

    pub fn values(&self) -> &[i64] {
        &self.values
    }

    pub fn probabilities(&self) -> &[f64] {
        &self.probabilities
    }

    pub fn sample(&self, rng: &mut impl Rng) -> i64 {
        self.values[self.index.sample(rng)]
    }

    pub fn generate_matrix(&self, rows: usize, cols: usize, rng: &mut impl Rng) -> IntMatrix {
        let mut out = IntMatrix::zeros(rows, cols);
        for r in 0..rows {
            for c in 0..cols {
                out[(r, c)] = self.sample(rng);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn weights_are_normalized() {
        let dist = ProbabilityDistribution::new(&[(-1, 1.0), (0, 2.0), (1, 1.0)]).unwrap();
        let total: f64 = dist.probabilities().iter().sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert_eq!(dist.probabilities()[1], 0.5);
    }

    #[test]
    fn samples_stay_in_support() {
        let dist = ProbabilityDistribution::new(&[(-1, 0.25), (0, 0.5), (1, 0.25)]).unwrap();
        let mut rng = SmallRng::seed_from_u64(42);
        let m = dist.generate_matrix(16, 16, &mut rng);
        for r in 0..16 {
            for c in 0..16 {
                assert!((-1..=1).contains(&m[(r, c)]));
            }
        }
    }

    #[test]
    fn rejects_degenerate_weights() {
        assert!(ProbabilityDistribution::new(&[]).is_err());
        assert!(ProbabilityDistribution::new(&[(0, 0.0)]).is_err());
        assert!(ProbabilityDistribution::new(&[(0, -1.0)]).is_err());
    }
}
