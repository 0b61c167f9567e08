//! Factor attribution via Shapley values.
//!
//! Each factor's contribution is its average marginal contribution to the
//! coalition value across factor orderings: exact enumeration over all
//! subsets up to `EXACT_LIMIT` factors, seeded permutation sampling above
//! that. The coalition value function is a seam; the default is concave in
//! the summed factor weights so marginal order matters.

use facet_engine::{FacetError, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;

/// Largest factor count evaluated by exact subset enumeration.
const EXACT_LIMIT: usize = 12;

/// Permutations drawn by the sampling fallback.
const SAMPLE_PERMUTATIONS: usize = 512;

/// Seed for the sampling fallback; fixed so repeated runs agree.
const SAMPLE_SEED: u64 = 0x5eed_face7;

/// A named factor with a non-negative weight feeding the default
/// coalition value.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Factor {
    pub name: String,
    pub weight: f64,
}

impl Factor {
    pub fn new(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

/// Value of a coalition of factors, identified by index into the factor
/// list handed to [`attribute_with`].
pub trait CoalitionValue {
    fn value(&self, members: &[usize]) -> f64;
}

impl<F> CoalitionValue for F
where
    F: Fn(&[usize]) -> f64,
{
    fn value(&self, members: &[usize]) -> f64 {
        self(members)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FactorContribution {
    pub name: String,
    pub contribution: f64,
    /// Share of the total contribution, in percent.
    pub percentage: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AttributionResult {
    pub outcome: f64,
    pub contributions: Vec<FactorContribution>,
}

/// Attribute `outcome` across `factors` with the default concave
/// coalition value: `outcome * sqrt(coalition weight) / sqrt(total
/// weight)`. Negative weights are treated as zero.
pub fn attribute(outcome: f64, factors: &[Factor]) -> Result<AttributionResult> {
    let weights: Vec<f64> = factors.iter().map(|f| f.weight.max(0.0)).collect();
    let total: f64 = weights.iter().sum();
    let names: Vec<String> = factors.iter().map(|f| f.name.clone()).collect();
    if total <= 0.0 {
        // Nothing differentiates the factors; split evenly.
        let n = names.len();
        let value = move |members: &[usize]| {
            if n == 0 {
                0.0
            } else {
                outcome * members.len() as f64 / n as f64
            }
        };
        return attribute_with(outcome, &names, &value);
    }

    let value = move |members: &[usize]| {
        let coalition: f64 = members.iter().map(|&i| weights[i]).sum();
        outcome * (coalition / total).sqrt()
    };
    attribute_with(outcome, &names, &value)
}

/// Attribute `outcome` across named factors using a caller-supplied
/// coalition value function.
pub fn attribute_with(
    outcome: f64,
    factors: &[String],
    value: &dyn CoalitionValue,
) -> Result<AttributionResult> {
    let n = factors.len();
    if n == 0 {
        return Ok(AttributionResult {
            outcome,
            contributions: Vec::new(),
        });
    }
    if factors.iter().any(|f| f.is_empty()) {
        return Err(FacetError::InvalidInput("factor names must be non-empty".into()));
    }

    let raw = if n <= EXACT_LIMIT {
        shapley_exact(n, value)
    } else {
        shapley_sampled(n, value)
    };

    // Contributions are reported non-negative; percentages are shares of
    // the clamped total so they sum to 100.
    let clamped: Vec<f64> = raw.iter().map(|c| c.max(0.0)).collect();
    let total: f64 = clamped.iter().sum();
    let contributions = factors
        .iter()
        .zip(clamped)
        .map(|(name, contribution)| FactorContribution {
            name: name.clone(),
            contribution,
            percentage: if total > 0.0 {
                contribution / total * 100.0
            } else {
                100.0 / n as f64
            },
        })
        .collect();

    Ok(AttributionResult {
        outcome,
        contributions,
    })
}

/// Exact Shapley values: iterate every subset as a bitmask and weight each
/// marginal contribution by |S|! (n-|S|-1)! / n!.
fn shapley_exact(n: usize, value: &dyn CoalitionValue) -> Vec<f64> {
    let mut factorial = vec![1.0f64; n + 1];
    for i in 1..=n {
        factorial[i] = factorial[i - 1] * i as f64;
    }

    // Cache coalition values per mask; 2^n evaluations, n <= EXACT_LIMIT.
    let mask_count = 1usize << n;
    let mut values = vec![0.0f64; mask_count];
    let mut members = Vec::with_capacity(n);
    for (mask, slot) in values.iter_mut().enumerate() {
        members.clear();
        for i in 0..n {
            if mask & (1 << i) != 0 {
                members.push(i);
            }
        }
        *slot = value.value(&members);
    }

    let mut contributions = vec![0.0f64; n];
    for (i, contribution) in contributions.iter_mut().enumerate() {
        let bit = 1usize << i;
        for mask in 0..mask_count {
            if mask & bit != 0 {
                continue;
            }
            let size = mask.count_ones() as usize;
            let weight = factorial[size] * factorial[n - size - 1] / factorial[n];
            *contribution += weight * (values[mask | bit] - values[mask]);
        }
    }
    contributions
}

/// Monte-Carlo Shapley: average marginal contributions over shuffled
/// orderings. Seeded, so repeated runs are identical.
fn shapley_sampled(n: usize, value: &dyn CoalitionValue) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(SAMPLE_SEED);
    let mut order: Vec<usize> = (0..n).collect();
    let mut contributions = vec![0.0f64; n];

    for _ in 0..SAMPLE_PERMUTATIONS {
        order.shuffle(&mut rng);
        let mut coalition = Vec::with_capacity(n);
        let mut previous = value.value(&coalition);
        for &i in &order {
            coalition.push(i);
            let current = value.value(&coalition);
            contributions[i] += current - previous;
            previous = current;
        }
    }

    for contribution in &mut contributions {
        *contribution /= SAMPLE_PERMUTATIONS as f64;
    }
    contributions
}
