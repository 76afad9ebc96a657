//! Configuration types for a CPG evolution trial.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Environment variable that overrides [`EvolverConfig::root_dir`].
///
/// Evaluator processes receive the same variable so they can find the trial tree.
pub const GEN_HOME_VAR: &str = "GEN_HOME";

/// Tolerance used when checking that crossover probabilities sum to one.
pub const PROBABILITY_EPSILON: f64 = 1e-9;

fn default_population_size() -> usize {
    20
}
fn default_top_k() -> usize {
    2
}
fn default_mutation_prob() -> f64 {
    0.05
}
fn default_crossover_prob() -> Vec<f64> {
    vec![0.5, 0.5]
}
fn default_oscillators() -> usize {
    20
}
fn default_body_oscillators() -> usize {
    16
}
fn default_workers() -> usize {
    4
}
fn default_generations() -> usize {
    10
}
fn default_root_dir() -> PathBuf {
    PathBuf::from(".")
}

/// Top-level configuration for one evolutionary trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolverConfig {
    /// Numeric trial identifier (`trial<T>` directory).
    pub trial: u32,
    /// Number of individuals in every generation.
    #[serde(default = "default_population_size")]
    pub population_size: usize,
    /// Number of best individuals recombined into the next generation.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Per-gene mutation probability (0.0-1.0).
    #[serde(default = "default_mutation_prob")]
    pub mutation_prob: f64,
    /// Crossover probabilities, aligned to the best `len` parents (worst first).
    #[serde(default = "default_crossover_prob")]
    pub crossover_prob: Vec<f64>,
    /// Recombination method.
    #[serde(default)]
    pub method: RecombinationMethod,
    /// Oscillator count `n` shared by every individual.
    #[serde(default = "default_oscillators")]
    pub oscillators: usize,
    /// Oscillators with an index below this are body oscillators, the rest limbs.
    #[serde(default = "default_body_oscillators")]
    pub body_oscillators: usize,
    /// Number of parallel evaluator processes per generation.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Generation count at which the trial stops.
    #[serde(default = "default_generations")]
    pub generations: usize,
    /// Directory holding the `trial<T>` tree.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    /// External evaluator invocation.
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
    /// How individuals without a fitness are ranked.
    #[serde(default)]
    pub missing_fitness: MissingFitnessPolicy,
    /// Random seed for reproducibility.
    #[serde(default)]
    pub random_seed: Option<u64>,
}

impl Default for EvolverConfig {
    fn default() -> Self {
        Self {
            trial: 0,
            population_size: default_population_size(),
            top_k: default_top_k(),
            mutation_prob: default_mutation_prob(),
            crossover_prob: default_crossover_prob(),
            method: RecombinationMethod::default(),
            oscillators: default_oscillators(),
            body_oscillators: default_body_oscillators(),
            workers: default_workers(),
            generations: default_generations(),
            root_dir: default_root_dir(),
            evaluator: EvaluatorConfig::default(),
            missing_fitness: MissingFitnessPolicy::default(),
            random_seed: None,
        }
    }
}

/// How parents are combined into an offspring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecombinationMethod {
    /// Element-wise mean of every parent.
    Avg,
    /// Per-element pick from the best parents, weighted by crossover probability.
    #[default]
    Crossover,
}

/// Ranking rule for individuals the evaluators produced no fitness for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingFitnessPolicy {
    /// Leave them out of the ranking.
    #[default]
    Exclude,
    /// Rank them below every evaluated individual.
    Worst,
    /// Fail the generation.
    Fail,
}

/// External evaluator command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// Program to execute.
    pub program: PathBuf,
    /// Arguments placed before `<trial> <gen> <start> <end> <partition>`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Kill a worker after this many seconds. `None` waits forever.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("cpg-evaluate"),
            args: Vec::new(),
            timeout_secs: None,
        }
    }
}

impl EvolverConfig {
    /// Apply the `GEN_HOME` override to the root directory, if set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(home) = std::env::var_os(GEN_HOME_VAR)
            && !home.is_empty()
        {
            self.root_dir = PathBuf::from(home);
        }
        self
    }

    /// Worker count actually used for a population of this size.
    #[inline]
    pub fn effective_workers(&self) -> usize {
        self.workers.clamp(1, self.population_size.max(1))
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.population_size == 0 {
            return Err(ConfigError::EmptyPopulation);
        }
        if self.top_k == 0 || self.top_k > self.population_size {
            return Err(ConfigError::InvalidTopK {
                top_k: self.top_k,
                population: self.population_size,
            });
        }
        if !(0.0..=1.0).contains(&self.mutation_prob) {
            return Err(ConfigError::InvalidMutationProb(self.mutation_prob));
        }
        validate_crossover_prob(&self.crossover_prob)?;
        if self.crossover_prob.len() > self.top_k {
            return Err(ConfigError::TooManyCrossoverParents {
                probs: self.crossover_prob.len(),
                top_k: self.top_k,
            });
        }
        if self.oscillators == 0 {
            return Err(ConfigError::NoOscillators);
        }
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.evaluator.program.as_os_str().is_empty() {
            return Err(ConfigError::MissingEvaluator);
        }
        Ok(())
    }
}

/// Check that crossover probabilities are each in [0,1] and sum to one.
pub fn validate_crossover_prob(probs: &[f64]) -> Result<(), ConfigError> {
    if probs.is_empty() {
        return Err(ConfigError::EmptyCrossoverProb);
    }
    if let Some(&p) = probs.iter().find(|p| !(0.0..=1.0).contains(*p)) {
        return Err(ConfigError::CrossoverProbOutOfRange(p));
    }
    let sum: f64 = probs.iter().sum();
    if (sum - 1.0).abs() > PROBABILITY_EPSILON {
        return Err(ConfigError::CrossoverProbSum(sum));
    }
    Ok(())
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Population size must be non-zero")]
    EmptyPopulation,
    #[error("top_k {top_k} must be in 1..={population}")]
    InvalidTopK { top_k: usize, population: usize },
    #[error("Mutation probability {0} must be in [0, 1]")]
    InvalidMutationProb(f64),
    #[error("Crossover probabilities must not be empty")]
    EmptyCrossoverProb,
    #[error("Crossover probability {0} must be in [0, 1]")]
    CrossoverProbOutOfRange(f64),
    #[error("Crossover probabilities sum to {0}, expected 1")]
    CrossoverProbSum(f64),
    #[error("{probs} crossover probabilities but only {top_k} parents are selected")]
    TooManyCrossoverParents { probs: usize, top_k: usize },
    #[error("Oscillator count must be non-zero")]
    NoOscillators,
    #[error("Worker count must be non-zero")]
    NoWorkers,
    #[error("Evaluator program must be set")]
    MissingEvaluator,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(EvolverConfig::default().validate().is_ok());
    }

    #[test]
    fn test_crossover_prob_validation() {
        assert!(validate_crossover_prob(&[1.0]).is_ok());
        assert!(validate_crossover_prob(&[0.25, 0.25, 0.5]).is_ok());
        assert!(matches!(
            validate_crossover_prob(&[]),
            Err(ConfigError::EmptyCrossoverProb)
        ));
        assert!(matches!(
            validate_crossover_prob(&[1.5, -0.5]),
            Err(ConfigError::CrossoverProbOutOfRange(_))
        ));
        assert!(matches!(
            validate_crossover_prob(&[0.5, 0.4]),
            Err(ConfigError::CrossoverProbSum(_))
        ));
    }

    #[test]
    fn test_top_k_bounds() {
        let config = EvolverConfig {
            population_size: 4,
            top_k: 5,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTopK { .. })
        ));
    }

    #[test]
    fn test_effective_workers_clamped() {
        let config = EvolverConfig {
            population_size: 3,
            workers: 8,
            ..Default::default()
        };
        assert_eq!(config.effective_workers(), 3);
    }

    #[test]
    fn test_minimal_json_uses_defaults() {
        let config: EvolverConfig =
            serde_json::from_str(r#"{ "trial": 7, "method": "avg" }"#).unwrap();
        assert_eq!(config.trial, 7);
        assert_eq!(config.method, RecombinationMethod::Avg);
        assert_eq!(config.population_size, default_population_size());
        assert_eq!(config.missing_fitness, MissingFitnessPolicy::Exclude);
    }
}
