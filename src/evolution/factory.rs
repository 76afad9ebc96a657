//! CPG construction, recombination and mutation.

use std::sync::Arc;

use crate::schema::{
    Constants, EvolverConfig, Genes, Individual, IndividualMeta, IndividualRecord, Matrix,
    RecombinationMethod, validate_crossover_prob,
};

use super::EvolutionError;
use super::rng::GenomeRng;

/// Builds individuals that all share one oscillator count and one constants block.
#[derive(Debug, Clone)]
pub struct CpgFactory {
    n: usize,
    constants: Arc<Constants>,
}

impl CpgFactory {
    /// Factory for `n` oscillators, the first `body_oscillators` of which are body oscillators.
    pub fn new(n: usize, body_oscillators: usize) -> Self {
        Self {
            n,
            constants: Arc::new(Constants::new(n, body_oscillators)),
        }
    }

    pub fn from_config(config: &EvolverConfig) -> Self {
        Self::new(config.oscillators, config.body_oscillators)
    }

    #[inline]
    pub fn n(&self) -> usize {
        self.n
    }

    /// The shared constants block.
    pub fn constants(&self) -> &Arc<Constants> {
        &self.constants
    }

    fn assemble(&self, ident: String, genes: Genes) -> Individual {
        Individual {
            meta: IndividualMeta { ident, n: self.n },
            genes,
            constants: Arc::clone(&self.constants),
        }
    }

    /// Random individual: every gene drawn uniformly from [0, 1).
    pub fn make(&self, rng: &mut GenomeRng, ident: impl Into<String>) -> Individual {
        let mut genes = Genes::zeros(self.n);
        for field in genes.fields_mut() {
            for value in field.iter_mut() {
                *value = rng.unit();
            }
        }
        self.assemble(ident.into(), genes)
    }

    /// Combine `parents` (sorted worst first) into one mutated offspring.
    ///
    /// `crossover_prob` must sum to one. Under crossover it applies to the last
    /// `crossover_prob.len()` parents; averaging ignores it. Nothing is produced
    /// if any argument is invalid.
    pub fn mix(
        &self,
        rng: &mut GenomeRng,
        parents: &[&Individual],
        ident: impl Into<String>,
        method: RecombinationMethod,
        mutation_prob: f64,
        crossover_prob: &[f64],
    ) -> Result<Individual, EvolutionError> {
        if parents.is_empty() {
            return Err(EvolutionError::InvalidArgument(
                "cannot mix an empty parent list".to_string(),
            ));
        }
        validate_crossover_prob(crossover_prob)
            .map_err(|e| EvolutionError::InvalidArgument(e.to_string()))?;
        if method == RecombinationMethod::Crossover && crossover_prob.len() > parents.len() {
            return Err(EvolutionError::InvalidArgument(format!(
                "{} crossover probabilities for {} parents",
                crossover_prob.len(),
                parents.len()
            )));
        }
        if !(0.0..=1.0).contains(&mutation_prob) {
            return Err(EvolutionError::InvalidArgument(format!(
                "mutation probability {mutation_prob} outside [0, 1]"
            )));
        }

        let mut genes = Genes::zeros(self.n);
        if let Some(p) = parents.iter().find(|p| !p.genes.same_shape(&genes)) {
            return Err(EvolutionError::InvalidArgument(format!(
                "mismatched field shapes: parent {} has n = {}, expected {}",
                p.ident(),
                p.n(),
                self.n
            )));
        }

        let parent_fields: Vec<[&[f64]; 10]> = parents.iter().map(|p| p.genes.fields()).collect();

        match method {
            RecombinationMethod::Avg => {
                let count = parents.len() as f64;
                for (f, field) in genes.fields_mut().into_iter().enumerate() {
                    for (j, value) in field.iter_mut().enumerate() {
                        *value = parent_fields.iter().map(|p| p[f][j]).sum::<f64>() / count;
                    }
                }
            }
            RecombinationMethod::Crossover => {
                let donors = &parent_fields[parents.len() - crossover_prob.len()..];
                let cumulative: Vec<f64> = crossover_prob
                    .iter()
                    .scan(0.0, |acc, p| {
                        *acc += p;
                        Some(*acc)
                    })
                    .collect();
                let last = donors.len() - 1;

                for (f, field) in genes.fields_mut().into_iter().enumerate() {
                    for (j, value) in field.iter_mut().enumerate() {
                        let r = rng.unit();
                        let donor = cumulative.iter().position(|&c| c > r).unwrap_or(last);
                        *value = donors[donor][f][j];
                    }
                }
            }
        }

        mutate(rng, &mut genes, mutation_prob);

        Ok(self.assemble(ident.into(), genes))
    }

    /// Rebuild an individual from its decoded record.
    ///
    /// Arrays become dense buffers and the factory's own constants block is
    /// attached. Round-tripping the result through [`Individual::to_record`]
    /// and back yields the same individual.
    pub fn deserialize(&self, record: IndividualRecord) -> Result<Individual, EvolutionError> {
        let n = self.n;
        let mismatch = |what: &str| {
            EvolutionError::InvalidArgument(format!(
                "individual {}: mismatched field shapes ({what}, expected n = {n})",
                record.ident
            ))
        };

        if record.n != n {
            return Err(mismatch("n"));
        }
        if record.constants != *self.constants {
            return Err(EvolutionError::InvalidArgument(format!(
                "individual {}: constants block differs from this run's",
                record.ident
            )));
        }

        let w = dense_square(record.w, n).ok_or_else(|| mismatch("w"))?;
        let phi = dense_square(record.phi, n).ok_or_else(|| mismatch("phi"))?;
        for (name, v) in [
            ("a", &record.a),
            ("theta", &record.theta),
            ("ampl", &record.ampl),
            ("ampl_dot", &record.ampl_dot),
        ] {
            if v.len() != n {
                return Err(mismatch(name));
            }
        }

        let genes = Genes {
            w,
            phi,
            a: record.a,
            gsl: record.gsl,
            gsh: record.gsh,
            gb1: record.gb1,
            gb2: record.gb2,
            theta: record.theta,
            ampl: record.ampl,
            ampl_dot: record.ampl_dot,
        };

        Ok(self.assemble(record.ident, genes))
    }
}

/// Per-gene mutation: with probability `mutation_prob`, scale by a fresh uniform draw.
fn mutate(rng: &mut GenomeRng, genes: &mut Genes, mutation_prob: f64) {
    for field in genes.fields_mut() {
        for value in field.iter_mut() {
            if rng.unit() <= mutation_prob {
                *value *= rng.unit();
            }
        }
    }
}

fn dense_square(rows: Vec<Vec<f64>>, n: usize) -> Option<Matrix> {
    Matrix::from_rows(rows).filter(|m| m.shape() == (n, n))
}
