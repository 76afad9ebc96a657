//! Population storage and the trial directory protocol.
//!
//! ```text
//! <root>/trial<T>/gen<G>/<ident>.enc      one individual
//! <root>/trial<T>/gen<G>/total<P>.fit     one partition's fitness table
//! <root>/trial<T>/dump.json               controller snapshot on failure
//! ```

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use rayon::prelude::*;

use crate::schema::{Individual, IndividualRecord};

use super::EvolutionError;
use super::factory::CpgFactory;
use super::rng::GenomeRng;

const INDIVIDUAL_EXT: &str = "enc";
const FITNESS_PREFIX: &str = "total";
const FITNESS_EXT: &str = "fit";

/// Order identities numerically when both are numbers, lexicographically otherwise.
pub fn ident_cmp(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// The individuals of one generation, keyed by identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Population {
    members: HashMap<String, Individual>,
}

impl Population {
    /// Empty population.
    pub fn new() -> Self {
        Self::default()
    }

    /// `size` random individuals keyed `"0"..size`.
    ///
    /// One sub-seed per individual is drawn from `rng` in identity order, so the
    /// result does not depend on how the work is scheduled.
    pub fn generate(factory: &CpgFactory, rng: &mut GenomeRng, size: usize) -> Self {
        let seeds: Vec<u64> = (0..size).map(|_| rng.next_seed()).collect();
        seeds
            .into_par_iter()
            .enumerate()
            .map(|(i, seed)| factory.make(&mut GenomeRng::new(seed), i.to_string()))
            .collect::<Vec<_>>()
            .into_iter()
            .collect()
    }

    /// Insert an individual, replacing any previous one with the same identity.
    pub fn insert(&mut self, individual: Individual) -> Option<Individual> {
        self.members
            .insert(individual.ident().to_string(), individual)
    }

    pub fn get(&self, ident: &str) -> Option<&Individual> {
        self.members.get(ident)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members in identity order.
    pub fn ordered(&self) -> Vec<&Individual> {
        let mut members: Vec<&Individual> = self.members.values().collect();
        members.sort_by(|a, b| ident_cmp(a.ident(), b.ident()));
        members
    }

    /// Identities in identity order.
    pub fn idents(&self) -> Vec<&str> {
        self.ordered().into_iter().map(Individual::ident).collect()
    }

    /// Records in identity order, for snapshots.
    pub fn to_records(&self) -> Vec<IndividualRecord> {
        self.ordered().into_iter().map(Individual::to_record).collect()
    }

    /// Rebuild from records through the factory.
    pub fn from_records(
        factory: &CpgFactory,
        records: Vec<IndividualRecord>,
    ) -> Result<Self, EvolutionError> {
        records
            .into_iter()
            .map(|r| factory.deserialize(r))
            .collect()
    }
}

impl FromIterator<Individual> for Population {
    fn from_iter<I: IntoIterator<Item = Individual>>(iter: I) -> Self {
        let mut population = Population::new();
        for individual in iter {
            population.insert(individual);
        }
        population
    }
}

/// Filesystem side of one trial.
#[derive(Debug, Clone)]
pub struct TrialStore {
    root: PathBuf,
    trial: u32,
}

impl TrialStore {
    pub fn new<P: AsRef<Path>>(root: P, trial: u32) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            trial,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn trial(&self) -> u32 {
        self.trial
    }

    pub fn trial_dir(&self) -> PathBuf {
        self.root.join(format!("trial{}", self.trial))
    }

    pub fn generation_dir(&self, generation: usize) -> PathBuf {
        self.trial_dir().join(format!("gen{generation}"))
    }

    pub fn individual_path(&self, generation: usize, ident: &str) -> PathBuf {
        self.generation_dir(generation)
            .join(format!("{ident}.{INDIVIDUAL_EXT}"))
    }

    pub fn fitness_path(&self, generation: usize, partition: usize) -> PathBuf {
        self.generation_dir(generation)
            .join(format!("{FITNESS_PREFIX}{partition}.{FITNESS_EXT}"))
    }

    pub fn dump_path(&self) -> PathBuf {
        self.trial_dir().join("dump.json")
    }

    /// Whether the trial has been started before.
    pub fn exists(&self) -> bool {
        self.trial_dir().is_dir()
    }

    /// Highest `gen<G>` directory of the trial, if any.
    pub fn latest_generation(&self) -> io::Result<Option<usize>> {
        let dir = self.trial_dir();
        if !dir.is_dir() {
            return Ok(None);
        }
        let mut latest = None;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if let Some(g) = name
                .to_str()
                .and_then(|s| s.strip_prefix("gen"))
                .and_then(|s| s.parse::<usize>().ok())
            {
                latest = latest.max(Some(g));
            }
        }
        Ok(latest)
    }

    /// Partition fitness files present in a generation directory, by partition index.
    pub fn fitness_files(&self, generation: usize) -> io::Result<Vec<(usize, PathBuf)>> {
        self.scan(generation, |stem, ext| {
            if ext != FITNESS_EXT {
                return None;
            }
            stem.strip_prefix(FITNESS_PREFIX)?.parse::<usize>().ok()
        })
    }

    /// Individual files present in a generation directory.
    pub fn individual_files(&self, generation: usize) -> io::Result<Vec<PathBuf>> {
        Ok(self
            .scan(generation, |_, ext| (ext == INDIVIDUAL_EXT).then_some(()))?
            .into_iter()
            .map(|(_, path)| path)
            .collect())
    }

    fn scan<T: Ord, F>(&self, generation: usize, classify: F) -> io::Result<Vec<(T, PathBuf)>>
    where
        F: Fn(&str, &str) -> Option<T>,
    {
        let dir = self.generation_dir(generation);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let (Some(stem), Some(ext)) = (
                path.file_stem().and_then(|s| s.to_str()),
                path.extension().and_then(|s| s.to_str()),
            ) else {
                continue;
            };
            if let Some(key) = classify(stem, ext) {
                found.push((key, path));
            }
        }
        found.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Ok(found)
    }

    /// Write one individual to `gen<G>/<ident>.enc`, creating the directory if needed.
    pub fn write_individual(
        &self,
        generation: usize,
        individual: &Individual,
    ) -> Result<PathBuf, EvolutionError> {
        fs::create_dir_all(self.generation_dir(generation))?;
        let path = self.individual_path(generation, individual.ident());
        let json = serde_json::to_vec(&individual.to_record())?;
        write_atomic(&path, &json)?;
        Ok(path)
    }

    /// Write a whole population, after clearing stale fitness files from the directory.
    pub fn write_population(
        &self,
        generation: usize,
        population: &Population,
    ) -> Result<(), EvolutionError> {
        fs::create_dir_all(self.generation_dir(generation))?;
        for (partition, path) in self.fitness_files(generation)? {
            debug!("Removing stale fitness file for partition {partition}");
            fs::remove_file(path)?;
        }
        population
            .ordered()
            .par_iter()
            .try_for_each(|individual| self.write_individual(generation, individual).map(|_| ()))
    }

    /// Read one individual file.
    pub fn read_individual<P: AsRef<Path>>(
        &self,
        factory: &CpgFactory,
        path: P,
    ) -> Result<Individual, EvolutionError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                EvolutionError::MissingData(format!("individual file {}", path.display()))
            } else {
                EvolutionError::Io(e)
            }
        })?;
        let record: IndividualRecord = serde_json::from_str(&content)?;
        factory.deserialize(record)
    }

    /// Load every individual written for a generation.
    pub fn load_generation(
        &self,
        factory: &CpgFactory,
        generation: usize,
    ) -> Result<Population, EvolutionError> {
        let population: Population = self
            .individual_files(generation)?
            .par_iter()
            .map(|path| self.read_individual(factory, path))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .collect();
        if population.is_empty() {
            warn!(
                "Generation {generation} of trial {} holds no individuals",
                self.trial
            );
        }
        Ok(population)
    }
}

/// Write through a temporary sibling and rename, so readers never see a partial file.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}
